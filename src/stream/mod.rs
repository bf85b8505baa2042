pub mod backoff;
pub mod connector;
pub mod messages;

pub use backoff::ReconnectPolicy;
pub use connector::{
    ConnectorConfig, ConnectorEvent, KlineUpdate, StreamConnector, DEFAULT_WS_URL,
    MAX_STREAMS_PER_CONNECTION,
};
pub use messages::{kline_stream, StreamMessage, TICKER_ARRAY_STREAM};
