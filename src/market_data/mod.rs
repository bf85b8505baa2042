pub mod buffer_manager;
pub mod candle_buffer;
pub mod metrics;
pub mod ticker;
pub mod timeframe;

pub use buffer_manager::{
    BackfillFailure, BackfillOptions, BackfillReport, BufferManager, KlineSource, WarmupStatus,
};
pub use candle_buffer::{Candle, CandleBuffer, CANDLE_CAPACITY};
pub use metrics::{DominanceRatios, MetricsCalculator, PartialChangeMetrics, WindowMetrics};
pub use ticker::Ticker;
pub use timeframe::Timeframe;
