use thiserror::Error;

/// Errors raised by candle buffer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("insufficient candle data: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },
}
