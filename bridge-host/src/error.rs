use bridge_engine::EngineError;
use thiserror::Error;

/// Errors of the engine host process
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Frame(#[from] serde_json::Error),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
