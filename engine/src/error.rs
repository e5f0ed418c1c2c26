use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Accounting hook error: {0}")]
    Hook(String),

    #[error("Stats error: {0}")]
    Stats(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
