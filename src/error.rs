use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("feed unreachable after {attempts} reconnect attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Transport failures are retried by the connection manager; everything
    /// else ends the feed loop immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Transport(_) | AppError::WebSocket(_) | AppError::Io(_))
    }
}
