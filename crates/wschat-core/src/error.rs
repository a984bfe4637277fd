use thiserror::Error;

/// Errors produced by the wschat protocol and server layers.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Close status code to send before dropping a connection that failed
    /// with this error, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ChatError::Protocol(_) => Some(crate::frame::CLOSE_PROTOCOL_ERROR),
            ChatError::MessageTooLarge(_) => Some(crate::frame::CLOSE_TOO_BIG),
            _ => None,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
