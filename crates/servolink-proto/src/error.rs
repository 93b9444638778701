use thiserror::Error;

/// Errors produced by the wire codec and framing layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("frame too large: {0} bytes")]
    Oversized(usize),
    #[error("truncated input while decoding {0}")]
    Truncated(&'static str),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("invalid numeric array: {0}")]
    BadArray(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the RPC client and server.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unauthorized: invalid API token")]
    Unauthorized,
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl RpcError {
    /// Classifies a `{error}` reply string into the matching error kind.
    pub fn from_reply(message: String) -> Self {
        if message.starts_with("Unauthorized") {
            RpcError::Unauthorized
        } else if let Some(name) = message.strip_prefix("unknown endpoint: ") {
            RpcError::UnknownEndpoint(name.to_string())
        } else {
            RpcError::Server(message)
        }
    }

    /// True for errors that the client recovers from by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Transport(_))
    }
}
