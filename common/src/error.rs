use thiserror::Error;

/// 协议层错误
///
/// 这些错误只影响单条消息：调用方记录日志后丢弃该消息，连接保持打开。
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message tag: {0}")]
    UnknownTag(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid binary frame: {0}")]
    InvalidBinaryFrame(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
