//! 错误定义模块

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    /// 源文件长度小于声明的像素范围，不做补零
    #[error("源文件被截断: {path} 声明需要 {declared} 字节, 实际只有 {actual} 字节")]
    TruncatedSource {
        path: String,
        declared: u64,
        actual: u64,
    },

    #[error("数据损坏: {0}")]
    DataCorrupt(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("会话状态无效: 在 {state} 状态下不允许 {operation}")]
    InvalidSessionState { state: String, operation: String },

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("约束冲突: {0}")]
    ConstraintViolation(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 错误类别，可跨客户端/服务端边界传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TruncatedSource,
    DataCorrupt,
    Configuration,
    InvalidSessionState,
    Transport,
    ConstraintViolation,
    Database,
    DicomParse,
    Storage,
    Io,
    Serialization,
    Validation,
    NotFound,
    Internal,
}

/// 服务端返回的错误体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PacsError> for ErrorBody {
    fn from(err: &PacsError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorBody> for PacsError {
    fn from(body: ErrorBody) -> Self {
        PacsError::from_kind(body.kind, body.message)
    }
}

impl PacsError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn data_corrupt(msg: impl Into<String>) -> Self {
        Self::DataCorrupt(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn invalid_state(state: impl std::fmt::Debug, operation: &str) -> Self {
        Self::InvalidSessionState {
            state: format!("{:?}", state),
            operation: operation.to_string(),
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            PacsError::TruncatedSource { .. } => ErrorKind::TruncatedSource,
            PacsError::DataCorrupt(_) => ErrorKind::DataCorrupt,
            PacsError::Configuration(_) => ErrorKind::Configuration,
            PacsError::InvalidSessionState { .. } => ErrorKind::InvalidSessionState,
            PacsError::Transport(_) => ErrorKind::Transport,
            PacsError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            PacsError::Database(_) => ErrorKind::Database,
            PacsError::DicomParseError(_) => ErrorKind::DicomParse,
            PacsError::Storage(_) => ErrorKind::Storage,
            PacsError::Io(_) => ErrorKind::Io,
            PacsError::Serialization(_) => ErrorKind::Serialization,
            PacsError::Validation(_) => ErrorKind::Validation,
            PacsError::NotFound(_) => ErrorKind::NotFound,
            PacsError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 根据错误类别和消息重建错误（用于远程调用返回）
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::TruncatedSource => PacsError::TruncatedSource {
                path: message,
                declared: 0,
                actual: 0,
            },
            ErrorKind::DataCorrupt => PacsError::DataCorrupt(message),
            ErrorKind::Configuration => PacsError::Configuration(message),
            ErrorKind::InvalidSessionState => PacsError::InvalidSessionState {
                state: "remote".to_string(),
                operation: message,
            },
            ErrorKind::Transport => PacsError::Transport(message),
            ErrorKind::ConstraintViolation => PacsError::ConstraintViolation(message),
            ErrorKind::Database => PacsError::Database(message),
            ErrorKind::DicomParse => PacsError::DicomParseError(message),
            ErrorKind::Storage => PacsError::Storage(message),
            ErrorKind::Io => PacsError::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
            ErrorKind::Serialization => PacsError::Internal(message),
            ErrorKind::Validation => PacsError::Validation(message),
            ErrorKind::NotFound => PacsError::NotFound(message),
            ErrorKind::Internal => PacsError::Internal(message),
        }
    }

    /// 传输失败可以重试，数据损坏不应重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, PacsError::Transport(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PacsError {
    fn from(e: sqlx::Error) -> Self {
        PacsError::Database(e.to_string())
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
