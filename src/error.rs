use serde::{Deserialize, Serialize};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

/// 服务器错误类型
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum ServerError {
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(String),
    /// 资源未找到
    #[error("Not found: {0}")]
    NotFound(String),
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),
    /// 共享存储（Redis）错误
    #[error("Store error: {0}")]
    Store(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 生成服务调用失败
    #[error("Generation error: {0}")]
    Generation(String),
    /// 资源不足
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 服务不可用
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ServerError {
    /// 是否属于可重试的存储/连接类错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerError::Store(_) | ServerError::Database(_) | ServerError::Timeout(_)
        )
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status_code = match &self {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::ServiceUnavailable(_) | ServerError::Store(_) | ServerError::Database(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServerError::Generation(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error_response = ErrorResponse::new(&self);
        (status_code, Json(error_response)).into_response()
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for ServerError {
    fn from(err: redis::RedisError) -> Self {
        ServerError::Store(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for ServerError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        ServerError::Store(format!("Failed to get Redis connection: {}", err))
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        ServerError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServerError::Timeout(err.to_string())
        } else {
            ServerError::Generation(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServerError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 内部错误
    Internal = 1000,
    /// 验证错误
    Validation = 1003,
    /// 数据库错误
    Database = 2000,
    /// 存储错误
    Store = 2001,
    /// 序列化错误
    Serialization = 2002,
    /// 配置错误
    Configuration = 2003,
    /// 资源不足
    ResourceExhausted = 3001,
    /// 超时错误
    Timeout = 3002,
    /// 生成服务错误
    Generation = 3003,
    /// 服务不可用
    ServiceUnavailable = 5000,
    /// 资源未找到
    NotFound = 5005,
}

impl From<&ServerError> for ErrorCode {
    fn from(error: &ServerError) -> Self {
        match error {
            ServerError::Internal(_) => ErrorCode::Internal,
            ServerError::Validation(_) => ErrorCode::Validation,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::Database(_) => ErrorCode::Database,
            ServerError::Store(_) => ErrorCode::Store,
            ServerError::Serialization(_) => ErrorCode::Serialization,
            ServerError::Configuration(_) => ErrorCode::Configuration,
            ServerError::Generation(_) => ErrorCode::Generation,
            ServerError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            ServerError::Timeout(_) => ErrorCode::Timeout,
            ServerError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
        }
    }
}

/// 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息
    pub message: String,
    /// 详细信息
    pub details: Option<String>,
    /// 时间戳
    pub timestamp: u64,
}

impl ErrorResponse {
    /// 创建错误响应
    pub fn new(error: &ServerError) -> Self {
        Self {
            code: ErrorCode::from(error),
            message: error.to_string(),
            details: None,
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }

    /// 创建带详细信息的错误响应
    pub fn with_details(error: &ServerError, details: String) -> Self {
        Self {
            details: Some(details),
            ..Self::new(error)
        }
    }
}
