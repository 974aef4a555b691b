//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum ShopError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("记录已存在: {entity} {field}={value}")]
    AlreadyExists {
        entity: String,
        field: String,
        value: String,
    },

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 序列化错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ShopError>;

impl ShopError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 基础设施层的瞬时故障（数据库、Kafka、外部服务）可通过重试恢复；
    /// 记录不存在、序列化失败这类确定性错误重试也不会改变结果。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Kafka(_)
                | Self::ExternalService { .. }
                | Self::ExternalServiceTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = ShopError::NotFound {
            entity: "Product".to_string(),
            id: "prod-001".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = ShopError::AlreadyExists {
            entity: "Product".to_string(),
            field: "id".to_string(),
            value: "prod-001".to_string(),
        };
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = ShopError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let kafka_err = ShopError::Kafka("broker unreachable".to_string());
        assert!(kafka_err.is_retryable());

        // 序列化失败是确定性错误，重试结果不会改变
        let ser_err = ShopError::Serialization("字段缺失".to_string());
        assert!(!ser_err.is_retryable());

        let not_found = ShopError::NotFound {
            entity: "Order".to_string(),
            id: "42".to_string(),
        };
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = ShopError::NotFound {
            entity: "Product".to_string(),
            id: "prod-001".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Product"));
        assert!(msg.contains("prod-001"));
    }
}
