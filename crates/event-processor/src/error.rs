//! 事件处理服务错误类型

use storefront_shared::error::ShopError;
use thiserror::Error;

/// 事件处理错误
///
/// 分为两类：业务规则错误（库存不足、记录不存在等，重试不会改变结果）
/// 和基础设施错误（统一包装在 `Shared` 中，由任务层退避重试）。
/// 处理管道据此决定走"审计失败 + 失败通知"还是"重试"路径。
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("订单行项目为空，无法创建订单")]
    EmptyOrder,

    #[error("商品不存在: {product_id}")]
    ProductNotFound { product_id: String },

    #[error("商品已存在: {product_id}")]
    ProductExists { product_id: String },

    #[error("库存不足: {product_name} 需要 {requested}, 剩余 {available}")]
    InsufficientStock {
        product_name: String,
        requested: i32,
        available: i32,
    },

    #[error("订单不存在: {order_id}")]
    OrderNotFound { order_id: i64 },

    #[error("事件载荷无效: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Shared(#[from] ShopError),
}

impl ProcessorError {
    /// 是否为业务规则错误
    ///
    /// 业务错误的结局是确定的：审计为失败并通知用户，不重试。
    /// 注意 `Shared` 中也可能混入不可重试的错误（如序列化失败），
    /// 它们会在任务层重试耗尽后进入死信队列，由人工判断。
    pub fn is_business(&self) -> bool {
        !matches!(self, Self::Shared(_))
    }

    /// 是否为可重试的瞬时故障
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Shared(e) if e.is_retryable())
    }
}
