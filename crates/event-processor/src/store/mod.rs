//! 存储层抽象
//!
//! 商品、订单、事件审计日志、Saga 步骤日志四类存储的领域模型与 trait 定义。
//! 生产环境使用 `pg` 模块的 PostgreSQL 实现（三个独立数据库），
//! 测试使用 `memory` 模块的内存实现，二者保证相同的原子性语义。

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storefront_shared::error::ShopError;
use storefront_shared::events::ProductChanges;

// ---------------------------------------------------------------------------
// 领域模型 — 商品
// ---------------------------------------------------------------------------

/// 商品
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub image: Option<String>,
    pub category: Option<String>,
    pub stock: i32,
    pub sizes: Vec<String>,
    pub colors: Vec<String>,
    pub is_new_arrival: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 领域模型 — 订单
// ---------------------------------------------------------------------------

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for OrderStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "shipped" => Ok(Self::Shipped),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("无效的订单状态: {other}")),
        }
    }
}

/// 订单（含行项目）
#[derive(Debug, Clone)]
pub struct Order {
    pub id: i64,
    pub user_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_address: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub tracking_number: Option<String>,
    pub shipped_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

/// 订单行项目
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: String,
    pub product_name: String,
    pub product_price: f64,
    pub product_image: Option<String>,
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
}

/// 待创建订单
///
/// `event_id` 来自触发下单的事件信封，在订单表上有唯一约束——
/// 同一事件重复落库时取回已存在的订单而非创建副本。
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub event_id: String,
    pub user_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_address: String,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub items: Vec<NewOrderItem>,
}

/// 待创建订单的行项目
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: String,
    pub product_name: String,
    pub product_price: f64,
    pub product_image: Option<String>,
    pub quantity: i32,
    pub size: Option<String>,
    pub color: Option<String>,
}

// ---------------------------------------------------------------------------
// 领域模型 — 事件审计日志
// ---------------------------------------------------------------------------

/// 事件最终处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

/// 事件审计日志条目
///
/// 每个已处理事件（成功或失败）恰好一条，以 event_id 唯一约束兜底幂等。
/// 写入后不再修改。
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub event_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: Value,
    pub status: EventStatus,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// 领域模型 — Saga 步骤日志
// ---------------------------------------------------------------------------

/// 下单 Saga 的持久化步骤
///
/// 每完成一个有副作用的步骤立即追加一条记录；重放步骤序列即可还原
/// Saga 的净状态：`Compensated` 清空此前的全部预占记录。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStep {
    /// 某商品的库存已原子扣减
    #[serde(rename_all = "camelCase")]
    StockReserved { product_id: String, quantity: i32 },
    /// 此前的全部预占已回补
    Compensated,
    /// 订单已落库
    #[serde(rename_all = "camelCase")]
    OrderPersisted { order_id: i64 },
}

// ---------------------------------------------------------------------------
// 存储 trait
// ---------------------------------------------------------------------------

/// 商品存储
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn insert(&self, product: Product) -> Result<(), ShopError>;

    async fn get(&self, product_id: &str) -> Result<Option<Product>, ShopError>;

    /// 部分更新：changes 中缺失的字段保持原值。商品不存在返回 None
    async fn apply_changes(
        &self,
        product_id: &str,
        changes: &ProductChanges,
    ) -> Result<Option<Product>, ShopError>;

    /// 删除商品，返回是否确有删除
    async fn delete(&self, product_id: &str) -> Result<bool, ShopError>;

    /// 条件扣减库存
    ///
    /// 仅当剩余库存足够时原子扣减（单条 UPDATE 带 stock >= quantity 条件），
    /// 返回扣减后的剩余库存；库存不足或商品不存在返回 None。
    /// 先校验后扣减的竞态由此关闭：两个并发订单抢同一份库存时只有一个成功。
    async fn try_reserve(&self, product_id: &str, quantity: i32)
    -> Result<Option<i32>, ShopError>;

    /// 回补库存（补偿 / 取消订单 / 入库），返回新库存；商品不存在返回 None
    async fn restock(&self, product_id: &str, quantity: i32) -> Result<Option<i32>, ShopError>;
}

/// 订单存储
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 在一个事务中创建订单及其全部行项目
    ///
    /// 以 event_id 幂等：同一事件重复创建返回已存在的订单。
    async fn create(&self, order: NewOrder) -> Result<Order, ShopError>;

    async fn get(&self, order_id: i64) -> Result<Option<Order>, ShopError>;

    /// 更新订单状态，返回订单是否存在
    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<bool, ShopError>;

    /// 标记发货并记录运单信息，返回订单是否存在
    async fn mark_shipped(
        &self,
        order_id: i64,
        tracking_number: Option<&str>,
        shipped_by: Option<&str>,
    ) -> Result<bool, ShopError>;
}

/// 事件审计日志存储
#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn exists(&self, event_id: &str) -> Result<bool, ShopError>;

    /// 幂等写入：event_id 冲突时静默跳过，返回是否真正插入。
    /// 冲突不是错误——它意味着另一个消费者抢先完成了同一事件。
    async fn record_once(&self, entry: EventLogEntry) -> Result<bool, ShopError>;
}

/// Saga 步骤日志存储
#[async_trait]
pub trait SagaLogStore: Send + Sync {
    async fn append(&self, event_id: &str, step: &SagaStep) -> Result<(), ShopError>;

    /// 按写入顺序加载某事件的全部步骤
    async fn load(&self, event_id: &str) -> Result<Vec<SagaStep>, ShopError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            let parsed = OrderStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }

        assert!(OrderStatus::try_from("unknown".to_string()).is_err());
    }

    #[test]
    fn test_saga_step_wire_format() {
        let step = SagaStep::StockReserved {
            product_id: "prod-001".to_string(),
            quantity: 2,
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"step\":\"STOCK_RESERVED\""));
        assert!(json.contains("\"productId\":\"prod-001\""));

        let parsed: SagaStep = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, step);

        let compensated = serde_json::to_string(&SagaStep::Compensated).unwrap();
        assert!(compensated.contains("\"step\":\"COMPENSATED\""));

        let persisted: SagaStep =
            serde_json::from_str(r#"{"step":"ORDER_PERSISTED","orderId":42}"#).unwrap();
        assert_eq!(persisted, SagaStep::OrderPersisted { order_id: 42 });
    }
}
