//! 事件模型
//!
//! 定义商城事件管道的统一信封格式、事件类型分类与各事件的业务载荷。
//! 线上格式为 camelCase JSON，与上游各服务约定保持一致；
//! 事件类型使用 SCREAMING_SNAKE_CASE 字符串。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::kafka::topics;

// ---------------------------------------------------------------------------
// EventType — 事件类型枚举
// ---------------------------------------------------------------------------

/// 事件类型枚举
///
/// 按业务域划分为库存、订单、购物车三类，另有一组通知结果类型
/// （`*_SUCCESS` / `*_FAILED`）由本服务产出、发往通知 topic。
/// 未识别的线上取值统一落入 `Unknown`，由处理层记录日志后跳过，
/// 保证新增事件类型不会打断旧版本消费者。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // 库存类事件 — 商品目录与库存的增删改
    InventoryItemAdded,
    InventoryItemUpdated,
    InventoryItemDeleted,
    InventoryStockReduced,
    InventoryStockIncreased,

    // 订单类事件 — 订单生命周期流转
    OrderCreated,
    OrderConfirmed,
    OrderShipped,
    OrderDelivered,
    OrderCancelled,

    // 购物车事件 — 下单成功后请求清空购物车
    CartClearRequested,

    // 通知结果事件 — 由事件处理服务产出，发往 notification-events
    OrderCreatedSuccess,
    OrderCreatedFailed,
    ItemCreatedSuccess,
    ItemCreatedFailed,
    ItemUpdatedSuccess,
    ItemUpdatedFailed,
    ItemDeletedSuccess,
    ItemDeletedFailed,
    StockReducedSuccess,
    StockReducedFailed,
    StockIncreasedSuccess,
    StockIncreasedFailed,

    // 向前兼容：未识别的事件类型
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// 库存类事件由库存服务产出，会改动商品表
    pub fn is_inventory(&self) -> bool {
        matches!(
            self,
            Self::InventoryItemAdded
                | Self::InventoryItemUpdated
                | Self::InventoryItemDeleted
                | Self::InventoryStockReduced
                | Self::InventoryStockIncreased
        )
    }

    /// 订单类事件由订单服务产出，驱动订单状态机与下单 Saga
    pub fn is_order(&self) -> bool {
        matches!(
            self,
            Self::OrderCreated
                | Self::OrderConfirmed
                | Self::OrderShipped
                | Self::OrderDelivered
                | Self::OrderCancelled
        )
    }

    /// 通知结果事件由本服务产出，供通知网关消费
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            Self::OrderCreatedSuccess
                | Self::OrderCreatedFailed
                | Self::ItemCreatedSuccess
                | Self::ItemCreatedFailed
                | Self::ItemUpdatedSuccess
                | Self::ItemUpdatedFailed
                | Self::ItemDeletedSuccess
                | Self::ItemDeletedFailed
                | Self::StockReducedSuccess
                | Self::StockReducedFailed
                | Self::StockIncreasedSuccess
                | Self::StockIncreasedFailed
        )
    }

    /// 事件的原始 topic，用于死信队列的重投递路由
    pub fn source_topic(&self) -> Option<&'static str> {
        if self.is_inventory() {
            Some(topics::INVENTORY_EVENTS)
        } else if self.is_order() {
            Some(topics::ORDER_EVENTS)
        } else if self.is_notification() {
            Some(topics::NOTIFICATION_EVENTS)
        } else if matches!(self, Self::CartClearRequested) {
            Some(topics::CART_EVENTS)
        } else {
            None
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 与 serde 的 SCREAMING_SNAKE_CASE 序列化保持一致，
        // 便于在日志、审计表和 Kafka key 中统一引用
        let s = match self {
            Self::InventoryItemAdded => "INVENTORY_ITEM_ADDED",
            Self::InventoryItemUpdated => "INVENTORY_ITEM_UPDATED",
            Self::InventoryItemDeleted => "INVENTORY_ITEM_DELETED",
            Self::InventoryStockReduced => "INVENTORY_STOCK_REDUCED",
            Self::InventoryStockIncreased => "INVENTORY_STOCK_INCREASED",
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderConfirmed => "ORDER_CONFIRMED",
            Self::OrderShipped => "ORDER_SHIPPED",
            Self::OrderDelivered => "ORDER_DELIVERED",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::CartClearRequested => "CART_CLEAR_REQUESTED",
            Self::OrderCreatedSuccess => "ORDER_CREATED_SUCCESS",
            Self::OrderCreatedFailed => "ORDER_CREATED_FAILED",
            Self::ItemCreatedSuccess => "ITEM_CREATED_SUCCESS",
            Self::ItemCreatedFailed => "ITEM_CREATED_FAILED",
            Self::ItemUpdatedSuccess => "ITEM_UPDATED_SUCCESS",
            Self::ItemUpdatedFailed => "ITEM_UPDATED_FAILED",
            Self::ItemDeletedSuccess => "ITEM_DELETED_SUCCESS",
            Self::ItemDeletedFailed => "ITEM_DELETED_FAILED",
            Self::StockReducedSuccess => "STOCK_REDUCED_SUCCESS",
            Self::StockReducedFailed => "STOCK_REDUCED_FAILED",
            Self::StockIncreasedSuccess => "STOCK_INCREASED_SUCCESS",
            Self::StockIncreasedFailed => "STOCK_INCREASED_FAILED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// DomainEvent — 通用事件信封
// ---------------------------------------------------------------------------

/// 通用事件信封
///
/// 所有进出事件管道的消息都包装在此信封中：
/// - `event_id` 由生产方生成（UUID v7），贯穿幂等校验、任务去重和审计日志
/// - `timestamp` 为生产方时钟的毫秒级 Unix 时间戳
/// - `data` 以 JSON 承载各事件类型的业务数据，避免为每种事件定义独立消息结构
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// 事件唯一标识（UUID v7），时间有序便于索引，同时用于幂等性校验
    pub event_id: String,
    /// 事件类型
    pub event_type: EventType,
    /// 事件产生时间（Unix 毫秒）
    pub timestamp: i64,
    /// 事件业务数据
    pub data: Value,
}

impl DomainEvent {
    /// 构建新事件，自动生成 UUID v7 作为 event_id 并记录当前时间
    ///
    /// UUID v7 包含时间戳前缀，按 event_id 排序即可获得时间顺序，
    /// 适合作为 Kafka 消息的 key 或审计表主键。
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type,
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    /// 将业务数据反序列化为具体的载荷类型
    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::ShopError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| crate::error::ShopError::Serialization(format!("事件载荷解析失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 业务载荷 — 订单
// ---------------------------------------------------------------------------

/// 订单行项目
///
/// 既是 ORDER_CREATED 事件中内嵌的行项目格式，也是购物车服务
/// 回查接口返回的条目格式，二者线上字段完全一致。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub product_name: String,
    pub product_price: f64,
    #[serde(default)]
    pub product_image: Option<String>,
    pub quantity: i32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// ORDER_CREATED 事件载荷
///
/// 行项目可能出现在 `items` 或 `cartItems` 字段（历史上两个上游版本并存），
/// 二者都缺失时由处理方回查购物车服务。`orderId` 是下单方生成的临时单号，
/// 真实订单号在持久化后由数据库分配。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedData {
    /// 下单方生成的临时单号，会在成功通知中原样回传
    #[serde(default)]
    pub order_id: Option<String>,
    pub user_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_address: String,
    pub total_amount: f64,
    #[serde(default)]
    pub items: Option<Vec<OrderLine>>,
    #[serde(default)]
    pub cart_items: Option<Vec<OrderLine>>,
}

impl OrderCreatedData {
    /// 解析行项目：优先 `items`，回退 `cartItems`，二者皆无时返回空切片
    pub fn lines(&self) -> &[OrderLine] {
        self.items
            .as_deref()
            .or(self.cart_items.as_deref())
            .unwrap_or(&[])
    }
}

/// 订单状态流转事件载荷（ORDER_CONFIRMED / SHIPPED / DELIVERED）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusData {
    pub order_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub shipped_by: Option<String>,
}

/// ORDER_CANCELLED 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelledData {
    pub order_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    /// 取消订单需要回补库存的行项目
    #[serde(default)]
    pub items: Vec<CancelledLine>,
}

/// 被取消订单中需回补库存的条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledLine {
    pub product_id: String,
    pub quantity: i32,
}

// ---------------------------------------------------------------------------
// 业务载荷 — 库存
// ---------------------------------------------------------------------------

/// INVENTORY_ITEM_ADDED 事件载荷（新商品的完整描述）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub stock: i32,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub is_new_arrival: bool,
    /// 发起操作的用户，用于回发结果通知
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 商品部分更新的变更集，缺失字段表示保持原值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_new_arrival: Option<bool>,
}

/// INVENTORY_ITEM_UPDATED 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdateData {
    pub product_id: String,
    pub changes: ProductChanges,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// INVENTORY_ITEM_DELETED 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDeleteData {
    pub product_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 库存增减事件载荷（INVENTORY_STOCK_REDUCED / INCREASED）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjustment {
    pub product_id: String,
    pub quantity: i32,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// CART_CLEAR_REQUESTED 事件载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartClearData {
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// UserNotification — 面向用户的通知
// ---------------------------------------------------------------------------

/// 通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
}

/// 面向用户的通知载荷
///
/// 作为 `*_SUCCESS` / `*_FAILED` 事件的 data 字段发往通知 topic，
/// 由通知网关按 `user_id` 路由推送给前端。`data` 携带与结果相关的
/// 业务字段（订单号、商品号等），供前端跳转或展示详情。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub user_id: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&EventType::OrderCreated).unwrap(),
            "\"ORDER_CREATED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::InventoryStockReduced).unwrap(),
            "\"INVENTORY_STOCK_REDUCED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::OrderCreatedFailed).unwrap(),
            "\"ORDER_CREATED_FAILED\""
        );

        let parsed: EventType = serde_json::from_str("\"CART_CLEAR_REQUESTED\"").unwrap();
        assert_eq!(parsed, EventType::CartClearRequested);
    }

    #[test]
    fn test_unknown_event_type_absorbed() {
        // 新版本上游引入的未知类型不应导致反序列化失败
        let parsed: EventType = serde_json::from_str("\"LOYALTY_POINTS_GRANTED\"").unwrap();
        assert_eq!(parsed, EventType::Unknown);
        assert_eq!(parsed.to_string(), "UNKNOWN");
        assert!(parsed.source_topic().is_none());
    }

    #[test]
    fn test_event_type_classification() {
        assert!(EventType::InventoryItemAdded.is_inventory());
        assert!(EventType::InventoryStockIncreased.is_inventory());
        assert!(!EventType::InventoryItemAdded.is_order());

        assert!(EventType::OrderCreated.is_order());
        assert!(EventType::OrderCancelled.is_order());
        assert!(!EventType::OrderCreated.is_notification());

        assert!(EventType::OrderCreatedSuccess.is_notification());
        assert!(EventType::StockReducedFailed.is_notification());
    }

    #[test]
    fn test_source_topic_routing() {
        assert_eq!(
            EventType::InventoryItemDeleted.source_topic(),
            Some(topics::INVENTORY_EVENTS)
        );
        assert_eq!(
            EventType::OrderShipped.source_topic(),
            Some(topics::ORDER_EVENTS)
        );
        assert_eq!(
            EventType::CartClearRequested.source_topic(),
            Some(topics::CART_EVENTS)
        );
        assert_eq!(
            EventType::ItemUpdatedSuccess.source_topic(),
            Some(topics::NOTIFICATION_EVENTS)
        );
    }

    #[test]
    fn test_domain_event_serialization() {
        let event = DomainEvent {
            event_id: "01912345-6789-7abc-8def-0123456789ab".to_string(),
            event_type: EventType::OrderCreated,
            timestamp: 1_736_936_000_000,
            data: serde_json::json!({"userId": "user-001"}),
        };

        let json = serde_json::to_string(&event).unwrap();

        // 验证 camelCase 序列化格式
        assert!(json.contains("eventId"));
        assert!(json.contains("eventType"));
        assert!(json.contains("\"ORDER_CREATED\""));

        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_id, event.event_id);
        assert_eq!(deserialized.event_type, EventType::OrderCreated);
        assert_eq!(deserialized.timestamp, 1_736_936_000_000);
    }

    #[test]
    fn test_domain_event_new_generates_id() {
        let event = DomainEvent::new(EventType::CartClearRequested, serde_json::json!({}));
        assert!(!event.event_id.is_empty());
        assert!(event.timestamp > 0);

        // UUID v7 可解析
        assert!(Uuid::parse_str(&event.event_id).is_ok());
    }

    #[test]
    fn test_order_created_lines_prefers_items() {
        let line = OrderLine {
            product_id: "prod-001".to_string(),
            product_name: "帆布鞋".to_string(),
            product_price: 199.0,
            product_image: None,
            quantity: 2,
            size: Some("42".to_string()),
            color: None,
        };
        let fallback = OrderLine {
            product_id: "prod-002".to_string(),
            product_name: "棒球帽".to_string(),
            product_price: 59.0,
            product_image: None,
            quantity: 1,
            size: None,
            color: None,
        };

        let data = OrderCreatedData {
            order_id: Some("temp-123".to_string()),
            user_id: "user-001".to_string(),
            customer_name: "张三".to_string(),
            customer_email: "zhangsan@example.com".to_string(),
            customer_address: "上海市浦东新区".to_string(),
            total_amount: 457.0,
            items: Some(vec![line.clone()]),
            cart_items: Some(vec![fallback]),
        };

        // items 存在时忽略 cartItems
        assert_eq!(data.lines(), &[line]);
    }

    #[test]
    fn test_order_created_lines_falls_back_to_cart_items() {
        let json = r#"{
            "orderId": "temp-42",
            "userId": "user-001",
            "customerName": "李四",
            "customerEmail": "lisi@example.com",
            "customerAddress": "北京市朝阳区",
            "totalAmount": 99.0,
            "cartItems": [{
                "productId": "prod-003",
                "productName": "围巾",
                "productPrice": 99.0,
                "quantity": 1
            }]
        }"#;

        let data: OrderCreatedData = serde_json::from_str(json).unwrap();
        assert!(data.items.is_none());
        assert_eq!(data.lines().len(), 1);
        assert_eq!(data.lines()[0].product_id, "prod-003");
    }

    #[test]
    fn test_order_created_lines_empty_when_absent() {
        let json = r#"{
            "userId": "user-001",
            "customerName": "王五",
            "customerEmail": "wangwu@example.com",
            "customerAddress": "广州市天河区",
            "totalAmount": 0.0
        }"#;

        let data: OrderCreatedData = serde_json::from_str(json).unwrap();
        assert!(data.lines().is_empty());
    }

    #[test]
    fn test_user_notification_wire_format() {
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "订单创建成功".to_string(),
            message: "您的订单已创建，共 2 件商品".to_string(),
            user_id: "user-001".to_string(),
            data: serde_json::json!({"orderId": 42}),
        };

        let json = serde_json::to_string(&notification).unwrap();

        // type 字段为小写，与前端约定一致
        assert!(json.contains("\"type\":\"success\""));
        assert!(json.contains("userId"));

        let deserialized: UserNotification = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.kind, NotificationKind::Success);
        assert_eq!(deserialized.user_id, "user-001");
    }

    #[test]
    fn test_product_changes_partial() {
        let json = r#"{"price": 299.0, "stock": 10}"#;
        let changes: ProductChanges = serde_json::from_str(json).unwrap();
        assert_eq!(changes.price, Some(299.0));
        assert_eq!(changes.stock, Some(10));
        assert!(changes.name.is_none());
        assert!(changes.sizes.is_none());
    }
}
