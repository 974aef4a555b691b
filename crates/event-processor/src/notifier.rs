//! 通知扇出
//!
//! 将事件处理结果翻译为面向用户的通知（`{type, title, message, data}`），
//! 包装进对应的 `*_SUCCESS` / `*_FAILED` 事件发往通知 topic，由通知网关
//! 按 userId 推送。通知发布失败只记录日志，绝不影响主流程——审计日志
//! 才是结果的权威记录。
//!
//! 清空购物车请求也经此发布：它是尽力而为的动作，发布失败转入死信队列
//! 等待重投，同样不影响订单结果。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use storefront_shared::dlq::DlqProducer;
use storefront_shared::events::{
    DomainEvent, EventType, NotificationKind, OrderCreatedData, UserNotification,
};
use storefront_shared::kafka::{EventProducer, topics};
use storefront_shared::observability;
use tracing::{debug, error, warn};

use crate::store::Product;

/// 通知出口
///
/// 只有 `publish` 和 `request_cart_clear` 两个必须实现的方法，
/// 各结果通知由默认方法组装文案后统一走 `publish`，
/// 测试实现只需记录调用即可。
#[async_trait]
pub trait Notifier: Send + Sync {
    /// 发布一条通知事件（失败在实现内部消化）
    async fn publish(&self, event_type: EventType, notification: UserNotification);

    /// 请求清空用户购物车（尽力而为）
    async fn request_cart_clear(&self, user_id: &str);

    // ------------------------------------------------------------------
    // 下单结果
    // ------------------------------------------------------------------

    async fn order_created_success(
        &self,
        order_id: i64,
        temp_order_id: Option<&str>,
        data: &OrderCreatedData,
        item_count: usize,
    ) {
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "订单创建成功".to_string(),
            message: format!("您的订单已创建，共 {item_count} 件商品"),
            user_id: data.user_id.clone(),
            data: json!({
                "orderId": order_id,
                "tempOrderId": temp_order_id,
                "totalAmount": data.total_amount,
                "itemCount": item_count,
                "customerName": data.customer_name,
                "customerEmail": data.customer_email,
                "customerAddress": data.customer_address,
                "userId": data.user_id,
            }),
        };
        self.publish(EventType::OrderCreatedSuccess, notification)
            .await;
    }

    async fn order_created_failed(&self, data: &OrderCreatedData, error: &str) {
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "订单创建失败".to_string(),
            message: error.to_string(),
            user_id: data.user_id.clone(),
            data: json!({
                "tempOrderId": data.order_id,
                "error": error,
                "userId": data.user_id,
            }),
        };
        self.publish(EventType::OrderCreatedFailed, notification)
            .await;
    }

    // ------------------------------------------------------------------
    // 商品维护结果
    // ------------------------------------------------------------------

    async fn item_created_success(&self, product: &Product, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id = %product.id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "商品已上架".to_string(),
            message: format!("商品「{}」已添加，库存 {}", product.name, product.stock),
            user_id: user_id.to_string(),
            data: json!({
                "productId": product.id,
                "name": product.name,
                "stock": product.stock,
            }),
        };
        self.publish(EventType::ItemCreatedSuccess, notification)
            .await;
    }

    async fn item_created_failed(&self, product_id: &str, error: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "商品上架失败".to_string(),
            message: error.to_string(),
            user_id: user_id.to_string(),
            data: json!({ "productId": product_id, "error": error }),
        };
        self.publish(EventType::ItemCreatedFailed, notification)
            .await;
    }

    async fn item_updated_success(&self, product: &Product, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id = %product.id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "商品已更新".to_string(),
            message: format!("商品「{}」已更新", product.name),
            user_id: user_id.to_string(),
            data: json!({ "productId": product.id, "name": product.name }),
        };
        self.publish(EventType::ItemUpdatedSuccess, notification)
            .await;
    }

    async fn item_updated_failed(&self, product_id: &str, error: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "商品更新失败".to_string(),
            message: error.to_string(),
            user_id: user_id.to_string(),
            data: json!({ "productId": product_id, "error": error }),
        };
        self.publish(EventType::ItemUpdatedFailed, notification)
            .await;
    }

    async fn item_deleted_success(&self, product_id: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "商品已下架".to_string(),
            message: format!("商品 {product_id} 已删除"),
            user_id: user_id.to_string(),
            data: json!({ "productId": product_id }),
        };
        self.publish(EventType::ItemDeletedSuccess, notification)
            .await;
    }

    async fn item_deleted_failed(&self, product_id: &str, error: &str, user_id: Option<&str>) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "商品下架失败".to_string(),
            message: error.to_string(),
            user_id: user_id.to_string(),
            data: json!({ "productId": product_id, "error": error }),
        };
        self.publish(EventType::ItemDeletedFailed, notification)
            .await;
    }

    // ------------------------------------------------------------------
    // 库存调整结果
    // ------------------------------------------------------------------

    async fn stock_reduced_success(
        &self,
        product_id: &str,
        quantity: i32,
        remaining_stock: i32,
        user_id: Option<&str>,
    ) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "库存已扣减".to_string(),
            message: format!("商品 {product_id} 扣减 {quantity} 件，剩余 {remaining_stock}"),
            user_id: user_id.to_string(),
            data: json!({
                "productId": product_id,
                "quantity": quantity,
                "remainingStock": remaining_stock,
            }),
        };
        self.publish(EventType::StockReducedSuccess, notification)
            .await;
    }

    async fn stock_reduced_failed(
        &self,
        product_id: &str,
        quantity: i32,
        error: &str,
        user_id: Option<&str>,
    ) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "库存扣减失败".to_string(),
            message: error.to_string(),
            user_id: user_id.to_string(),
            data: json!({
                "productId": product_id,
                "quantity": quantity,
                "error": error,
            }),
        };
        self.publish(EventType::StockReducedFailed, notification)
            .await;
    }

    async fn stock_increased_success(
        &self,
        product_id: &str,
        quantity: i32,
        new_stock: i32,
        user_id: Option<&str>,
    ) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Success,
            title: "库存已增加".to_string(),
            message: format!("商品 {product_id} 入库 {quantity} 件，现有 {new_stock}"),
            user_id: user_id.to_string(),
            data: json!({
                "productId": product_id,
                "quantity": quantity,
                "newStock": new_stock,
            }),
        };
        self.publish(EventType::StockIncreasedSuccess, notification)
            .await;
    }

    async fn stock_increased_failed(
        &self,
        product_id: &str,
        quantity: i32,
        error: &str,
        user_id: Option<&str>,
    ) {
        let Some(user_id) = user_id else {
            debug!(product_id, "事件未携带 userId，跳过通知");
            return;
        };
        let notification = UserNotification {
            kind: NotificationKind::Error,
            title: "库存增加失败".to_string(),
            message: error.to_string(),
            user_id: user_id.to_string(),
            data: json!({
                "productId": product_id,
                "quantity": quantity,
                "error": error,
            }),
        };
        self.publish(EventType::StockIncreasedFailed, notification)
            .await;
    }
}

// ---------------------------------------------------------------------------
// KafkaNotifier
// ---------------------------------------------------------------------------

/// 生产实现：通知发往 notification-events，购物车清空请求发往 cart-events
pub struct KafkaNotifier {
    producer: Arc<EventProducer>,
    dlq: Arc<DlqProducer>,
}

impl KafkaNotifier {
    pub fn new(producer: Arc<EventProducer>, dlq: Arc<DlqProducer>) -> Self {
        Self { producer, dlq }
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn publish(&self, event_type: EventType, notification: UserNotification) {
        let kind = match notification.kind {
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
        };

        let data = match serde_json::to_value(&notification) {
            Ok(value) => value,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "序列化通知失败，放弃发布");
                return;
            }
        };

        let event = DomainEvent::new(event_type.clone(), data);
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "序列化通知事件失败，放弃发布");
                return;
            }
        };

        // 以 user_id 作为消息 key，同一用户的通知落在同一分区保持有序
        match self
            .producer
            .send(topics::NOTIFICATION_EVENTS, &notification.user_id, &payload)
            .await
        {
            Ok(_) => {
                observability::record_notification_published(kind);
                debug!(
                    event_type = %event_type,
                    user_id = %notification.user_id,
                    "通知已发布"
                );
            }
            Err(e) => {
                // 通知最多送达一次；审计日志仍是权威结果
                warn!(
                    event_type = %event_type,
                    user_id = %notification.user_id,
                    error = %e,
                    "通知发布失败，不影响主流程"
                );
            }
        }
    }

    async fn request_cart_clear(&self, user_id: &str) {
        let event = DomainEvent::new(
            EventType::CartClearRequested,
            json!({ "userId": user_id }),
        );

        if let Err(e) = self.producer.publish_event(topics::CART_EVENTS, &event).await {
            warn!(user_id, error = %e, "清空购物车事件发布失败，转入死信队列等待重投");
            if let Err(dlq_err) = self.dlq.send_event_to_dlq(&event, &e.to_string()).await {
                error!(user_id, error = %dlq_err, "清空购物车事件写入死信队列失败");
            }
        } else {
            debug!(user_id, "已请求清空购物车");
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier — 测试用
// ---------------------------------------------------------------------------

/// 只记录调用、不做任何 IO 的通知实现（测试用）
#[derive(Default)]
pub struct RecordingNotifier {
    published: parking_lot::Mutex<Vec<(EventType, UserNotification)>>,
    cart_clears: parking_lot::Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(EventType, UserNotification)> {
        self.published.lock().clone()
    }

    pub fn cart_clears(&self) -> Vec<String> {
        self.cart_clears.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, event_type: EventType, notification: UserNotification) {
        self.published.lock().push((event_type, notification));
    }

    async fn request_cart_clear(&self, user_id: &str) {
        self.cart_clears.lock().push(user_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order_data() -> OrderCreatedData {
        OrderCreatedData {
            order_id: Some("temp-1".to_string()),
            user_id: "user-001".to_string(),
            customer_name: "张三".to_string(),
            customer_email: "zhangsan@example.com".to_string(),
            customer_address: "上海市".to_string(),
            total_amount: 398.0,
            items: None,
            cart_items: None,
        }
    }

    #[tokio::test]
    async fn test_order_created_success_payload() {
        let notifier = RecordingNotifier::new();
        notifier
            .order_created_success(42, Some("temp-1"), &sample_order_data(), 2)
            .await;

        let published = notifier.published();
        assert_eq!(published.len(), 1);

        let (event_type, notification) = &published[0];
        assert_eq!(*event_type, EventType::OrderCreatedSuccess);
        assert_eq!(notification.kind, NotificationKind::Success);
        assert_eq!(notification.user_id, "user-001");
        assert_eq!(notification.data["orderId"], 42);
        assert_eq!(notification.data["tempOrderId"], "temp-1");
        assert_eq!(notification.data["itemCount"], 2);
        assert_eq!(notification.data["totalAmount"], 398.0);
    }

    #[tokio::test]
    async fn test_order_created_failed_payload() {
        let notifier = RecordingNotifier::new();
        notifier
            .order_created_failed(&sample_order_data(), "库存不足")
            .await;

        let published = notifier.published();
        assert_eq!(published.len(), 1);

        let (event_type, notification) = &published[0];
        assert_eq!(*event_type, EventType::OrderCreatedFailed);
        assert_eq!(notification.kind, NotificationKind::Error);
        assert_eq!(notification.message, "库存不足");
        assert_eq!(notification.data["error"], "库存不足");
    }

    #[tokio::test]
    async fn test_notifications_skipped_without_user_id() {
        let notifier = RecordingNotifier::new();
        notifier.item_deleted_success("prod-001", None).await;
        notifier
            .stock_reduced_failed("prod-001", 3, "库存不足", None)
            .await;

        // 无 userId 无法路由，直接跳过
        assert!(notifier.published().is_empty());
    }
}
