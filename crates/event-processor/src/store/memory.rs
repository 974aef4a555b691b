//! 内存存储实现
//!
//! 供单元与集成测试使用，语义与 PostgreSQL 实现对齐：
//! 条件扣减在单个互斥量临界区内完成（等价于数据库行锁），
//! 订单创建按 event_id 幂等，审计日志冲突静默跳过。
//! 订单存储支持故障注入，用于验证 Saga 的补偿路径。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use storefront_shared::error::ShopError;
use storefront_shared::events::ProductChanges;

use super::{
    EventLogEntry, EventLogStore, NewOrder, Order, OrderItem, OrderStatus, OrderStore, Product,
    ProductStore, SagaLogStore, SagaStep,
};

// ---------------------------------------------------------------------------
// MemoryProductStore
// ---------------------------------------------------------------------------

/// 内存商品存储
#[derive(Default)]
pub struct MemoryProductStore {
    products: Mutex<HashMap<String, Product>>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置商品（测试用）
    pub fn seed(&self, product: Product) {
        self.products.lock().insert(product.id.clone(), product);
    }

    /// 读取当前库存（测试断言用）
    pub fn stock_of(&self, product_id: &str) -> Option<i32> {
        self.products.lock().get(product_id).map(|p| p.stock)
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn insert(&self, product: Product) -> Result<(), ShopError> {
        let mut products = self.products.lock();
        if products.contains_key(&product.id) {
            return Err(ShopError::AlreadyExists {
                entity: "Product".to_string(),
                field: "id".to_string(),
                value: product.id,
            });
        }
        products.insert(product.id.clone(), product);
        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<Product>, ShopError> {
        Ok(self.products.lock().get(product_id).cloned())
    }

    async fn apply_changes(
        &self,
        product_id: &str,
        changes: &ProductChanges,
    ) -> Result<Option<Product>, ShopError> {
        let mut products = self.products.lock();
        let Some(product) = products.get_mut(product_id) else {
            return Ok(None);
        };

        if let Some(name) = &changes.name {
            product.name = name.clone();
        }
        if let Some(description) = &changes.description {
            product.description = Some(description.clone());
        }
        if let Some(price) = changes.price {
            product.price = price;
        }
        if let Some(image) = &changes.image {
            product.image = Some(image.clone());
        }
        if let Some(category) = &changes.category {
            product.category = Some(category.clone());
        }
        if let Some(stock) = changes.stock {
            product.stock = stock;
        }
        if let Some(sizes) = &changes.sizes {
            product.sizes = sizes.clone();
        }
        if let Some(colors) = &changes.colors {
            product.colors = colors.clone();
        }
        if let Some(is_new_arrival) = changes.is_new_arrival {
            product.is_new_arrival = is_new_arrival;
        }
        product.updated_at = Utc::now();

        Ok(Some(product.clone()))
    }

    async fn delete(&self, product_id: &str) -> Result<bool, ShopError> {
        Ok(self.products.lock().remove(product_id).is_some())
    }

    async fn try_reserve(
        &self,
        product_id: &str,
        quantity: i32,
    ) -> Result<Option<i32>, ShopError> {
        // 校验与扣减在同一临界区内完成，与数据库的条件 UPDATE 等价
        let mut products = self.products.lock();
        let Some(product) = products.get_mut(product_id) else {
            return Ok(None);
        };
        if product.stock < quantity {
            return Ok(None);
        }
        product.stock -= quantity;
        product.updated_at = Utc::now();
        Ok(Some(product.stock))
    }

    async fn restock(&self, product_id: &str, quantity: i32) -> Result<Option<i32>, ShopError> {
        let mut products = self.products.lock();
        let Some(product) = products.get_mut(product_id) else {
            return Ok(None);
        };
        product.stock += quantity;
        product.updated_at = Utc::now();
        Ok(Some(product.stock))
    }
}

// ---------------------------------------------------------------------------
// MemoryOrderStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OrderState {
    orders: HashMap<i64, Order>,
    by_event: HashMap<String, i64>,
    next_id: i64,
}

/// 内存订单存储
///
/// `fail_next_create` 置位后，下一次 create 返回注入的存储故障，
/// 用于测试订单落库失败后的库存补偿。
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<OrderState>,
    fail_next_create: AtomicBool,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注入一次创建失败（测试用）
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// 当前订单数（测试断言用）
    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    /// 全部订单快照（测试断言用）
    pub fn all_orders(&self) -> Vec<Order> {
        self.state.lock().orders.values().cloned().collect()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn create(&self, order: NewOrder) -> Result<Order, ShopError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ShopError::Internal("注入的存储故障".to_string()));
        }

        let mut state = self.state.lock();

        // event_id 幂等：重复创建返回已存在的订单
        if let Some(order_id) = state.by_event.get(&order.event_id).copied() {
            return Ok(state.orders[&order_id].clone());
        }

        state.next_id += 1;
        let order_id = state.next_id;
        let now = Utc::now();

        let items = order
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| OrderItem {
                id: idx as i64 + 1,
                order_id,
                product_id: item.product_id.clone(),
                product_name: item.product_name.clone(),
                product_price: item.product_price,
                product_image: item.product_image.clone(),
                quantity: item.quantity,
                size: item.size.clone(),
                color: item.color.clone(),
            })
            .collect();

        let created = Order {
            id: order_id,
            user_id: order.user_id,
            customer_name: order.customer_name,
            customer_email: order.customer_email,
            customer_address: order.customer_address,
            total_amount: order.total_amount,
            status: order.status,
            tracking_number: None,
            shipped_by: None,
            created_at: now,
            updated_at: now,
            items,
        };

        state.by_event.insert(order.event_id, order_id);
        state.orders.insert(order_id, created.clone());
        Ok(created)
    }

    async fn get(&self, order_id: i64) -> Result<Option<Order>, ShopError> {
        Ok(self.state.lock().orders.get(&order_id).cloned())
    }

    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<bool, ShopError> {
        let mut state = self.state.lock();
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        order.status = status;
        order.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_shipped(
        &self,
        order_id: i64,
        tracking_number: Option<&str>,
        shipped_by: Option<&str>,
    ) -> Result<bool, ShopError> {
        let mut state = self.state.lock();
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        order.status = OrderStatus::Shipped;
        order.tracking_number = tracking_number.map(String::from);
        order.shipped_by = shipped_by.map(String::from);
        order.updated_at = Utc::now();
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryEventLogStore
// ---------------------------------------------------------------------------

/// 内存事件审计日志
#[derive(Default)]
pub struct MemoryEventLogStore {
    entries: Mutex<HashMap<String, EventLogEntry>>,
}

impl MemoryEventLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 event_id 取审计条目（测试断言用）
    pub fn entry(&self, event_id: &str) -> Option<EventLogEntry> {
        self.entries.lock().get(event_id).cloned()
    }

    /// 审计条目总数（测试断言用）
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[async_trait]
impl EventLogStore for MemoryEventLogStore {
    async fn exists(&self, event_id: &str) -> Result<bool, ShopError> {
        Ok(self.entries.lock().contains_key(event_id))
    }

    async fn record_once(&self, entry: EventLogEntry) -> Result<bool, ShopError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.event_id) {
            return Ok(false);
        }
        entries.insert(entry.event_id.clone(), entry);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemorySagaLogStore
// ---------------------------------------------------------------------------

/// 内存 Saga 步骤日志
#[derive(Default)]
pub struct MemorySagaLogStore {
    steps: Mutex<HashMap<String, Vec<SagaStep>>>,
}

impl MemorySagaLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置步骤序列，模拟先前尝试留下的日志（测试用）
    pub fn seed(&self, event_id: &str, steps: Vec<SagaStep>) {
        self.steps.lock().insert(event_id.to_string(), steps);
    }
}

#[async_trait]
impl SagaLogStore for MemorySagaLogStore {
    async fn append(&self, event_id: &str, step: &SagaStep) -> Result<(), ShopError> {
        self.steps
            .lock()
            .entry(event_id.to_string())
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn load(&self, event_id: &str) -> Result<Vec<SagaStep>, ShopError> {
        Ok(self.steps.lock().get(event_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_product(id: &str, stock: i32) -> Product {
        let now = Utc::now();
        Product {
            id: id.to_string(),
            name: format!("商品 {id}"),
            description: None,
            price: 99.0,
            image: None,
            category: Some("测试".to_string()),
            stock,
            sizes: vec![],
            colors: vec![],
            is_new_arrival: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_try_reserve_decrements_when_sufficient() {
        let store = MemoryProductStore::new();
        store.seed(sample_product("prod-001", 10));

        let remaining = store.try_reserve("prod-001", 4).await.unwrap();
        assert_eq!(remaining, Some(6));
        assert_eq!(store.stock_of("prod-001"), Some(6));
    }

    #[tokio::test]
    async fn test_try_reserve_refuses_when_insufficient() {
        let store = MemoryProductStore::new();
        store.seed(sample_product("prod-001", 3));

        let remaining = store.try_reserve("prod-001", 4).await.unwrap();
        assert_eq!(remaining, None);
        // 库存不变
        assert_eq!(store.stock_of("prod-001"), Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_reserve_only_one_wins() {
        // 库存 5，两个并发请求各要 4：恰好一个成功
        let store = Arc::new(MemoryProductStore::new());
        store.seed(sample_product("prod-001", 5));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.try_reserve("prod-001", 4).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.try_reserve("prod-001", 4).await.unwrap() })
        };

        let (res_a, res_b) = (a.await.unwrap(), b.await.unwrap());
        let successes = [res_a, res_b].iter().filter(|r| r.is_some()).count();
        assert_eq!(successes, 1);
        assert_eq!(store.stock_of("prod-001"), Some(1));
    }

    #[tokio::test]
    async fn test_order_create_idempotent_by_event_id() {
        let store = MemoryOrderStore::new();
        let order = NewOrder {
            event_id: "evt-001".to_string(),
            user_id: "user-001".to_string(),
            customer_name: "张三".to_string(),
            customer_email: "zhangsan@example.com".to_string(),
            customer_address: "上海市".to_string(),
            total_amount: 100.0,
            status: OrderStatus::Pending,
            items: vec![],
        };

        let first = store.create(order.clone()).await.unwrap();
        let second = store.create(order).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.order_count(), 1);
    }

    #[tokio::test]
    async fn test_order_create_failure_injection() {
        let store = MemoryOrderStore::new();
        store.fail_next_create();

        let order = NewOrder {
            event_id: "evt-001".to_string(),
            user_id: "user-001".to_string(),
            customer_name: "张三".to_string(),
            customer_email: "zhangsan@example.com".to_string(),
            customer_address: "上海市".to_string(),
            total_amount: 100.0,
            status: OrderStatus::Pending,
            items: vec![],
        };

        assert!(store.create(order.clone()).await.is_err());
        // 故障只注入一次，第二次成功
        assert!(store.create(order).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_log_record_once() {
        let store = MemoryEventLogStore::new();
        let entry = EventLogEntry {
            event_id: "evt-001".to_string(),
            event_type: "ORDER_CREATED".to_string(),
            topic: "order-events".to_string(),
            payload: serde_json::json!({}),
            status: super::super::EventStatus::Processed,
            error_message: None,
        };

        assert!(store.record_once(entry.clone()).await.unwrap());
        // 重复写入静默跳过
        assert!(!store.record_once(entry).await.unwrap());
        assert_eq!(store.entry_count(), 1);
        assert!(store.exists("evt-001").await.unwrap());
    }

    #[tokio::test]
    async fn test_saga_log_append_and_load_ordered() {
        let store = MemorySagaLogStore::new();
        let steps = [
            SagaStep::StockReserved {
                product_id: "prod-001".to_string(),
                quantity: 2,
            },
            SagaStep::StockReserved {
                product_id: "prod-002".to_string(),
                quantity: 1,
            },
            SagaStep::OrderPersisted { order_id: 7 },
        ];

        for step in &steps {
            store.append("evt-001", step).await.unwrap();
        }

        let loaded = store.load("evt-001").await.unwrap();
        assert_eq!(loaded, steps);

        // 其他事件互不影响
        assert!(store.load("evt-002").await.unwrap().is_empty());
    }
}
