//! PostgreSQL 存储实现
//!
//! 商品、订单、审计日志分属三个独立数据库，各实现持有自己的连接池。
//! 库存扣减使用带条件的单条 UPDATE（`stock >= quantity`）保证原子性，
//! 订单创建在事务内完成主表与行项目的写入。

use async_trait::async_trait;
use sqlx::PgPool;
use storefront_shared::error::ShopError;
use storefront_shared::events::ProductChanges;
use tracing::debug;

use super::{
    EventLogEntry, EventLogStore, NewOrder, Order, OrderItem, OrderStatus, OrderStore, Product,
    ProductStore, SagaLogStore, SagaStep,
};

// ---------------------------------------------------------------------------
// PgProductStore
// ---------------------------------------------------------------------------

/// 商品存储（库存库）
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn insert(&self, product: Product) -> Result<(), ShopError> {
        sqlx::query(
            r#"
            INSERT INTO products
                (id, name, description, price, image, category, stock,
                 sizes, colors, is_new_arrival, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            "#,
        )
        .bind(&product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(product.price)
        .bind(&product.image)
        .bind(&product.category)
        .bind(product.stock)
        .bind(&product.sizes)
        .bind(&product.colors)
        .bind(product.is_new_arrival)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, product_id: &str) -> Result<Option<Product>, ShopError> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, description, price, image, category, stock,
                   sizes, colors, is_new_arrival, created_at, updated_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn apply_changes(
        &self,
        product_id: &str,
        changes: &ProductChanges,
    ) -> Result<Option<Product>, ShopError> {
        // COALESCE 语义：未提供的字段保持原值
        let product = sqlx::query_as::<_, Product>(
            r#"
            UPDATE products SET
                name           = COALESCE($2, name),
                description    = COALESCE($3, description),
                price          = COALESCE($4, price),
                image          = COALESCE($5, image),
                category       = COALESCE($6, category),
                stock          = COALESCE($7, stock),
                sizes          = COALESCE($8, sizes),
                colors         = COALESCE($9, colors),
                is_new_arrival = COALESCE($10, is_new_arrival),
                updated_at     = NOW()
            WHERE id = $1
            RETURNING id, name, description, price, image, category, stock,
                      sizes, colors, is_new_arrival, created_at, updated_at
            "#,
        )
        .bind(product_id)
        .bind(&changes.name)
        .bind(&changes.description)
        .bind(changes.price)
        .bind(&changes.image)
        .bind(&changes.category)
        .bind(changes.stock)
        .bind(&changes.sizes)
        .bind(&changes.colors)
        .bind(changes.is_new_arrival)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn delete(&self, product_id: &str) -> Result<bool, ShopError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_reserve(
        &self,
        product_id: &str,
        quantity: i32,
    ) -> Result<Option<i32>, ShopError> {
        // 条件扣减：库存不足时 UPDATE 不命中任何行，返回 None。
        // 数据库行锁保证两个并发扣减串行执行，不会出现超卖。
        let remaining = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE products
            SET stock = stock - $2, updated_at = NOW()
            WHERE id = $1 AND stock >= $2
            RETURNING stock
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        debug!(product_id, quantity, ?remaining, "条件扣减库存");
        Ok(remaining)
    }

    async fn restock(&self, product_id: &str, quantity: i32) -> Result<Option<i32>, ShopError> {
        let stock = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE products
            SET stock = stock + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING stock
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stock)
    }
}

// ---------------------------------------------------------------------------
// PgOrderStore
// ---------------------------------------------------------------------------

/// 订单存储（订单库）
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// 订单主表行（不含行项目），status 以 TEXT 存储
#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    user_id: String,
    customer_name: String,
    customer_email: String,
    customer_address: String,
    total_amount: f64,
    status: String,
    tracking_number: Option<String>,
    shipped_by: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order, ShopError> {
        let status = OrderStatus::try_from(self.status).map_err(ShopError::Internal)?;
        Ok(Order {
            id: self.id,
            user_id: self.user_id,
            customer_name: self.customer_name,
            customer_email: self.customer_email,
            customer_address: self.customer_address,
            total_amount: self.total_amount,
            status,
            tracking_number: self.tracking_number,
            shipped_by: self.shipped_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            items,
        })
    }
}

impl PgOrderStore {
    async fn fetch_items(&self, order_id: i64) -> Result<Vec<OrderItem>, ShopError> {
        let items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, product_name, product_price,
                   product_image, quantity, size, color
            FROM order_items
            WHERE order_id = $1
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn create(&self, order: NewOrder) -> Result<Order, ShopError> {
        let mut tx = self.pool.begin().await?;

        // event_id 唯一约束实现幂等：冲突时不改动任何字段，
        // 仅借 DO UPDATE 取回已存在的行；(xmax = 0) 区分本次是否真正插入
        let (order_id, inserted) = sqlx::query_as::<_, (i64, bool)>(
            r#"
            INSERT INTO orders
                (event_id, user_id, customer_name, customer_email,
                 customer_address, total_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (event_id) DO UPDATE SET updated_at = orders.updated_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&order.event_id)
        .bind(&order.user_id)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.customer_address)
        .bind(order.total_amount)
        .bind(order.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if inserted {
            for item in &order.items {
                sqlx::query(
                    r#"
                    INSERT INTO order_items
                        (order_id, product_id, product_name, product_price,
                         product_image, quantity, size, color)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(order_id)
                .bind(&item.product_id)
                .bind(&item.product_name)
                .bind(item.product_price)
                .bind(&item.product_image)
                .bind(item.quantity)
                .bind(&item.size)
                .bind(&item.color)
                .execute(&mut *tx)
                .await?;
            }
        } else {
            debug!(
                event_id = %order.event_id,
                order_id,
                "同一事件的订单已存在，返回已有订单"
            );
        }

        tx.commit().await?;

        self.get(order_id).await?.ok_or_else(|| ShopError::NotFound {
            entity: "Order".to_string(),
            id: order_id.to_string(),
        })
    }

    async fn get(&self, order_id: i64) -> Result<Option<Order>, ShopError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT id, user_id, customer_name, customer_email, customer_address,
                   total_amount, status, tracking_number, shipped_by,
                   created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let items = self.fetch_items(order_id).await?;
                Ok(Some(row.into_order(items)?))
            }
            None => Ok(None),
        }
    }

    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<bool, ShopError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(order_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_shipped(
        &self,
        order_id: i64,
        tracking_number: Option<&str>,
        shipped_by: Option<&str>,
    ) -> Result<bool, ShopError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'shipped', tracking_number = $2, shipped_by = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(tracking_number)
        .bind(shipped_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// PgEventLogStore
// ---------------------------------------------------------------------------

/// 事件审计日志存储（事件库）
pub struct PgEventLogStore {
    pool: PgPool,
}

impl PgEventLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLogStore for PgEventLogStore {
    async fn exists(&self, event_id: &str) -> Result<bool, ShopError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM event_log WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn record_once(&self, entry: EventLogEntry) -> Result<bool, ShopError> {
        // ON CONFLICT DO NOTHING：重复 event_id 不是错误，
        // 说明另一个消费者已经完成了同一事件
        let result = sqlx::query(
            r#"
            INSERT INTO event_log
                (event_id, event_type, topic, payload, status, error_message, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.event_type)
        .bind(&entry.topic)
        .bind(&entry.payload)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// PgSagaLogStore
// ---------------------------------------------------------------------------

/// Saga 步骤日志存储（事件库）
pub struct PgSagaLogStore {
    pool: PgPool,
}

impl PgSagaLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaLogStore for PgSagaLogStore {
    async fn append(&self, event_id: &str, step: &SagaStep) -> Result<(), ShopError> {
        let step_json = serde_json::to_value(step)
            .map_err(|e| ShopError::Serialization(format!("序列化 Saga 步骤失败: {e}")))?;

        sqlx::query("INSERT INTO saga_log (event_id, step, recorded_at) VALUES ($1, $2, NOW())")
            .bind(event_id)
            .bind(&step_json)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load(&self, event_id: &str) -> Result<Vec<SagaStep>, ShopError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT step FROM saga_log WHERE event_id = $1 ORDER BY id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| ShopError::Serialization(format!("解析 Saga 步骤失败: {e}")))
            })
            .collect()
    }
}
