//! 事件处理器
//!
//! 每条事件经过三道闸：幂等检查（审计日志查重）、按类型分发到处理函数、
//! 落审计日志。业务失败（库存不足等）是确定性结果，记入审计并发失败
//! 通知，不重试；基础设施失败向上抛给任务层按退避策略重试。
//!
//! 审计日志在处理完成后写入，以 event_id 唯一约束收口：并发消费同一
//! 事件时只有一条审计落库，商品/订单层各自的幂等语义保证副作用不翻倍。

use std::sync::Arc;
use std::time::Instant;

use storefront_shared::events::{
    CancelledLine, DomainEvent, EventType, ItemDeleteData, ItemUpdateData, OrderCancelledData,
    OrderCreatedData, OrderStatusData, ProductData, StockAdjustment,
};
use storefront_shared::observability;
use tracing::{debug, info, warn};

use crate::error::ProcessorError;
use crate::notifier::Notifier;
use crate::saga::OrderSaga;
use crate::store::{
    EventLogEntry, EventLogStore, EventStatus, OrderStatus, OrderStore, Product, ProductStore,
};

/// 单条事件的处理结论
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// 处理成功
    Processed,
    /// 无需处理（重复事件、非本服务消费的类型等）
    Skipped { reason: &'static str },
    /// 业务性失败，已成定局，不重试
    Failed { error: String },
}

/// 事件处理器
pub struct EventProcessor {
    products: Arc<dyn ProductStore>,
    orders: Arc<dyn OrderStore>,
    event_log: Arc<dyn EventLogStore>,
    saga: OrderSaga,
    notifier: Arc<dyn Notifier>,
}

impl EventProcessor {
    pub fn new(
        products: Arc<dyn ProductStore>,
        orders: Arc<dyn OrderStore>,
        event_log: Arc<dyn EventLogStore>,
        saga: OrderSaga,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            products,
            orders,
            event_log,
            saga,
            notifier,
        }
    }

    /// 处理单条事件：幂等检查 → 分发 → 审计
    ///
    /// 返回 `Err` 仅表示基础设施故障，任务层据此重试；
    /// 业务失败折叠进 `HandleOutcome::Failed`，审计后不再重试。
    pub async fn process(
        &self,
        event: &DomainEvent,
        topic: &str,
    ) -> Result<HandleOutcome, ProcessorError> {
        if self.event_log.exists(&event.event_id).await? {
            debug!(event_id = %event.event_id, "事件已处理过，跳过");
            return Ok(HandleOutcome::Skipped { reason: "duplicate" });
        }

        let started = Instant::now();
        let outcome = match self.dispatch(event).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_business() => {
                // 分发层漏标的业务错误在此兜底折叠，避免无意义的重试
                HandleOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };

        let (status, error_message) = match &outcome {
            HandleOutcome::Processed | HandleOutcome::Skipped { .. } => (EventStatus::Processed, None),
            HandleOutcome::Failed { error } => (EventStatus::Failed, Some(error.clone())),
        };

        let entry = EventLogEntry {
            event_id: event.event_id.clone(),
            event_type: event.event_type.to_string(),
            topic: topic.to_string(),
            payload: serde_json::to_value(event)
                .map_err(|e| ProcessorError::InvalidPayload(format!("事件信封序列化失败: {e}")))?,
            status,
            error_message,
        };
        if !self.event_log.record_once(entry).await? {
            // 另一个消费者在处理期间抢先写入了审计，结果以先到者为准
            debug!(event_id = %event.event_id, "审计日志已被并发写入");
        }

        observability::record_event_processed(
            &event.event_type.to_string(),
            status.as_str(),
            started.elapsed().as_secs_f64(),
        );
        Ok(outcome)
    }

    /// 按事件类型分发
    async fn dispatch(&self, event: &DomainEvent) -> Result<HandleOutcome, ProcessorError> {
        match event.event_type {
            EventType::InventoryItemAdded => self.handle_item_added(event).await,
            EventType::InventoryItemUpdated => self.handle_item_updated(event).await,
            EventType::InventoryItemDeleted => self.handle_item_deleted(event).await,
            EventType::InventoryStockReduced => self.handle_stock_reduced(event).await,
            EventType::InventoryStockIncreased => self.handle_stock_increased(event).await,
            EventType::OrderCreated => self.handle_order_created(event).await,
            EventType::OrderConfirmed => self.handle_order_confirmed(event).await,
            EventType::OrderShipped => self.handle_order_shipped(event).await,
            EventType::OrderDelivered => self.handle_order_delivered(event).await,
            EventType::OrderCancelled => self.handle_order_cancelled(event).await,
            // 这两类由其他服务消费，出现在订阅流里直接跳过
            EventType::CartClearRequested => Ok(HandleOutcome::Skipped {
                reason: "not-consumed-here",
            }),
            ref t if t.is_notification() => Ok(HandleOutcome::Skipped {
                reason: "not-consumed-here",
            }),
            EventType::Unknown => {
                warn!(event_id = %event.event_id, "未知事件类型，跳过");
                Ok(HandleOutcome::Skipped {
                    reason: "unknown-event-type",
                })
            }
            _ => unreachable!("事件类型分支已穷举"),
        }
    }

    // ------------------------------------------------------------------
    // 订单事件
    // ------------------------------------------------------------------

    async fn handle_order_created(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: OrderCreatedData = parse(event)?;

        match self.saga.execute(&event.event_id, &data).await {
            Ok(result) => {
                self.notifier
                    .order_created_success(
                        result.order_id,
                        data.order_id.as_deref(),
                        &data,
                        result.item_count,
                    )
                    .await;
                observability::record_order_created(result.item_count);
                Ok(HandleOutcome::Processed)
            }
            Err(e) if e.is_business() => {
                let message = e.to_string();
                info!(event_id = %event.event_id, error = %message, "下单业务失败");
                self.notifier.order_created_failed(&data, &message).await;
                Ok(HandleOutcome::Failed { error: message })
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_order_confirmed(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: OrderStatusData = parse(event)?;
        self.set_order_status(data.order_id, OrderStatus::Processing)
            .await
    }

    async fn handle_order_shipped(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: OrderStatusData = parse(event)?;
        let found = self
            .orders
            .mark_shipped(
                data.order_id,
                data.tracking_number.as_deref(),
                data.shipped_by.as_deref(),
            )
            .await?;
        if !found {
            return Err(ProcessorError::OrderNotFound {
                order_id: data.order_id,
            });
        }
        info!(order_id = data.order_id, "订单已标记发货");
        Ok(HandleOutcome::Processed)
    }

    async fn handle_order_delivered(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: OrderStatusData = parse(event)?;
        self.set_order_status(data.order_id, OrderStatus::Delivered)
            .await
    }

    async fn handle_order_cancelled(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: OrderCancelledData = parse(event)?;
        let outcome = self
            .set_order_status(data.order_id, OrderStatus::Cancelled)
            .await?;

        // 取消后回补库存；个别商品回补失败只告警，不阻塞取消本身
        for CancelledLine {
            product_id,
            quantity,
        } in &data.items
        {
            match self.products.restock(product_id, *quantity).await {
                Ok(Some(new_stock)) => {
                    debug!(order_id = data.order_id, product_id = %product_id, new_stock, "取消订单库存已回补");
                }
                Ok(None) => {
                    warn!(order_id = data.order_id, product_id = %product_id, "取消订单回补失败：商品不存在");
                }
                Err(e) => {
                    warn!(order_id = data.order_id, product_id = %product_id, error = %e, "取消订单回补失败");
                }
            }
        }
        Ok(outcome)
    }

    async fn set_order_status(
        &self,
        order_id: i64,
        status: OrderStatus,
    ) -> Result<HandleOutcome, ProcessorError> {
        let found = self.orders.set_status(order_id, status).await?;
        if !found {
            return Err(ProcessorError::OrderNotFound { order_id });
        }
        info!(order_id, status = %status, "订单状态已更新");
        Ok(HandleOutcome::Processed)
    }

    // ------------------------------------------------------------------
    // 库存事件
    // ------------------------------------------------------------------

    async fn handle_item_added(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: ProductData = parse(event)?;
        let user_id = data.user_id.clone();

        if self.products.get(&data.id).await?.is_some() {
            let e = ProcessorError::ProductExists {
                product_id: data.id.clone(),
            };
            self.notifier
                .item_created_failed(&data.id, &e.to_string(), user_id.as_deref())
                .await;
            return Ok(HandleOutcome::Failed {
                error: e.to_string(),
            });
        }

        let now = chrono::Utc::now();
        let product = Product {
            id: data.id,
            name: data.name,
            description: data.description,
            price: data.price,
            image: data.image,
            category: data.category,
            stock: data.stock,
            sizes: data.sizes,
            colors: data.colors,
            is_new_arrival: data.is_new_arrival,
            created_at: now,
            updated_at: now,
        };
        self.products.insert(product.clone()).await?;

        info!(product_id = %product.id, stock = product.stock, "商品已上架");
        self.notifier
            .item_created_success(&product, user_id.as_deref())
            .await;
        Ok(HandleOutcome::Processed)
    }

    async fn handle_item_updated(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: ItemUpdateData = parse(event)?;

        match self
            .products
            .apply_changes(&data.product_id, &data.changes)
            .await?
        {
            Some(product) => {
                info!(product_id = %product.id, "商品已更新");
                self.notifier
                    .item_updated_success(&product, data.user_id.as_deref())
                    .await;
                Ok(HandleOutcome::Processed)
            }
            None => {
                let e = ProcessorError::ProductNotFound {
                    product_id: data.product_id.clone(),
                };
                self.notifier
                    .item_updated_failed(&data.product_id, &e.to_string(), data.user_id.as_deref())
                    .await;
                Ok(HandleOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn handle_item_deleted(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: ItemDeleteData = parse(event)?;

        if self.products.delete(&data.product_id).await? {
            info!(product_id = %data.product_id, "商品已下架");
            self.notifier
                .item_deleted_success(&data.product_id, data.user_id.as_deref())
                .await;
            Ok(HandleOutcome::Processed)
        } else {
            let e = ProcessorError::ProductNotFound {
                product_id: data.product_id.clone(),
            };
            self.notifier
                .item_deleted_failed(&data.product_id, &e.to_string(), data.user_id.as_deref())
                .await;
            Ok(HandleOutcome::Failed {
                error: e.to_string(),
            })
        }
    }

    async fn handle_stock_reduced(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: StockAdjustment = parse(event)?;

        let product = match self.products.get(&data.product_id).await? {
            Some(product) => product,
            None => {
                let e = ProcessorError::ProductNotFound {
                    product_id: data.product_id.clone(),
                };
                self.notifier
                    .stock_reduced_failed(
                        &data.product_id,
                        data.quantity,
                        &e.to_string(),
                        data.user_id.as_deref(),
                    )
                    .await;
                return Ok(HandleOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        match self
            .products
            .try_reserve(&data.product_id, data.quantity)
            .await?
        {
            Some(remaining) => {
                info!(product_id = %data.product_id, quantity = data.quantity, remaining, "库存已扣减");
                self.notifier
                    .stock_reduced_success(
                        &data.product_id,
                        data.quantity,
                        remaining,
                        data.user_id.as_deref(),
                    )
                    .await;
                Ok(HandleOutcome::Processed)
            }
            None => {
                let e = ProcessorError::InsufficientStock {
                    product_name: product.name,
                    requested: data.quantity,
                    available: product.stock,
                };
                self.notifier
                    .stock_reduced_failed(
                        &data.product_id,
                        data.quantity,
                        &e.to_string(),
                        data.user_id.as_deref(),
                    )
                    .await;
                Ok(HandleOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn handle_stock_increased(
        &self,
        event: &DomainEvent,
    ) -> Result<HandleOutcome, ProcessorError> {
        let data: StockAdjustment = parse(event)?;

        match self.products.restock(&data.product_id, data.quantity).await? {
            Some(new_stock) => {
                info!(product_id = %data.product_id, quantity = data.quantity, new_stock, "库存已增加");
                self.notifier
                    .stock_increased_success(
                        &data.product_id,
                        data.quantity,
                        new_stock,
                        data.user_id.as_deref(),
                    )
                    .await;
                Ok(HandleOutcome::Processed)
            }
            None => {
                let e = ProcessorError::ProductNotFound {
                    product_id: data.product_id.clone(),
                };
                self.notifier
                    .stock_increased_failed(
                        &data.product_id,
                        data.quantity,
                        &e.to_string(),
                        data.user_id.as_deref(),
                    )
                    .await;
                Ok(HandleOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }
}

/// 解析事件载荷，格式错误折叠为业务性的 InvalidPayload（重试无意义）
fn parse<T: serde::de::DeserializeOwned>(event: &DomainEvent) -> Result<T, ProcessorError> {
    event
        .parse_data()
        .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))
}
