//! 下单 Saga
//!
//! ORDER_CREATED 事件的核心处理流程：解析行项目（必要时回查购物车）、
//! 校验库存、原子预占、事务落库订单、请求清空购物车。每个有副作用的
//! 步骤完成后立即写入 Saga 步骤日志，崩溃重试时重放日志即可从断点续跑，
//! 不会重复扣减库存或重复建单。
//!
//! 订单落库失败时立即补偿：回补此前预占的全部库存并记录 `COMPENSATED`，
//! 避免库存被一笔失败订单长期占用。
//!
//! 预占以商品为粒度：同一商品可能分多行出现（不同尺码/颜色各占一行），
//! 预检、扣减与续跑都基于按商品聚合后的合计数量，续跑时只补扣差额。

use std::sync::Arc;

use storefront_shared::events::{OrderCreatedData, OrderLine};
use storefront_shared::observability;
use tracing::{error, info, warn};

use crate::cart::CartService;
use crate::error::ProcessorError;
use crate::notifier::Notifier;
use crate::store::{
    NewOrder, NewOrderItem, OrderStatus, OrderStore, ProductStore, SagaLogStore, SagaStep,
};

/// Saga 成功结果
#[derive(Debug, Clone, Copy)]
pub struct SagaResult {
    /// 数据库分配的真实订单号
    pub order_id: i64,
    /// 订单行项目数
    pub item_count: usize,
}

// ---------------------------------------------------------------------------
// SagaState — 步骤日志重放
// ---------------------------------------------------------------------------

/// 重放步骤日志得到的净状态
#[derive(Debug, Default)]
struct SagaState {
    /// 仍处于预占状态的 (product_id, quantity)
    reserved: Vec<(String, i32)>,
    /// 已落库的订单号
    persisted_order_id: Option<i64>,
}

impl SagaState {
    /// 按写入顺序重放：`COMPENSATED` 清空此前全部预占记录
    fn replay(steps: &[SagaStep]) -> Self {
        let mut state = Self::default();
        for step in steps {
            match step {
                SagaStep::StockReserved {
                    product_id,
                    quantity,
                } => state.reserved.push((product_id.clone(), *quantity)),
                SagaStep::Compensated => state.reserved.clear(),
                SagaStep::OrderPersisted { order_id } => {
                    state.persisted_order_id = Some(*order_id);
                }
            }
        }
        state
    }

    /// 某商品已预占的合计数量
    fn reserved_quantity(&self, product_id: &str) -> i32 {
        self.reserved
            .iter()
            .filter(|(id, _)| id == product_id)
            .map(|(_, quantity)| quantity)
            .sum()
    }
}

/// 按商品聚合后的净需求
#[derive(Debug, PartialEq)]
struct ProductDemand {
    product_id: String,
    product_name: String,
    quantity: i32,
}

/// 把行项目按商品合并，保留首次出现的顺序
fn aggregate_demand(lines: &[OrderLine]) -> Vec<ProductDemand> {
    let mut demand: Vec<ProductDemand> = Vec::new();
    for line in lines {
        match demand.iter_mut().find(|d| d.product_id == line.product_id) {
            Some(d) => d.quantity += line.quantity,
            None => demand.push(ProductDemand {
                product_id: line.product_id.clone(),
                product_name: line.product_name.clone(),
                quantity: line.quantity,
            }),
        }
    }
    demand
}

// ---------------------------------------------------------------------------
// OrderSaga
// ---------------------------------------------------------------------------

/// 下单 Saga 执行器
pub struct OrderSaga {
    products: Arc<dyn ProductStore>,
    orders: Arc<dyn OrderStore>,
    saga_log: Arc<dyn SagaLogStore>,
    cart: Arc<dyn CartService>,
    notifier: Arc<dyn Notifier>,
}

impl OrderSaga {
    pub fn new(
        products: Arc<dyn ProductStore>,
        orders: Arc<dyn OrderStore>,
        saga_log: Arc<dyn SagaLogStore>,
        cart: Arc<dyn CartService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            products,
            orders,
            saga_log,
            cart,
            notifier,
        }
    }

    /// 执行下单流程
    ///
    /// 业务失败（库存不足、商品不存在、空订单）返回对应的业务错误，
    /// 调用方据此发失败通知且不重试；基础设施错误透传给任务层重试。
    /// 同一 event_id 重试时先加载步骤日志续跑，已完成的步骤不再执行。
    pub async fn execute(
        &self,
        event_id: &str,
        data: &OrderCreatedData,
    ) -> Result<SagaResult, ProcessorError> {
        // 1. 解析行项目：优先事件内嵌，缺失时回查购物车服务
        let embedded = data.lines();
        let lines: Vec<OrderLine> = if embedded.is_empty() {
            self.cart.fetch_items(&data.user_id).await?
        } else {
            embedded.to_vec()
        };
        if lines.is_empty() {
            return Err(ProcessorError::EmptyOrder);
        }

        // 2. 重放步骤日志，崩溃重试时从断点续跑
        let steps = self.saga_log.load(event_id).await?;
        let state = SagaState::replay(&steps);

        if let Some(order_id) = state.persisted_order_id {
            // 订单已落库，说明上次执行在收尾阶段中断，补发清空购物车即可
            info!(event_id, order_id, "订单已落库，跳过重复执行");
            self.notifier.request_cart_clear(&data.user_id).await;
            return Ok(SagaResult {
                order_id,
                item_count: lines.len(),
            });
        }
        let demand = aggregate_demand(&lines);

        // 3. 整单预检：按商品合计需求减去已预占量校验，
        //    任何一项不满足就在扣减前失败，减少无谓的补偿
        for item in &demand {
            let product = self
                .products
                .get(&item.product_id)
                .await?
                .ok_or_else(|| ProcessorError::ProductNotFound {
                    product_id: item.product_id.clone(),
                })?;
            let needed = item.quantity - state.reserved_quantity(&item.product_id);
            if needed > 0 && product.stock < needed {
                return Err(ProcessorError::InsufficientStock {
                    product_name: product.name,
                    requested: needed,
                    available: product.stock,
                });
            }
        }

        // 4. 按商品原子预占差额，每成功一项立即写步骤日志；
        //    续跑时已预占的部分不再扣减
        let mut reserved = state.reserved.clone();
        for item in &demand {
            let needed = item.quantity - state.reserved_quantity(&item.product_id);
            if needed <= 0 {
                continue;
            }

            match self.products.try_reserve(&item.product_id, needed).await {
                Ok(Some(remaining)) => {
                    let step = SagaStep::StockReserved {
                        product_id: item.product_id.clone(),
                        quantity: needed,
                    };
                    if let Err(e) = self.saga_log.append(event_id, &step).await {
                        // 步骤日志写不进去就无法保证可恢复，立即回补后报错
                        self.compensate(event_id, &reserved).await;
                        return Err(e.into());
                    }
                    reserved.push((item.product_id.clone(), needed));
                    info!(
                        event_id,
                        product_id = %item.product_id,
                        quantity = needed,
                        remaining,
                        "库存已预占"
                    );
                }
                Ok(None) => {
                    // 预检通过但扣减失败，说明并发订单抢走了库存
                    let available = self
                        .products
                        .get(&item.product_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|p| p.stock)
                        .unwrap_or(0);
                    self.compensate(event_id, &reserved).await;
                    return Err(ProcessorError::InsufficientStock {
                        product_name: item.product_name.clone(),
                        requested: needed,
                        available,
                    });
                }
                Err(e) => {
                    self.compensate(event_id, &reserved).await;
                    return Err(e.into());
                }
            }
        }

        // 5. 事务落库订单（event_id 唯一约束保证重复落库取回原单）
        let new_order = NewOrder {
            event_id: event_id.to_string(),
            user_id: data.user_id.clone(),
            customer_name: data.customer_name.clone(),
            customer_email: data.customer_email.clone(),
            customer_address: data.customer_address.clone(),
            total_amount: data.total_amount,
            status: OrderStatus::Pending,
            items: lines
                .iter()
                .map(|line| NewOrderItem {
                    product_id: line.product_id.clone(),
                    product_name: line.product_name.clone(),
                    product_price: line.product_price,
                    product_image: line.product_image.clone(),
                    quantity: line.quantity,
                    size: line.size.clone(),
                    color: line.color.clone(),
                })
                .collect(),
        };

        let order = match self.orders.create(new_order).await {
            Ok(order) => order,
            Err(e) => {
                // 订单落库失败必须把预占的库存还回去
                warn!(event_id, error = %e, "订单落库失败，开始补偿");
                self.compensate(event_id, &reserved).await;
                return Err(e.into());
            }
        };

        let step = SagaStep::OrderPersisted { order_id: order.id };
        if let Err(e) = self.saga_log.append(event_id, &step).await {
            // 订单已落库且带 event_id 唯一约束，重试续跑不会建出副本，
            // 但缺了这条日志会让重试多做一轮幂等落库，记下来便于排查
            warn!(event_id, order_id = order.id, error = %e, "ORDER_PERSISTED 步骤写入失败");
            return Err(e.into());
        }

        // 6. 清空购物车是尽力而为，失败不影响订单结果
        self.notifier.request_cart_clear(&data.user_id).await;

        info!(
            event_id,
            order_id = order.id,
            user_id = %data.user_id,
            item_count = lines.len(),
            total_amount = data.total_amount,
            "下单 Saga 完成"
        );
        Ok(SagaResult {
            order_id: order.id,
            item_count: lines.len(),
        })
    }

    /// 补偿：回补全部预占库存并记录 COMPENSATED 步骤
    async fn compensate(&self, event_id: &str, reserved: &[(String, i32)]) {
        if reserved.is_empty() {
            return;
        }

        for (product_id, quantity) in reserved {
            match self.products.restock(product_id, *quantity).await {
                Ok(Some(new_stock)) => {
                    info!(event_id, product_id = %product_id, quantity, new_stock, "库存已回补");
                }
                Ok(None) => {
                    // 商品在预占后被删除，回补无处可去，需对账修复
                    error!(event_id, product_id = %product_id, quantity, "回补失败：商品不存在");
                }
                Err(e) => {
                    error!(
                        event_id,
                        product_id = %product_id,
                        quantity,
                        error = %e,
                        "回补失败，需对账修复"
                    );
                }
            }
        }
        observability::record_stock_compensation(reserved.len());

        if let Err(e) = self.saga_log.append(event_id, &SagaStep::Compensated).await {
            error!(event_id, error = %e, "COMPENSATED 步骤写入失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line(product_id: &str, quantity: i32, size: Option<&str>) -> OrderLine {
        OrderLine {
            product_id: product_id.to_string(),
            product_name: format!("商品 {product_id}"),
            product_price: 199.0,
            product_image: None,
            quantity,
            size: size.map(String::from),
            color: None,
        }
    }

    #[test]
    fn test_replay_empty_log() {
        let state = SagaState::replay(&[]);
        assert!(state.reserved.is_empty());
        assert!(state.persisted_order_id.is_none());
    }

    #[test]
    fn test_replay_compensation_clears_reservations() {
        let steps = vec![
            SagaStep::StockReserved {
                product_id: "prod-001".to_string(),
                quantity: 2,
            },
            SagaStep::StockReserved {
                product_id: "prod-002".to_string(),
                quantity: 1,
            },
            SagaStep::Compensated,
        ];
        let state = SagaState::replay(&steps);
        assert!(state.reserved.is_empty());
        assert!(state.persisted_order_id.is_none());
    }

    #[test]
    fn test_replay_partial_reservation_then_persisted() {
        let steps = vec![
            SagaStep::StockReserved {
                product_id: "prod-001".to_string(),
                quantity: 2,
            },
            SagaStep::OrderPersisted { order_id: 7 },
        ];
        let state = SagaState::replay(&steps);
        assert_eq!(state.reserved, vec![("prod-001".to_string(), 2)]);
        assert_eq!(state.persisted_order_id, Some(7));
        assert_eq!(state.reserved_quantity("prod-001"), 2);
    }

    #[test]
    fn test_replay_sums_reservations_per_product() {
        // 同一商品可能分多条 STOCK_RESERVED（多行订单或分次补扣）
        let steps = vec![
            SagaStep::StockReserved {
                product_id: "prod-001".to_string(),
                quantity: 2,
            },
            SagaStep::StockReserved {
                product_id: "prod-001".to_string(),
                quantity: 2,
            },
        ];
        let state = SagaState::replay(&steps);
        assert_eq!(state.reserved_quantity("prod-001"), 4);
        assert_eq!(state.reserved_quantity("prod-002"), 0);
    }

    #[test]
    fn test_aggregate_demand_merges_lines_of_same_product() {
        // 同商品不同尺码各占一行，聚合为商品粒度的合计数量
        let lines = vec![
            sample_line("prod-001", 2, Some("42")),
            sample_line("prod-001", 2, Some("43")),
            sample_line("prod-002", 1, None),
        ];
        let demand = aggregate_demand(&lines);
        assert_eq!(demand.len(), 2);
        assert_eq!(demand[0].product_id, "prod-001");
        assert_eq!(demand[0].quantity, 4);
        assert_eq!(demand[1].product_id, "prod-002");
        assert_eq!(demand[1].quantity, 1);
    }
}
