//! 事件处理服务
//!
//! 消费库存与订单事件，经内部任务队列限流后分发到各事件处理器；
//! ORDER_CREATED 事件由下单 Saga 编排：校验库存 → 原子预占 → 订单落库 →
//! 清空购物车 → 结果通知，失败时回补库存。所有事件以 event_id 为幂等键
//! 写入审计日志。

pub mod cart;
pub mod consumer;
pub mod error;
pub mod notifier;
pub mod processor;
pub mod queue;
pub mod saga;
pub mod store;
