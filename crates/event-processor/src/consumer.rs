//! Kafka 消费入口
//!
//! 订阅库存与订单两个 topic，把消息解析为事件信封后投入任务队列——
//! 消费线程只做解析与入队，真正的处理在调度器的并发/速率控制之下进行。
//! 消费者创建失败视为致命错误（配置错误或 broker 地址无效），由进程
//! 启动阶段直接退出。
//!
//! 消费位点不随入队推进：受理的消息由调度器在任务终局后经
//! [`OffsetCommitter`] 存储位点，崩溃时队列中未完成的事件会被重新投递。
//! 只有确定不会再处理的消息（去重拒绝、解析失败）在消费侧就地推进。

use storefront_shared::config::KafkaConfig;
use storefront_shared::error::ShopError;
use storefront_shared::events::DomainEvent;
use storefront_shared::kafka::{ConsumerMessage, KafkaConsumer, OffsetCommitter, topics};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::queue::JobQueue;

/// 事件消费者
pub struct EventConsumer {
    consumer: KafkaConsumer,
    queue: JobQueue,
}

impl EventConsumer {
    /// 创建并订阅；任一步失败都应让进程启动失败
    pub fn new(config: &KafkaConfig, queue: JobQueue) -> Result<Self, ShopError> {
        let consumer = KafkaConsumer::new(config, None)?.manual_offsets();
        consumer.subscribe(&[topics::INVENTORY_EVENTS, topics::ORDER_EVENTS])?;
        Ok(Self { consumer, queue })
    }

    /// 位点提交句柄，交给调度器在任务终局后推进消费进度
    pub fn committer(&self) -> OffsetCommitter {
        self.consumer.committer()
    }

    /// 运行消费循环直到收到关停信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let queue = self.queue;
        let committer = self.consumer.committer();
        self.consumer
            .start(shutdown, |msg| {
                let queue = queue.clone();
                let committer = committer.clone();
                async move {
                    let (topic, partition, offset) = (msg.topic.clone(), msg.partition, msg.offset);
                    match handle_message(&queue, msg).await {
                        // 受理的消息等任务终局，由调度器推进位点
                        Ok(true) => Ok(()),
                        // 去重拒绝的消息不会再被处理，就地推进
                        Ok(false) => committer.store(&topic, partition, offset),
                        Err(e) => {
                            // 解析不出来的消息重投多少次都一样，推进位点防止
                            // 重启后反复收到同一条坏消息
                            if let Err(store_err) = committer.store(&topic, partition, offset) {
                                warn!(topic = %topic, partition, offset, error = %store_err, "推进消费位点失败");
                            }
                            Err(e)
                        }
                    }
                }
            })
            .await;
    }
}

/// 解析消息并入队，返回是否受理
///
/// 解析失败返回错误由消费循环记录日志；这类消息没有可用的 event_id，
/// 无法审计也无法重试，只能依赖日志排查。
async fn handle_message(queue: &JobQueue, msg: ConsumerMessage) -> Result<bool, ShopError> {
    let event: DomainEvent = msg.deserialize_payload()?;

    let accepted = queue
        .enqueue(event.clone(), &msg.topic, msg.partition, msg.offset)
        .await?;
    if accepted {
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            topic = %msg.topic,
            "事件已入队"
        );
    } else {
        warn!(
            event_id = %event.event_id,
            topic = %msg.topic,
            "事件被去重拒绝，未入队"
        );
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job_queue;
    use storefront_shared::events::EventType;

    fn message_with(payload: &str) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 42,
            key: None,
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_handle_message_enqueues_event() {
        let (queue, mut rx) = job_queue(16);
        let msg = message_with(
            r#"{
                "eventId": "evt-001",
                "eventType": "ORDER_CREATED",
                "timestamp": 1736936000000,
                "data": {"userId": "user-001"}
            }"#,
        );

        assert!(handle_message(&queue, msg).await.unwrap());

        let job = rx.recv().await.unwrap();
        assert_eq!(job.event.event_id, "evt-001");
        assert_eq!(job.event.event_type, EventType::OrderCreated);
        assert_eq!(job.topic, topics::ORDER_EVENTS);
        assert_eq!(job.attempt, 1);
        // 位点元数据进入任务，终局后由调度器推进消费进度
        assert_eq!(job.partition, 0);
        assert_eq!(job.offset, 42);
    }

    #[tokio::test]
    async fn test_handle_message_rejects_bad_payload() {
        let (queue, mut rx) = job_queue(16);
        let msg = message_with("not json at all");

        assert!(handle_message(&queue, msg).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_message_deduplicates() {
        let (queue, mut rx) = job_queue(16);
        let payload = r#"{
            "eventId": "evt-dup",
            "eventType": "INVENTORY_STOCK_REDUCED",
            "timestamp": 1736936000000,
            "data": {"productId": "prod-001", "quantity": 1}
        }"#;

        assert!(handle_message(&queue, message_with(payload)).await.unwrap());
        // 重复消息被拒绝受理，位点由消费侧就地推进
        assert!(!handle_message(&queue, message_with(payload)).await.unwrap());

        // 同一 event_id 只入队一次
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
