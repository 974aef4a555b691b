//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义，避免各服务重复编写样板代码。

use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::ShopError;
use crate::events::DomainEvent;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，防止字符串散落在各服务中导致拼写不一致
pub mod topics {
    pub const INVENTORY_EVENTS: &str = "inventory-events";
    pub const ORDER_EVENTS: &str = "order-events";
    pub const NOTIFICATION_EVENTS: &str = "notification-events";
    pub const CART_EVENTS: &str = "cart-events";
    pub const DEAD_LETTER_QUEUE: &str = "shop-dlq";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str, ShopError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| ShopError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, ShopError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ShopError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// EventProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 与消费端不同，生产者采用惰性连接：进程启动时不要求 broker 可达，
/// 首次发送时才创建底层 `FutureProducer` 并缓存复用。发送失败时
/// 重建一次生产者再重试，仍失败则把错误交还调用方决定（写死信队列、
/// 退避重试或放弃）。不在本层做本地缓冲，进程崩溃时在途消息即丢失。
pub struct EventProducer {
    config: KafkaConfig,
    inner: Mutex<Option<FutureProducer>>,
}

impl EventProducer {
    /// 创建生产者句柄（不建立连接）
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            config: config.clone(),
            inner: Mutex::new(None),
        }
    }

    /// 构建底层生产者
    ///
    /// 设置 `message.timeout.ms` 为 5 秒——5 秒内仍无法投递的消息
    /// 应由上层重试或写入死信队列，而非无限等待。
    fn build(config: &KafkaConfig) -> Result<FutureProducer, ShopError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(producer)
    }

    /// 获取（或惰性创建）底层生产者
    ///
    /// `FutureProducer` 内部是 Arc 包装，clone 后即可释放锁，
    /// 发送过程不持有互斥量。
    async fn producer(&self) -> Result<FutureProducer, ShopError> {
        let mut guard = self.inner.lock().await;
        if let Some(producer) = guard.as_ref() {
            return Ok(producer.clone());
        }

        let producer = Self::build(&self.config)?;
        *guard = Some(producer.clone());
        Ok(producer)
    }

    /// 丢弃缓存的生产者，下次发送时重建
    async fn reset(&self) {
        *self.inner.lock().await = None;
    }

    /// 发送一次，不含重试
    async fn try_send(
        producer: &FutureProducer,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), ShopError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| ShopError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 发送原始字节消息
    ///
    /// 首次失败后重建生产者并重试一次，覆盖 broker 滚动重启、
    /// 连接被网络设备静默回收等场景；第二次失败向上传播。
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), ShopError> {
        let producer = self.producer().await?;

        match Self::try_send(&producer, topic, key, payload).await {
            Ok(delivery) => Ok(delivery),
            Err(e) => {
                warn!(topic, key, error = %e, "发送失败，重建生产者后重试一次");
                self.reset().await;

                let producer = self.producer().await?;
                Self::try_send(&producer, topic, key, payload).await
            }
        }
    }

    /// 将事件信封序列化为 JSON 后发送，以 event_id 作为消息 key
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn publish_event(
        &self,
        topic: &str,
        event: &DomainEvent,
    ) -> Result<(i32, i64), ShopError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ShopError::Serialization(format!("事件序列化失败: {e}")))?;

        self.send(topic, &event.event_id, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义，
/// 确保进程退出时不会丢失正在处理的消息。
///
/// 位点提交采用"后台定时提交 + 显式存储"：`enable.auto.offset.store`
/// 关闭后，后台提交定时器只会提交已显式存储的位点。默认在 handler
/// 成功返回后存储；通过 [`KafkaConsumer::manual_offsets`] 可改为由
/// 调用方在消息真正处理完成后经 [`OffsetCommitter`] 推进，崩溃时
/// 未完成的消息会在重启后重新投递。
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    /// handler 成功后是否立即存储位点
    auto_store: bool,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "event-processor" 和 "event-processor.dlq"。
    /// 创建失败意味着配置或依赖不可用，调用方应视为致命错误。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, ShopError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            // 后台定时器只提交显式存储过的位点，处理完成前位点不前移
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer: Arc::new(consumer),
            auto_store: true,
        })
    }

    /// 切换为手动位点模式
    ///
    /// handler 返回后不再自动存储位点，由调用方在消息真正处理完成后
    /// 通过 [`OffsetCommitter`] 推进。适用于"入队后异步处理"的消费
    /// 路径：入队成功不等于处理完成。
    pub fn manual_offsets(mut self) -> Self {
        self.auto_store = false;
        self
    }

    /// 获取可跨任务传递的位点提交句柄
    pub fn committer(&self) -> OffsetCommitter {
        OffsetCommitter {
            consumer: Arc::clone(&self.consumer),
        }
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ShopError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ShopError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler 处理；handler 返回错误只记录日志而不中断循环，
    ///   避免单条坏消息导致整个消费者停止。
    /// - 关闭信号变为 `true` 时退出循环，确保正在执行的 handler 能自然完成。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), ShopError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            match handler(msg).await {
                                Ok(()) => {
                                    if self.auto_store
                                        && let Err(e) =
                                            self.consumer.store_offset_from_message(&borrowed_msg)
                                    {
                                        error!(error = %e, "存储消费位点失败");
                                    }
                                }
                                Err(e) => {
                                    error!(error = %e, "处理 Kafka 消息失败");
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OffsetCommitter
// ---------------------------------------------------------------------------

/// 位点提交句柄
///
/// 在消息处理完成后存储其位点，后台提交定时器随后把存储值写回 broker。
/// 同分区任务乱序完成时以最后一次存储为准，重启后可能重复投递少量
/// 消息，由事件日志的幂等检查吸收。
#[derive(Clone)]
pub struct OffsetCommitter {
    consumer: Arc<StreamConsumer>,
}

impl OffsetCommitter {
    /// 存储已处理消息的位点
    ///
    /// 传入消息自身的 offset 即可，librdkafka 存储并提交的是 offset+1。
    pub fn store(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ShopError> {
        self.consumer
            .store_offset(topic, partition, offset)
            .map_err(|e| ShopError::Kafka(format!("存储消费位点失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
