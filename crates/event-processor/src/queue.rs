//! 任务队列与调度器
//!
//! 消费端把每条事件包成任务投入进程内队列，调度器在并发上限与速率
//! 上限内拉取执行。以 event_id 去重：同一事件在队列中最多一个在途
//! 任务。基础设施失败按指数退避重试，耗尽次数后进入失败集合并转发
//! 死信队列；已在失败集合中的事件不再受理。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use storefront_shared::config::WorkerConfig;
use storefront_shared::dlq::DlqProducer;
use storefront_shared::error::ShopError;
use storefront_shared::events::DomainEvent;
use storefront_shared::kafka::OffsetCommitter;
use storefront_shared::observability;
use storefront_shared::retry::RetryPolicy;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::processor::EventProcessor;

/// 队列中的一个处理任务
#[derive(Debug, Clone)]
pub struct EventJob {
    pub event: DomainEvent,
    pub topic: String,
    /// 消息所在分区，任务完成后随位点一起推进消费进度
    pub partition: i32,
    /// 消息位点
    pub offset: i64,
    /// 当前第几次尝试，从 1 计
    pub attempt: u32,
}

/// 重试耗尽的任务记录
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub event_id: String,
    pub event_type: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// 调度配置
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub max_jobs_per_second: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub capacity: usize,
}

impl From<&WorkerConfig> for QueueConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_jobs_per_second: config.max_jobs_per_second,
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            capacity: config.queue_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// 任务队列句柄（可克隆，消费端与调度器共享）
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<EventJob>,
    in_flight: Arc<DashMap<String, ()>>,
    failed: Arc<DashMap<String, FailedJob>>,
}

/// 创建任务队列，返回入队句柄与调度器侧的接收端
pub fn job_queue(capacity: usize) -> (JobQueue, mpsc::Receiver<EventJob>) {
    let (tx, rx) = mpsc::channel(capacity);
    let queue = JobQueue {
        tx,
        in_flight: Arc::new(DashMap::new()),
        failed: Arc::new(DashMap::new()),
    };
    (queue, rx)
}

impl JobQueue {
    /// 入队新事件，返回是否真正受理
    ///
    /// 重复 event_id（在途或已进失败集合）直接拒绝，保证同一事件
    /// 同时最多一个任务。
    pub async fn enqueue(
        &self,
        event: DomainEvent,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<bool, ShopError> {
        let event_id = event.event_id.clone();

        if self.failed.contains_key(&event_id) {
            debug!(event_id, "事件已在失败集合中，拒绝入队");
            return Ok(false);
        }
        if self.in_flight.insert(event_id.clone(), ()).is_some() {
            debug!(event_id, "事件已有在途任务，拒绝重复入队");
            return Ok(false);
        }

        let job = EventJob {
            event,
            topic: topic.to_string(),
            partition,
            offset,
            attempt: 1,
        };
        if self.tx.send(job).await.is_err() {
            self.in_flight.remove(&event_id);
            return Err(ShopError::Internal("任务队列已关闭".to_string()));
        }
        Ok(true)
    }

    /// 重试耗尽的任务快照
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.failed.iter().map(|e| e.value().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// JobDispatcher
// ---------------------------------------------------------------------------

/// 任务调度器
///
/// 以信号量限并发、以固定间隔限速率，逐个拉取任务派发到独立 task 执行。
/// 任务最终完成（成功或转入死信）后经 committer 推进消费位点，
/// 崩溃时未完成的事件会在重启后被重新投递。
pub struct JobDispatcher {
    queue: JobQueue,
    rx: mpsc::Receiver<EventJob>,
    config: QueueConfig,
    processor: Arc<EventProcessor>,
    dlq: Arc<DlqProducer>,
    committer: OffsetCommitter,
}

/// 速率门的派发间隔
///
/// 速率上限为 0 按 1 处理；间隔钳到最低 1ms，速率高于 1000/s 时
/// 整除结果为 0，而 interval 不接受零周期。
fn rate_gate_period(max_jobs_per_second: u32) -> Duration {
    let millis = 1000 / u64::from(max_jobs_per_second.max(1));
    Duration::from_millis(millis.max(1))
}

impl JobDispatcher {
    pub fn new(
        queue: JobQueue,
        rx: mpsc::Receiver<EventJob>,
        config: QueueConfig,
        processor: Arc<EventProcessor>,
        dlq: Arc<DlqProducer>,
        committer: OffsetCommitter,
    ) -> Self {
        Self {
            queue,
            rx,
            config,
            processor,
            dlq,
            committer,
        }
    }

    /// 运行调度循环，收到关停信号后不再派发新任务
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut rate_gate =
            tokio::time::interval(rate_gate_period(self.config.max_jobs_per_second));
        rate_gate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let retry = RetryPolicy {
            max_retries: self.config.max_attempts.saturating_sub(1),
            initial_delay: self.config.backoff_base,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        info!(
            concurrency = self.config.concurrency,
            max_jobs_per_second = self.config.max_jobs_per_second,
            max_attempts = self.config.max_attempts,
            "任务调度器已启动"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("任务调度器收到关停信号");
                        break;
                    }
                }
                job = self.rx.recv() => {
                    let Some(job) = job else {
                        info!("任务队列已关闭，调度器退出");
                        break;
                    };

                    rate_gate.tick().await;
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let queue = self.queue.clone();
                    let processor = Arc::clone(&self.processor);
                    let dlq = Arc::clone(&self.dlq);
                    let max_attempts = self.config.max_attempts;
                    let retry = retry.clone();
                    let committer = self.committer.clone();
                    tokio::spawn(async move {
                        run_job(job, queue, processor, dlq, max_attempts, retry, committer).await;
                        drop(permit);
                    });
                }
            }
        }

        // 等在途任务收尾
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("任务调度器已停止");
    }
}

/// 执行单个任务：成功出清在途标记，基础设施失败延迟重投，耗尽转死信。
/// 位点只在任务终局（成功或已写入死信）后推进。
async fn run_job(
    job: EventJob,
    queue: JobQueue,
    processor: Arc<EventProcessor>,
    dlq: Arc<DlqProducer>,
    max_attempts: u32,
    retry: RetryPolicy,
    committer: OffsetCommitter,
) {
    let event_id = job.event.event_id.clone();
    debug!(
        event_id,
        event_type = %job.event.event_type,
        attempt = job.attempt,
        "开始处理任务"
    );

    match processor.process(&job.event, &job.topic).await {
        Ok(outcome) => {
            debug!(event_id, outcome = ?outcome, "任务处理完成");
            queue.in_flight.remove(&event_id);
            if let Err(e) = committer.store(&job.topic, job.partition, job.offset) {
                warn!(event_id, error = %e, "推进消费位点失败");
            }
        }
        Err(e) if job.attempt < max_attempts => {
            // 退避后重投；在途标记保留，窗口期内拒绝同事件重复入队
            let delay = retry.delay_for_attempt(job.attempt.saturating_sub(1));
            warn!(
                event_id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "任务处理失败，稍后重试"
            );
            observability::record_job_retry(&job.event.event_type.to_string());

            let tx = queue.tx.clone();
            let in_flight = Arc::clone(&queue.in_flight);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let retry_job = EventJob {
                    attempt: job.attempt + 1,
                    ..job
                };
                if tx.send(retry_job).await.is_err() {
                    in_flight.remove(&event_id);
                    warn!(event_id, "重投失败：任务队列已关闭");
                }
            });
        }
        Err(e) => {
            error!(
                event_id,
                attempts = job.attempt,
                error = %e,
                "任务重试耗尽，转入死信队列"
            );
            let record = FailedJob {
                event_id: event_id.clone(),
                event_type: job.event.event_type.to_string(),
                attempts: job.attempt,
                last_error: e.to_string(),
                failed_at: Utc::now(),
            };
            // 先进失败集合再清在途标记，避免间隙里同事件重新入队
            queue.failed.insert(event_id.clone(), record);
            queue.in_flight.remove(&event_id);
            observability::record_job_dead_lettered(&job.event.event_type.to_string());

            match dlq.send_event_to_dlq(&job.event, &e.to_string()).await {
                Ok(()) => {
                    // 消息已在死信队列落地，原位点可以推进
                    if let Err(e) = committer.store(&job.topic, job.partition, job.offset) {
                        warn!(event_id, error = %e, "推进消费位点失败");
                    }
                }
                // 死信也写不进去时不动位点，重启后整条消息重新投递
                Err(dlq_err) => error!(event_id, error = %dlq_err, "写入死信队列失败"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_shared::events::EventType;

    fn sample_event() -> DomainEvent {
        DomainEvent::new(
            EventType::OrderCreated,
            serde_json::json!({"userId": "user-001"}),
        )
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_in_flight() {
        let (queue, _rx) = job_queue(16);
        let event = sample_event();

        assert!(
            queue
                .enqueue(event.clone(), "order-events", 0, 1)
                .await
                .unwrap()
        );
        // 同一 event_id 在途期间拒绝重复入队
        assert!(!queue.enqueue(event, "order-events", 0, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_failed_events() {
        let (queue, _rx) = job_queue(16);
        let event = sample_event();

        queue.failed.insert(
            event.event_id.clone(),
            FailedJob {
                event_id: event.event_id.clone(),
                event_type: "ORDER_CREATED".to_string(),
                attempts: 3,
                last_error: "数据库连接失败".to_string(),
                failed_at: Utc::now(),
            },
        );

        assert!(!queue.enqueue(event, "order-events", 0, 1).await.unwrap());
        assert_eq!(queue.failed_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_distinct_events_accepted() {
        let (queue, mut rx) = job_queue(16);

        assert!(
            queue
                .enqueue(sample_event(), "order-events", 0, 10)
                .await
                .unwrap()
        );
        assert!(
            queue
                .enqueue(sample_event(), "order-events", 1, 20)
                .await
                .unwrap()
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.attempt, 1);
        assert_ne!(first.event.event_id, second.event.event_id);
        // 位点元数据随任务走，完成后据此推进消费进度
        assert_eq!(first.partition, 0);
        assert_eq!(first.offset, 10);
        assert_eq!(second.partition, 1);
        assert_eq!(second.offset, 20);
    }

    #[test]
    fn test_rate_gate_period_clamps_to_one_millisecond() {
        assert_eq!(rate_gate_period(10), Duration::from_millis(100));
        // 高于 1000/s 时整除结果为 0，必须钳到 1ms
        assert_eq!(rate_gate_period(2000), Duration::from_millis(1));
        // 配置为 0 时按 1/s 兜底
        assert_eq!(rate_gate_period(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_queue_config_from_worker_config() {
        let worker = WorkerConfig::default();
        let config = QueueConfig::from(&worker);
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(2000));
    }
}
