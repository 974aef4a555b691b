//! 事件处理服务入口
//!
//! 装配顺序：配置 → 可观测性 → 三个数据库连接池 → Kafka 生产者/死信
//! 组件 → 存储与 Saga → 任务队列与调度器 → 消费者。消费者创建失败
//! 直接退出进程，由编排层重启；生产者是惰性连接，broker 暂不可达
//! 不阻碍启动。

use std::sync::Arc;

use anyhow::Context;
use event_processor::cart::{CartService, HttpCartService};
use event_processor::consumer::EventConsumer;
use event_processor::notifier::{KafkaNotifier, Notifier};
use event_processor::processor::EventProcessor;
use event_processor::queue::{JobDispatcher, QueueConfig, job_queue};
use event_processor::saga::OrderSaga;
use event_processor::store::pg::{PgEventLogStore, PgOrderStore, PgProductStore, PgSagaLogStore};
use event_processor::store::{EventLogStore, OrderStore, ProductStore, SagaLogStore};
use storefront_shared::config::AppConfig;
use storefront_shared::database::Database;
use storefront_shared::dlq::{DlqConsumer, DlqProducer};
use storefront_shared::kafka::EventProducer;
use storefront_shared::observability;
use storefront_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "event-processor";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 仅本地开发使用，缺失不算错误
    dotenvy::dotenv().ok();

    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败（{e}），使用默认配置");
        AppConfig::default()
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(SERVICE_NAME);
    observability::init(&obs_config)
        .await
        .context("初始化可观测性失败")?;

    info!(environment = %config.environment, "事件处理服务启动中");

    // 三个独立数据库：事件库（审计 + Saga 日志）、库存库、订单库
    let event_db = Database::connect(&config.event_db)
        .await
        .context("连接事件库失败")?;
    let inventory_db = Database::connect(&config.inventory_db)
        .await
        .context("连接库存库失败")?;
    let order_db = Database::connect(&config.order_db)
        .await
        .context("连接订单库失败")?;

    // Kafka 出口：通知、死信队列共用一个惰性生产者
    let producer = Arc::new(EventProducer::new(&config.kafka));
    let dlq = Arc::new(DlqProducer::new(
        Arc::clone(&producer),
        SERVICE_NAME,
        RetryPolicy::default(),
    ));
    let notifier: Arc<dyn Notifier> =
        Arc::new(KafkaNotifier::new(Arc::clone(&producer), Arc::clone(&dlq)));

    // 存储层
    let products: Arc<dyn ProductStore> =
        Arc::new(PgProductStore::new(inventory_db.pool().clone()));
    let orders: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(order_db.pool().clone()));
    let event_log: Arc<dyn EventLogStore> =
        Arc::new(PgEventLogStore::new(event_db.pool().clone()));
    let saga_log: Arc<dyn SagaLogStore> = Arc::new(PgSagaLogStore::new(event_db.pool().clone()));

    let cart: Arc<dyn CartService> =
        Arc::new(HttpCartService::new(&config.cart).context("创建购物车客户端失败")?);

    let saga = OrderSaga::new(
        Arc::clone(&products),
        Arc::clone(&orders),
        saga_log,
        cart,
        Arc::clone(&notifier),
    );
    let processor = Arc::new(EventProcessor::new(
        products,
        orders,
        event_log,
        saga,
        notifier,
    ));

    // 任务队列 + 调度器；业务消费者创建失败是致命错误：
    // 订阅不上就没有存在的意义
    let (queue, rx) = job_queue(config.worker.queue_capacity);
    let consumer =
        EventConsumer::new(&config.kafka, queue.clone()).context("创建事件消费者失败")?;

    // 位点提交句柄交给调度器，任务终局后才推进消费进度
    let dispatcher = JobDispatcher::new(
        queue,
        rx,
        QueueConfig::from(&config.worker),
        processor,
        Arc::clone(&dlq),
        consumer.committer(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    // 死信消费者按退避节奏把死信消息发回原始 topic，每轮重投扣减预算
    let dlq_consumer =
        DlqConsumer::new(&config.kafka, Arc::clone(&producer), RetryPolicy::default())
            .context("创建死信消费者失败")?;
    let dlq_handle = tokio::spawn(dlq_consumer.run(shutdown_rx.clone()));

    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    info!("事件处理服务已就绪");

    shutdown_signal().await;
    info!("收到退出信号，开始优雅关停");
    if shutdown_tx.send(true).is_err() {
        warn!("关停信号发送失败：所有任务已退出");
    }

    for (name, handle) in [
        ("consumer", consumer_handle),
        ("dispatcher", dispatcher_handle),
        ("dlq", dlq_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "后台任务异常退出");
        }
    }

    event_db.close().await;
    inventory_db.close().await;
    order_db.close().await;

    info!("事件处理服务已停止");
    Ok(())
}

/// 等待退出信号（Ctrl+C 或 SIGTERM）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "监听 Ctrl+C 失败");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "监听 SIGTERM 失败"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
