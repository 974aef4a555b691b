//! 统一可观测性模块
//!
//! 提供 logging 与 Prometheus 指标的统一初始化。
//! 服务通过单一入口点配置可观测性，确保一致的指标命名。
//! 指标通过独立的 HTTP 端口暴露 `/metrics` 与 `/health`，供 Prometheus 抓取
//! 和容器探针使用。

use std::net::SocketAddr;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

// ---------------------------------------------------------------------------
// ObservabilityConfig
// ---------------------------------------------------------------------------

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识指标的来源
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// 日志级别（如 "info", "debug"），可被 RUST_LOG 环境变量覆盖
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    #[serde(default)]
    pub json_logs: bool,

    /// 是否启用 Prometheus 指标导出
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Prometheus 指标导出端口
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_service_name() -> String {
    "unknown-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
            metrics_enabled: default_metrics_enabled(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名（配置文件中通常不写 service_name，由启动代码补齐）
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

// ---------------------------------------------------------------------------
// 初始化
// ---------------------------------------------------------------------------

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（结构化日志）
/// 2. Metrics（Prometheus 指标 + 独立 HTTP 端口）
pub async fn init(config: &ObservabilityConfig) -> Result<()> {
    init_tracing(config)?;

    info!(
        service = %config.service_name,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );

    if config.metrics_enabled {
        init_metrics(config).await?;
    }

    Ok(())
}

/// 初始化结构化日志
///
/// RUST_LOG 环境变量优先于配置文件中的 log_level，
/// 便于临时调低或调高日志级别排查问题。
fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()?;
    }

    Ok(())
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    start_metrics_server(addr, handle).await?;

    Ok(())
}

/// 注册通用指标（预定义的业务指标）
fn register_common_metrics(service_name: &str) {
    // 指标描述会出现在 /metrics 端点的 HELP 注释中

    metrics::describe_counter!("events_processed_total", "Total number of events processed");
    metrics::describe_histogram!(
        "event_processing_duration_seconds",
        "Event processing duration in seconds"
    );

    metrics::describe_counter!("job_retries_total", "Total number of event job retries");
    metrics::describe_counter!(
        "jobs_dead_lettered_total",
        "Total number of jobs sent to the dead letter queue"
    );

    metrics::describe_counter!("orders_created_total", "Total number of orders persisted");
    metrics::describe_counter!(
        "stock_compensations_total",
        "Total number of stock reservations rolled back"
    );

    metrics::describe_counter!(
        "notifications_published_total",
        "Total number of user notifications published"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(addr: SocketAddr, handle: PrometheusHandle) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录事件处理结果
#[inline]
pub fn record_event_processed(event_type: &str, status: &str, duration_secs: f64) {
    metrics::counter!(
        "events_processed_total",
        "event_type" => event_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "event_processing_duration_seconds",
        "event_type" => event_type.to_string()
    )
    .record(duration_secs);
}

/// 记录任务重试
#[inline]
pub fn record_job_retry(event_type: &str) {
    metrics::counter!(
        "job_retries_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// 记录任务进入死信队列
#[inline]
pub fn record_job_dead_lettered(event_type: &str) {
    metrics::counter!(
        "jobs_dead_lettered_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// 记录订单落库
#[inline]
pub fn record_order_created(item_count: usize) {
    metrics::counter!("orders_created_total").increment(1);
    metrics::counter!("order_items_created_total").increment(item_count as u64);
}

/// 记录库存预占回滚
#[inline]
pub fn record_stock_compensation(line_count: usize) {
    metrics::counter!("stock_compensations_total").increment(line_count as u64);
}

/// 记录通知发布
#[inline]
pub fn record_notification_published(kind: &str) {
    metrics::counter!(
        "notifications_published_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}
