//! Prometheus 指标：准入、提交结果、队列消费、队列深度与剩余容量
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 未初始化时 `metrics::*!` 宏为空操作，测试中无需安装。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

use crate::model::Category;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_ADMISSION_GRANTED: &str = "llm_limiter_admission_granted_total";
const COUNTER_ADMISSION_TIMED_OUT: &str = "llm_limiter_admission_timed_out_total";
const COUNTER_SUBMISSIONS: &str = "llm_limiter_submissions_total";
const COUNTER_DRAIN_OUTCOMES: &str = "llm_limiter_drain_outcomes_total";
const COUNTER_MALFORMED_ENTRIES: &str = "llm_limiter_malformed_entries_total";
const HISTOGRAM_GENERATION_DURATION: &str = "llm_limiter_generation_duration_seconds";
const GAUGE_QUEUE_DEPTH: &str = "llm_limiter_queue_depth";
const GAUGE_CAPACITY_AVAILABLE: &str = "llm_limiter_capacity_available";
const GAUGE_REDIS_POOL_ACTIVE: &str = "llm_limiter_redis_pool_active";
const GAUGE_REDIS_POOL_IDLE: &str = "llm_limiter_redis_pool_idle";

/// 初始化 Prometheus 指标（安装全局 Recorder，返回 Handle 用于 HTTP 暴露）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 是否已初始化（可供 /metrics 使用）
pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式，供 GET /metrics 使用。
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 准入成功 +1
pub fn record_admission_granted(category: Category) {
    metrics::counter!(COUNTER_ADMISSION_GRANTED, "category" => category.as_str()).increment(1);
}

/// 准入等待超时 +1
pub fn record_admission_timed_out(category: Category) {
    metrics::counter!(COUNTER_ADMISSION_TIMED_OUT, "category" => category.as_str()).increment(1);
}

/// 提交结果：completed / failed / queued
pub fn record_submission(category: Category, outcome: &'static str) {
    metrics::counter!(
        COUNTER_SUBMISSIONS,
        "category" => category.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// 队列消费结果：completed / failed / exhausted / requeued
pub fn record_drain_outcome(category: Category, outcome: &'static str) {
    metrics::counter!(
        COUNTER_DRAIN_OUTCOMES,
        "category" => category.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// 丢弃的异常队列条目 +1
pub fn record_malformed_entry(category: Category) {
    metrics::counter!(COUNTER_MALFORMED_ENTRIES, "category" => category.as_str()).increment(1);
}

/// 单次生成调用耗时
pub fn record_generation_duration(category: Category, duration_secs: f64) {
    metrics::histogram!(HISTOGRAM_GENERATION_DURATION, "category" => category.as_str())
        .record(duration_secs);
}

/// 更新队列深度（Gauge）
pub fn record_queue_depth(category: Category, depth: usize) {
    metrics::gauge!(GAUGE_QUEUE_DEPTH, "category" => category.as_str()).set(depth as f64);
}

/// 更新剩余容量（Gauge）
pub fn record_capacity_available(category: Category, available: i64) {
    metrics::gauge!(GAUGE_CAPACITY_AVAILABLE, "category" => category.as_str())
        .set(available as f64);
}

/// 更新 Redis 连接池状态（Gauge）
pub fn record_redis_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_REDIS_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_REDIS_POOL_IDLE).set(idle as f64);
}
