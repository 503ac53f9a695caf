//! GET /metrics - Prometheus 抓取端点

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::HttpServerState;
use crate::infra::metrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// 返回 Prometheus 文本格式指标；抓取前刷新剩余容量与 Redis 连接池 Gauge。
/// 若未初始化指标（init 未调用），返回 503。
pub async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    if !metrics::is_initialized() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }

    // snapshot 内部会更新容量 Gauge，失败不影响其它指标
    if let Err(e) = state.controller.snapshot().await {
        tracing::warn!("⚠️ 刷新容量指标失败: {}", e);
    }

    if let Some(redis) = &state.redis {
        let pool = redis.pool_state();
        metrics::record_redis_pool(pool.connections - pool.idle_connections, pool.idle_connections);
    }

    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
