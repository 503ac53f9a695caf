//! HTTP 路由模块
//!
//! 路由结构：
//! - `POST /llm/submit` - 提交生成请求（multipart：text + files）
//! - `POST /llm/stream` - 流式生成（不排队，容量不足返回 503）
//! - `GET /llm/status/{request_id}` - 查询请求状态
//! - `GET /llm/health` - 健康检查
//! - `GET /metrics` - Prometheus 抓取端点

pub mod health;
pub mod metrics;
pub mod status;
pub mod stream;
pub mod submit;

use axum::{routing::get, Router};
use crate::http::HttpServerState;

/// 创建所有路由
pub fn create_routes() -> Router<HttpServerState> {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .merge(submit::create_route()) // /llm/submit
        .merge(stream::create_route()) // /llm/stream
        .merge(status::create_route()) // /llm/status/{request_id}
        .merge(health::create_route()) // /llm/health
}
