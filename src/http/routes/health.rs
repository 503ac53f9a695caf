//! 健康检查路由
//!
//! 路由：GET /llm/health
//! 记录存储与容量存储任一不可用时返回 503。

use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tracing::error;

use crate::http::HttpServerState;
use crate::infra::metrics;
use crate::model::Category;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route("/llm/health", get(health_check))
}

async fn health_check(State(state): State<HttpServerState>) -> Response {
    if let Err(e) = state.records.ping().await {
        error!("❌ 健康检查失败（记录存储）: {}", e);
        return unhealthy(format!("record store: {}", e));
    }
    if let Err(e) = state.controller.store().ping().await {
        error!("❌ 健康检查失败（容量存储）: {}", e);
        return unhealthy(format!("capacity store: {}", e));
    }

    let capacity = match state.controller.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => return unhealthy(format!("capacity store: {}", e)),
    };

    let mut queue_depth = BTreeMap::new();
    for category in Category::ALL {
        match state.queue.len(category).await {
            Ok(depth) => {
                metrics::record_queue_depth(category, depth);
                queue_depth.insert(category, depth);
            }
            Err(e) => return unhealthy(format!("overflow queue: {}", e)),
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "capacity": capacity,
            "queue_depth": queue_depth,
        })),
    )
        .into_response()
}

fn unhealthy(detail: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "unhealthy", "detail": detail })),
    )
        .into_response()
}
