//! 状态查询路由
//!
//! 路由：GET /llm/status/{request_id}

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::http::HttpServerState;
use crate::model::{Category, RequestRecord, RequestStatus};

/// 状态响应（不回显输入载荷）
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub request_id: String,
    pub category: Category,
    pub status: RequestStatus,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RequestRecord> for StatusResponse {
    fn from(record: RequestRecord) -> Self {
        Self {
            request_id: record.request_id,
            category: record.category,
            status: record.status,
            response: record.response,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route("/llm/status/{request_id}", get(get_status))
}

async fn get_status(
    State(state): State<HttpServerState>,
    Path(request_id): Path<String>,
) -> Result<Json<StatusResponse>> {
    let record = state.submission.status(&request_id).await?;
    Ok(Json(record.into()))
}
