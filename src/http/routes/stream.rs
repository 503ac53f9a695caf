//! 流式生成路由
//!
//! 路由：POST /llm/stream
//! 表单与 /llm/submit 相同；容量不足时不排队，直接返回 503

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use axum_extra::extract::Multipart;
use tracing::info;

use crate::error::Result;
use crate::http::routes::submit::{read_submission, MAX_SUBMISSION_BYTES};
use crate::http::HttpServerState;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route(
        "/llm/stream",
        post(stream_request).layer(DefaultBodyLimit::max(MAX_SUBMISSION_BYTES)),
    )
}

async fn stream_request(
    State(state): State<HttpServerState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let input = read_submission(&mut multipart).await?;
    info!(
        "📡 流式请求: text_len={}, files={}",
        input.text.as_deref().map_or(0, str::len),
        input.attachments.len()
    );

    let chunks = state.submission.stream(input).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response())
}
