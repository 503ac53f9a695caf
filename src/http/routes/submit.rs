//! 提交路由
//!
//! 路由：POST /llm/submit
//! 表单：text（可选）、files（可多个）

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use axum_extra::extract::Multipart;
use serde_json::json;
use tracing::info;

use crate::error::{Result, ServerError};
use crate::http::HttpServerState;
use crate::model::{Attachment, GenerationInput};
use crate::service::classifier::guess_mime_type;
use crate::service::SubmissionOutcome;

/// 单次提交的请求体上限
pub(crate) const MAX_SUBMISSION_BYTES: usize = 25 * 1024 * 1024;

const QUEUED_MESSAGE: &str =
    "Your request has been queued due to high demand. Check status later.";

/// 创建提交路由
pub fn create_route() -> Router<HttpServerState> {
    Router::new().route(
        "/llm/submit",
        post(submit_request).layer(DefaultBodyLimit::max(MAX_SUBMISSION_BYTES)),
    )
}

/// 提交处理器
async fn submit_request(
    State(state): State<HttpServerState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let input = read_submission(&mut multipart).await?;
    info!(
        "📨 提交请求: text_len={}, files={}",
        input.text.as_deref().map_or(0, str::len),
        input.attachments.len()
    );

    let outcome = state.submission.submit(input).await?;
    Ok(outcome_response(outcome))
}

/// 解析 multipart/form-data：text 可选；files 可重复
pub(crate) async fn read_submission(multipart: &mut Multipart) -> Result<GenerationInput> {
    let mut input = GenerationInput::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("解析 multipart 失败: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "text" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::Validation(format!("读取 text 失败: {}", e)))?;
                if !text.trim().is_empty() {
                    input.text = Some(text);
                }
            }
            "files" | "file" => {
                let filename = field.file_name().map(|s| s.to_string());
                let mime_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| guess_mime_type(filename.as_deref()).to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::Validation(format!("读取文件数据失败: {}", e)))?;
                // 浏览器在未选择文件时也会发送空的 files 字段
                if data.is_empty() && filename.as_deref().unwrap_or("").is_empty() {
                    continue;
                }
                input.attachments.push(Attachment {
                    filename,
                    mime_type,
                    data: data.to_vec(),
                });
            }
            _ => {}
        }
    }

    Ok(input)
}

fn outcome_response(outcome: SubmissionOutcome) -> Response {
    match outcome {
        SubmissionOutcome::Completed { request_id, output } => (
            StatusCode::OK,
            Json(json!({ "request_id": request_id, "response": output })),
        )
            .into_response(),
        SubmissionOutcome::Queued { request_id } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": request_id,
                "status": "queued",
                "message": QUEUED_MESSAGE,
            })),
        )
            .into_response(),
        SubmissionOutcome::Failed { request_id, error } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "request_id": request_id, "status": "failed", "error": error })),
        )
            .into_response(),
    }
}
