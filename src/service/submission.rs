//! 提交路径：分类 → 短超时准入 → {立即处理 | 记录 queued 并入队}

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::{run_admitted, AcquireError, AdmissionController};
use crate::error::{Result, ServerError};
use crate::infra::{metrics, OverflowQueue};
use crate::model::{Category, GenerationInput, QueueEntry, RequestRecord, RequestStatus};
use crate::repository::RequestRecordStore;
use crate::service::classifier::classify;
use crate::service::generation::{ChunkStream, GenerationProcessor};

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// 立即处理成功
    Completed { request_id: String, output: String },
    /// 立即处理失败（已记录 failed）
    Failed { request_id: String, error: String },
    /// 准入超时，已入队等待后台处理
    Queued { request_id: String },
}

impl SubmissionOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            SubmissionOutcome::Completed { request_id, .. }
            | SubmissionOutcome::Failed { request_id, .. }
            | SubmissionOutcome::Queued { request_id } => request_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SubmissionOutcome::Completed { .. } => "completed",
            SubmissionOutcome::Failed { .. } => "failed",
            SubmissionOutcome::Queued { .. } => "queued",
        }
    }
}

/// 提交服务
pub struct SubmissionService {
    controller: Arc<AdmissionController>,
    records: Arc<dyn RequestRecordStore>,
    queue: Arc<OverflowQueue>,
    processor: Arc<dyn GenerationProcessor>,
    submit_timeout: Duration,
}

impl SubmissionService {
    pub fn new(
        controller: Arc<AdmissionController>,
        records: Arc<dyn RequestRecordStore>,
        queue: Arc<OverflowQueue>,
        processor: Arc<dyn GenerationProcessor>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            records,
            queue,
            processor,
            submit_timeout,
        }
    }

    /// 分类并提交，分配新的 request_id
    pub async fn submit(&self, input: GenerationInput) -> Result<SubmissionOutcome> {
        let category = classify(&input)?;
        let request_id = Uuid::new_v4().to_string();
        self.submit_classified(request_id, category, input).await
    }

    /// 提交已分类的请求
    pub async fn submit_classified(
        &self,
        request_id: String,
        category: Category,
        input: GenerationInput,
    ) -> Result<SubmissionOutcome> {
        let input_data = input.to_record_string()?;
        info!(request_id = %request_id, category = %category, "📥 收到生成请求");

        let outcome = match self.controller.acquire(category, self.submit_timeout).await {
            Ok(permit) => {
                self.process_inline(permit, &request_id, category, &input, &input_data)
                    .await
            }
            Err(AcquireError::TimedOut) => {
                warn!(request_id = %request_id, category = %category, "⏳ 准入超时，请求转入队列");
                self.defer(&request_id, category, input, &input_data).await?
            }
            Err(e) => {
                warn!(request_id = %request_id, category = %category, "⚠️ 准入不可用，请求转入队列: {}", e);
                self.defer(&request_id, category, input, &input_data).await?
            }
        };

        metrics::record_submission(category, outcome.label());
        Ok(outcome)
    }

    /// 流式生成：与提交路径共用准入，但无法排队
    ///
    /// 准入超时或存储不可用时返回 ServiceUnavailable；许可随流一起持有，
    /// 流结束时显式释放，客户端中途断开时由 `Drop` 释放。
    pub async fn stream(&self, input: GenerationInput) -> Result<ChunkStream> {
        let category = classify(&input)?;
        let permit = match self.controller.acquire(category, self.submit_timeout).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(category = %category, "⏳ 流式请求未获得准入: {}", e);
                metrics::record_submission(category, "rejected");
                return Err(ServerError::ServiceUnavailable(format!(
                    "{} capacity is busy, retry later",
                    category
                )));
            }
        };

        let chunks = match self.processor.process_stream(category, &input).await {
            Ok(chunks) => chunks,
            Err(e) => {
                if let Err(release_err) = permit.release().await {
                    error!(category = %category, "❌ 释放容量失败: {}", release_err);
                }
                metrics::record_submission(category, "failed");
                return Err(e);
            }
        };
        info!(category = %category, "📡 开始流式输出");
        metrics::record_submission(category, "streamed");

        let guarded = stream::unfold((chunks, Some(permit)), |(mut chunks, mut permit)| async move {
            match chunks.next().await {
                Some(chunk) => Some((chunk, (chunks, permit))),
                None => {
                    if let Some(permit) = permit.take() {
                        let category = permit.category();
                        if let Err(e) = permit.release().await {
                            error!(category = %category, "❌ 释放容量失败: {}", e);
                        }
                    }
                    None
                }
            }
        });
        Ok(guarded.boxed())
    }

    /// 查询请求记录
    pub async fn status(&self, request_id: &str) -> Result<RequestRecord> {
        self.records.get(request_id).await
    }

    async fn process_inline(
        &self,
        permit: crate::admission::AdmissionPermit,
        request_id: &str,
        category: Category,
        input: &GenerationInput,
        input_data: &str,
    ) -> SubmissionOutcome {
        if let Err(e) = self
            .records
            .save(request_id, category, input_data, None, RequestStatus::Processing)
            .await
        {
            warn!(request_id, "⚠️ 记录 processing 状态失败: {}", e);
        }

        let started = std::time::Instant::now();
        let result = run_admitted(permit, self.processor.process(category, input))
            .await
            .and_then(|inner| inner);
        metrics::record_generation_duration(category, started.elapsed().as_secs_f64());

        let (outcome, status, response) = match result {
            Ok(output) => {
                info!(request_id, category = %category, "✅ 请求处理完成");
                let response = output.clone();
                (
                    SubmissionOutcome::Completed {
                        request_id: request_id.to_string(),
                        output,
                    },
                    RequestStatus::Completed,
                    response,
                )
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(request_id, category = %category, "❌ 请求处理失败: {}", detail);
                (
                    SubmissionOutcome::Failed {
                        request_id: request_id.to_string(),
                        error: detail.clone(),
                    },
                    RequestStatus::Failed,
                    detail,
                )
            }
        };

        // 结果已产生，落库失败只记录日志，不影响返回给调用方
        if let Err(e) = self
            .records
            .save(request_id, category, input_data, Some(&response), status)
            .await
        {
            error!(request_id, status = %status, "❌ 保存终态记录失败: {}", e);
        }
        outcome
    }

    /// 记录 queued 并入队；任一步失败时返回 ServiceUnavailable
    async fn defer(
        &self,
        request_id: &str,
        category: Category,
        input: GenerationInput,
        input_data: &str,
    ) -> Result<SubmissionOutcome> {
        self.records
            .save(request_id, category, input_data, None, RequestStatus::Queued)
            .await
            .map_err(|e| {
                error!(request_id, "❌ 保存 queued 记录失败: {}", e);
                ServerError::ServiceUnavailable(format!("cannot persist queued request: {}", e))
            })?;

        let entry = QueueEntry::new(request_id, category, input);
        if let Err(e) = self.queue.push(&entry).await {
            error!(request_id, category = %category, "❌ 入队失败: {}", e);
            // 避免记录永远停在 queued
            let detail = format!("failed to enqueue request: {}", e);
            if let Err(save_err) = self
                .records
                .save(request_id, category, input_data, Some(&detail), RequestStatus::Failed)
                .await
            {
                error!(request_id, "❌ 标记 failed 失败: {}", save_err);
            }
            return Err(ServerError::ServiceUnavailable(detail));
        }

        if let Ok(depth) = self.queue.len(category).await {
            metrics::record_queue_depth(category, depth);
        }
        Ok(SubmissionOutcome::Queued {
            request_id: request_id.to_string(),
        })
    }
}
