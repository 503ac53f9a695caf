//! 生成服务调用
//!
//! 对核心而言是一个不透明、可失败的异步调用，本身不做重试；
//! 重试只发生在准入层（队列消费 Worker）。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{GenerationConfig, GenerationKind};
use crate::error::{Result, ServerError};
use crate::model::{Category, GenerationInput};

/// 分块输出
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// 生成能力接口
#[async_trait]
pub trait GenerationProcessor: Send + Sync {
    async fn process(&self, category: Category, input: &GenerationInput) -> Result<String>;

    /// 分块返回结果；默认把 `process` 的完整输出作为唯一一块
    async fn process_stream(
        &self,
        category: Category,
        input: &GenerationInput,
    ) -> Result<ChunkStream> {
        let output = self.process(category, input).await?;
        Ok(stream::once(async move { Ok(output) }).boxed())
    }

    fn name(&self) -> &'static str;
}

/// 按配置构造生成服务
pub fn build_processor(config: &GenerationConfig) -> Result<Arc<dyn GenerationProcessor>> {
    match config.kind {
        GenerationKind::Mock => Ok(Arc::new(MockGenerationProcessor::new(Duration::from_millis(
            config.mock_delay_ms,
        )))),
        GenerationKind::Http => Ok(Arc::new(HttpGenerationProcessor::new(config)?)),
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    text: Option<&'a str>,
    attachments: Vec<GenerateAttachment<'a>>,
}

#[derive(Serialize)]
struct GenerateAttachment<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: Option<String>,
    error: Option<String>,
}

/// HTTP 生成服务
pub struct HttpGenerationProcessor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    models: BTreeMap<Category, String>,
}

impl HttpGenerationProcessor {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            ServerError::Configuration("generation.endpoint is required for http kind".to_string())
        })?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ServerError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        info!("🤖 HTTP 生成服务: {} (timeout={}s)", endpoint, config.timeout_secs);
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            models: config.models.clone(),
        })
    }

    fn model_for(&self, category: Category) -> &str {
        self.models
            .get(&category)
            .map(String::as_str)
            .unwrap_or("gemini-2.0-flash")
    }
}

#[async_trait]
impl GenerationProcessor for HttpGenerationProcessor {
    async fn process(&self, category: Category, input: &GenerationInput) -> Result<String> {
        let body = GenerateRequest {
            model: self.model_for(category),
            text: input.text.as_deref(),
            attachments: input
                .attachments
                .iter()
                .map(|a| GenerateAttachment {
                    mime_type: &a.mime_type,
                    data: STANDARD.encode(&a.data),
                })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(category = %category, model = body.model, "调用生成服务");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(category = %category, "❌ 生成服务返回错误: status={}, body={}", status, error_text);
            return Err(ServerError::Generation(format!(
                "generation service returned {}: {}",
                status, error_text
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        match (parsed.text, parsed.error) {
            (Some(text), _) => Ok(text),
            (None, Some(err)) => Err(ServerError::Generation(err)),
            (None, None) => Err(ServerError::Generation(
                "generation service returned no text".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Mock 生成服务（开发和测试用）
///
/// 不调用真实服务，等待固定时长后回显输入
pub struct MockGenerationProcessor {
    delay: Duration,
}

impl MockGenerationProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl GenerationProcessor for MockGenerationProcessor {
    async fn process(&self, category: Category, input: &GenerationInput) -> Result<String> {
        info!(
            "[MOCK GENERATION] category={}, text_len={}, attachments={}",
            category,
            input.text.as_deref().map_or(0, str::len),
            input.attachments.len()
        );
        tokio::time::sleep(self.delay).await;
        Ok(format!(
            "[{}] {}",
            category,
            input.text.as_deref().unwrap_or("(attachments only)")
        ))
    }

    /// 按词分块，每块间隔 delay / 块数
    async fn process_stream(
        &self,
        category: Category,
        input: &GenerationInput,
    ) -> Result<ChunkStream> {
        let output = format!(
            "[{}] {}",
            category,
            input.text.as_deref().unwrap_or("(attachments only)")
        );
        let chunks: Vec<String> = output
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let pause = self.delay / chunks.len().max(1) as u32;
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(pause).await;
                Ok(chunk)
            })
            .boxed())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
