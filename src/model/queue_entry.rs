//! 溢出队列条目：带版本号、严格校验字段的 JSON 信封

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::model::{Category, GenerationInput};

/// 当前信封版本
pub const QUEUE_ENTRY_VERSION: u8 = 1;

/// 队列条目（入队后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueEntry {
    pub v: u8,
    pub request_id: String,
    pub category: Category,
    pub input: GenerationInput,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(request_id: impl Into<String>, category: Category, input: GenerationInput) -> Self {
        Self {
            v: QUEUE_ENTRY_VERSION,
            request_id: request_id.into(),
            category,
            input,
            enqueued_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, ServerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解码并校验：版本号、request_id 非空
    pub fn decode(raw: &str) -> Result<Self, ServerError> {
        let entry: QueueEntry = serde_json::from_str(raw)?;
        if entry.v != QUEUE_ENTRY_VERSION {
            return Err(ServerError::Serialization(format!(
                "unsupported queue entry version {}",
                entry.v
            )));
        }
        if entry.request_id.trim().is_empty() {
            return Err(ServerError::Serialization("queue entry without request_id".to_string()));
        }
        Ok(entry)
    }
}
