//! 请求记录模型：生命周期状态、输入载荷

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::model::Category;

/// 请求生命周期状态
///
/// 单调迁移：`queued -> processing -> {completed, failed}`，终态不再迁出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// 是否为终态（completed / failed）
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// 生命周期中的位置：queued=0, processing=1, 终态=2
    pub fn rank(&self) -> u8 {
        match self {
            RequestStatus::Queued => 0,
            RequestStatus::Processing => 1,
            RequestStatus::Completed | RequestStatus::Failed => 2,
        }
    }

    /// 已存状态为 self 时，是否允许被 next 覆盖（只进不退）
    pub fn accepts(&self, next: RequestStatus) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RequestStatus::Queued),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(ServerError::Validation(format!("unknown request status: {}", other))),
        }
    }
}

/// 附件（二进制内容在 JSON 中以 base64 表示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attachment {
    pub filename: Option<String>,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// 生成请求输入：文本 + 零个或多个附件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationInput {
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl GenerationInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    /// 是否既无文本也无附件
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map(str::trim).unwrap_or("").is_empty() && self.attachments.is_empty()
    }

    /// 序列化为记录存储使用的字符串
    pub fn to_record_string(&self) -> Result<String, ServerError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 持久化的请求记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub category: Category,
    /// 序列化后的输入
    pub input_data: String,
    pub status: RequestStatus,
    /// 输出或错误详情（未终态时为空）
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_never_regress() {
        assert!(RequestStatus::Queued.accepts(RequestStatus::Processing));
        assert!(RequestStatus::Processing.accepts(RequestStatus::Completed));
        assert!(RequestStatus::Queued.accepts(RequestStatus::Failed));
        assert!(!RequestStatus::Completed.accepts(RequestStatus::Queued));
        assert!(!RequestStatus::Failed.accepts(RequestStatus::Processing));
        assert!(!RequestStatus::Processing.accepts(RequestStatus::Queued));
        assert!(RequestStatus::Processing.accepts(RequestStatus::Processing));
        assert!(RequestStatus::Queued.accepts(RequestStatus::Queued));
    }

    #[test]
    fn test_attachment_data_is_base64() {
        let input = GenerationInput {
            text: None,
            attachments: vec![Attachment {
                filename: Some("a.png".to_string()),
                mime_type: "image/png".to_string(),
                data: vec![0xde, 0xad, 0xbe, 0xef],
            }],
        };
        let json = input.to_record_string().unwrap();
        assert!(json.contains("\"3q2+7w==\""));
        let decoded: GenerationInput = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_empty_input() {
        assert!(GenerationInput::default().is_empty());
        assert!(GenerationInput::text("   ").is_empty());
        assert!(!GenerationInput::text("hi").is_empty());
    }
}
