//! 请求类别（固定的封闭枚举，每个类别独立限流）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// 请求类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    TextOnly,
    MultiModal,
    ImageGeneration,
}

impl Category {
    /// 所有类别（进程启动时固定，运行期不增删）
    pub const ALL: [Category; 3] = [
        Category::TextOnly,
        Category::MultiModal,
        Category::ImageGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::TextOnly => "text_only",
            Category::MultiModal => "multi_modal",
            Category::ImageGeneration => "image_generation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_only" => Ok(Category::TextOnly),
            "multi_modal" => Ok(Category::MultiModal),
            "image_generation" => Ok(Category::ImageGeneration),
            other => Err(ServerError::Validation(format!("unknown category: {}", other))),
        }
    }
}
