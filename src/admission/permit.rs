use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, warn};

use super::AdmissionController;
use crate::error::ServerError;
use crate::model::Category;

/// 已获取的一个容量单位
///
/// 正常路径调用 [`AdmissionPermit::release`]；若在释放前被 drop（任务取消、panic），
/// `Drop` 会在当前运行时上补一次释放。`released` 标志保证只释放一次。
#[must_use = "permit must be released, dropping it schedules a background release"]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    category: Category,
    released: bool,
}

impl AdmissionPermit {
    pub(crate) fn new(controller: Arc<AdmissionController>, category: Category) -> Self {
        Self {
            controller,
            category,
            released: false,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// 归还容量；返回 false 表示计数已在上限（例如中途发生过重置）
    pub async fn release(mut self) -> Result<bool, ServerError> {
        self.released = true;
        self.controller.release(self.category).await
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let controller = Arc::clone(&self.controller);
        let category = self.category;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(category = %category, "⚠️ 准入许可未显式释放，后台补偿释放");
                handle.spawn(async move {
                    if let Err(e) = controller.release(category).await {
                        error!(category = %category, "❌ 补偿释放失败，等待下次周期重置: {}", e);
                    }
                });
            }
            Err(_) => {
                error!(category = %category, "❌ 运行时已关闭，无法释放容量，等待下次周期重置");
            }
        }
    }
}

/// 在准入括号内执行工作：无论正常返回还是 panic，都恰好释放一次
///
/// panic 被转换为 `ServerError::Internal`，调用方按失败处理。
pub async fn run_admitted<F, T>(permit: AdmissionPermit, work: F) -> Result<T, ServerError>
where
    F: Future<Output = T>,
{
    let category = permit.category();
    let outcome = AssertUnwindSafe(work).catch_unwind().await;

    if let Err(e) = permit.release().await {
        error!(category = %category, "❌ 释放容量失败，等待下次周期重置: {}", e);
    }

    outcome.map_err(|panic| {
        let message = panic_message(panic.as_ref());
        error!(category = %category, "❌ 准入括号内的任务 panic: {}", message);
        ServerError::Internal(format!("admitted work panicked: {}", message))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
