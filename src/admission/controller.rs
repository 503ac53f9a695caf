use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AcquireError, AdmissionPermit};
use crate::config::AdmissionConfig;
use crate::error::{Result, ServerError};
use crate::infra::{metrics, CapacityStore};
use crate::model::Category;

/// 重置失败后的重试间隔
const RESET_RETRY_DELAY: Duration = Duration::from_secs(5);

/// 某个类别的容量快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    /// 当前剩余（计数器不存在时为 None）
    pub available: Option<i64>,
    pub limit: u32,
}

/// 准入控制器
pub struct AdmissionController {
    store: Arc<dyn CapacityStore>,
    limits: BTreeMap<Category, u32>,
    poll_interval: Duration,
    reset_interval: Duration,
    started: AtomicBool,
    reset_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CapacityStore>, config: &AdmissionConfig) -> Self {
        Self {
            store,
            limits: config.limits.clone(),
            poll_interval: config.poll_interval(),
            reset_interval: config.reset_interval(),
            started: AtomicBool::new(false),
            reset_task: Mutex::new(None),
        }
    }

    pub fn limit(&self, category: Category) -> u32 {
        self.limits.get(&category).copied().unwrap_or(0)
    }

    pub fn store(&self) -> &Arc<dyn CapacityStore> {
        &self.store
    }

    /// 在超时内获取一个容量单位
    pub async fn acquire(
        self: &Arc<Self>,
        category: Category,
        timeout: Duration,
    ) -> std::result::Result<AdmissionPermit, AcquireError> {
        self.acquire_with_cancel(category, timeout, &CancellationToken::new())
            .await
    }

    /// 同 [`acquire`](Self::acquire)，但轮询等待可被取消
    ///
    /// 每次失败后等待 `poll_interval`（不超过剩余时间），截止时刻再尝试最后一次。
    /// 截止前最后一次观察到的是存储错误时返回 `Store`，否则返回 `TimedOut`。
    pub async fn acquire_with_cancel(
        self: &Arc<Self>,
        category: Category,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<AdmissionPermit, AcquireError> {
        let deadline = Instant::now() + timeout;
        let mut last_error: Option<ServerError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }

            match self.store.cond_decr(category).await {
                Ok(true) => {
                    debug!(category = %category, "✅ 准入成功");
                    metrics::record_admission_granted(category);
                    return Ok(AdmissionPermit::new(Arc::clone(self), category));
                }
                Ok(false) => last_error = None,
                Err(e) => {
                    warn!(category = %category, "⚠️ 准入时容量存储异常，继续轮询: {}", e);
                    last_error = Some(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        match last_error {
            Some(e) => Err(AcquireError::Store(e)),
            None => {
                debug!(category = %category, timeout_ms = timeout.as_millis() as u64, "⏳ 准入等待超时");
                metrics::record_admission_timed_out(category);
                Err(AcquireError::TimedOut)
            }
        }
    }

    /// 归还一个容量单位，计数已在上限时为空操作（返回 false）
    pub async fn release(&self, category: Category) -> Result<bool> {
        let limit = self.limit(category);
        let incremented = self.store.cond_incr(category, limit).await?;
        if !incremented {
            debug!(category = %category, limit, "计数已在上限，忽略释放");
        }
        Ok(incremented)
    }

    /// 把所有类别的计数重置为上限
    pub async fn reset_all(&self) -> Result<()> {
        write_limits(self.store.as_ref(), &self.limits).await
    }

    /// 执行一次重置并启动周期重置任务
    ///
    /// 首次重置失败即返回错误；重复启动返回错误。
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::Internal(
                "admission controller already started".to_string(),
            ));
        }

        if let Err(e) = self.reset_all().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_reset_loop(
            Arc::clone(&self.store),
            self.limits.clone(),
            self.reset_interval,
            token.clone(),
        ));
        *self.reset_task.lock() = Some((token, handle));

        info!(
            "🚀 准入控制器已启动 (reset_interval={}s, poll_interval={}ms)",
            self.reset_interval.as_secs(),
            self.poll_interval.as_millis()
        );
        Ok(())
    }

    /// 停止周期重置任务并等待其退出
    pub async fn stop(&self) {
        let task = self.reset_task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                error!("❌ 重置任务异常退出: {}", e);
            }
            info!("🛑 准入控制器已停止");
        }
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 各类别当前剩余容量与上限
    pub async fn snapshot(&self) -> Result<BTreeMap<Category, CapacitySnapshot>> {
        let mut snapshot = BTreeMap::new();
        for (category, limit) in &self.limits {
            let available = self.store.get(*category).await?;
            if let Some(value) = available {
                metrics::record_capacity_available(*category, value);
            }
            snapshot.insert(
                *category,
                CapacitySnapshot {
                    available,
                    limit: *limit,
                },
            );
        }
        Ok(snapshot)
    }
}

async fn write_limits(store: &dyn CapacityStore, limits: &BTreeMap<Category, u32>) -> Result<()> {
    let values: Vec<(Category, u32)> = limits.iter().map(|(c, l)| (*c, *l)).collect();
    store.set_all(&values).await?;
    debug!("🔄 容量计数已重置: {:?}", values);
    Ok(())
}

/// 周期重置任务
///
/// 与进行中的 acquire/release 不做同步：重置可能覆盖尚未归还的扣减，
/// 窗口内最多多放行一个窗口的量；release 封顶保证计数不超过上限。
async fn run_reset_loop(
    store: Arc<dyn CapacityStore>,
    limits: BTreeMap<Category, u32>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，start() 已经重置过
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        while let Err(e) = write_limits(store.as_ref(), &limits).await {
            error!("❌ 周期重置容量失败，{}s 后重试: {}", RESET_RETRY_DELAY.as_secs(), e);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RESET_RETRY_DELAY) => {}
            }
        }
    }
}
