use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{run_admitted, AcquireError, AdmissionController, AdmissionPermit};
use crate::config::DrainerConfig;
use crate::error::ServerError;
use crate::infra::{metrics, Dequeued, OverflowQueue};
use crate::model::{Category, QueueEntry, RequestStatus};
use crate::repository::RequestRecordStore;
use crate::service::generation::GenerationProcessor;

/// 第 attempt 次（从 0 开始）准入失败后的等待：`min(base * 2^attempt + jitter * base, cap)`
///
/// `jitter` 取值 [0, 1)。相邻两次的指数增量不小于 base，因此延迟在到达上限前单调不减。
pub fn backoff_delay(attempt: u32, base_secs: f64, cap_secs: f64, jitter: f64) -> Duration {
    let exp = base_secs * 2f64.powi(attempt.min(62) as i32);
    let secs = (exp + jitter.clamp(0.0, 1.0) * base_secs).min(cap_secs);
    Duration::from_secs_f64(secs.max(0.0))
}

/// 消费统计
#[derive(Debug, Default)]
struct DrainCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    exhausted: AtomicU64,
    malformed: AtomicU64,
    requeued: AtomicU64,
    admission_attempts: AtomicU64,
}

/// 消费统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    /// 处理成功
    pub completed: u64,
    /// 处理失败（生成服务报错）
    pub failed: u64,
    /// 重试耗尽仍未获得准入
    pub exhausted: u64,
    /// 丢弃的异常条目
    pub malformed: u64,
    /// 关闭时放回队首
    pub requeued: u64,
    /// 准入尝试总次数
    pub admission_attempts: u64,
}

/// 单个条目的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Completed,
    Failed,
    Exhausted,
    Requeued,
}

/// 溢出队列消费者
///
/// 每个类别一个任务：清空队列 → 空闲休眠 → 循环，直到收到关闭信号。
pub struct QueueDrainer {
    controller: Arc<AdmissionController>,
    records: Arc<dyn RequestRecordStore>,
    queue: Arc<OverflowQueue>,
    processor: Arc<dyn GenerationProcessor>,
    config: DrainerConfig,
    drain_timeout: Duration,
    counters: DrainCounters,
}

impl QueueDrainer {
    pub fn new(
        controller: Arc<AdmissionController>,
        records: Arc<dyn RequestRecordStore>,
        queue: Arc<OverflowQueue>,
        processor: Arc<dyn GenerationProcessor>,
        config: DrainerConfig,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            records,
            queue,
            processor,
            config,
            drain_timeout,
            counters: DrainCounters::default(),
        }
    }

    pub fn stats(&self) -> DrainStats {
        DrainStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            admission_attempts: self.counters.admission_attempts.load(Ordering::Relaxed),
        }
    }

    /// 为每个类别启动消费任务，收到关闭信号后等待全部退出
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "🚀 队列消费 Worker 已启动 (max_attempts={}, drain_timeout={}s)",
            self.config.max_attempts,
            self.drain_timeout.as_secs()
        );

        let mut tasks = JoinSet::new();
        for category in Category::ALL {
            let drainer = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { drainer.run_category(category, shutdown).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("❌ 队列消费任务异常退出: {}", e);
            }
        }

        info!("🛑 队列消费 Worker 已停止: {:?}", self.stats());
    }

    async fn run_category(&self, category: Category, shutdown: CancellationToken) {
        debug!(category = %category, "队列消费任务启动");
        while !shutdown.is_cancelled() {
            match self.queue.len(category).await {
                Ok(depth) => {
                    metrics::record_queue_depth(category, depth);
                    if depth > 0 {
                        info!(category = %category, "📦 队列中有 {} 个待处理请求", depth);
                    }
                }
                Err(e) => warn!(category = %category, "⚠️ 读取队列长度失败: {}", e),
            }

            self.drain_once(category, &shutdown).await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.idle_sleep()) => {}
            }
        }
        debug!(category = %category, "队列消费任务退出");
    }

    /// 非阻塞地清空某个类别的队列，返回处理的条目数（含异常条目）
    pub async fn drain_once(&self, category: Category, shutdown: &CancellationToken) -> usize {
        let mut handled = 0;
        while !shutdown.is_cancelled() {
            let popped = match self.queue.pop(category).await {
                Ok(popped) => popped,
                Err(e) => {
                    error!(category = %category, "❌ 出队失败，稍后重试: {}", e);
                    break;
                }
            };

            match popped {
                None => break,
                Some(Dequeued::Malformed { raw, reason }) => {
                    warn!(
                        category = %category,
                        "⚠️ 丢弃无法解析的队列条目: {} (raw={})",
                        reason,
                        preview(&raw)
                    );
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    metrics::record_malformed_entry(category);
                }
                Some(Dequeued::Entry(entry)) => {
                    let outcome = self.handle_entry(entry, shutdown).await;
                    let label = match outcome {
                        EntryOutcome::Completed => "completed",
                        EntryOutcome::Failed => "failed",
                        EntryOutcome::Exhausted => "exhausted",
                        EntryOutcome::Requeued => "requeued",
                    };
                    metrics::record_drain_outcome(category, label);
                }
            }
            handled += 1;
        }
        handled
    }

    async fn handle_entry(&self, entry: QueueEntry, shutdown: &CancellationToken) -> EntryOutcome {
        let category = entry.category;
        let max_attempts = self.config.max_attempts;
        info!(request_id = %entry.request_id, category = %category, "🔄 处理排队请求");

        for attempt in 0..max_attempts {
            self.counters.admission_attempts.fetch_add(1, Ordering::Relaxed);
            match self
                .controller
                .acquire_with_cancel(category, self.drain_timeout, shutdown)
                .await
            {
                Ok(permit) => {
                    info!(
                        request_id = %entry.request_id,
                        category = %category,
                        attempt = attempt + 1,
                        "✅ 第 {} 次尝试获得准入",
                        attempt + 1
                    );
                    return self.process_admitted(permit, entry).await;
                }
                Err(AcquireError::Cancelled) => return self.requeue(entry).await,
                Err(AcquireError::TimedOut) => {}
                Err(AcquireError::Store(e)) => {
                    warn!(request_id = %entry.request_id, attempt = attempt + 1, "⚠️ 准入时存储异常: {}", e);
                }
            }

            if attempt + 1 < max_attempts {
                let jitter = rand::thread_rng().gen_range(0.0..1.0);
                let delay = backoff_delay(
                    attempt,
                    self.config.backoff_base_secs,
                    self.config.backoff_cap_secs,
                    jitter,
                );
                info!(
                    request_id = %entry.request_id,
                    category = %category,
                    attempt = attempt + 1,
                    backoff_secs = delay.as_secs_f64(),
                    "⏳ 未获得准入，退避后重试"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return self.requeue(entry).await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        error!(
            request_id = %entry.request_id,
            category = %category,
            "❌ {} 次尝试后仍未获得准入，标记为失败",
            max_attempts
        );
        let detail = ServerError::ResourceExhausted(format!(
            "failed to acquire {} capacity after {} attempts",
            category, max_attempts
        ))
        .to_string();
        self.save_terminal(&entry, RequestStatus::Failed, &detail).await;
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        EntryOutcome::Exhausted
    }

    /// 已获得准入：标记 processing → 调用生成 → 保存终态，括号内恰好释放一次
    async fn process_admitted(&self, permit: AdmissionPermit, entry: QueueEntry) -> EntryOutcome {
        let category = entry.category;
        let input_data = match entry.input.to_record_string() {
            Ok(data) => data,
            Err(e) => {
                // 入队时已成功编码，不应发生
                error!(request_id = %entry.request_id, "❌ 序列化输入失败: {}", e);
                String::new()
            }
        };
        if let Err(e) = self
            .records
            .save(&entry.request_id, category, &input_data, None, RequestStatus::Processing)
            .await
        {
            warn!(request_id = %entry.request_id, "⚠️ 记录 processing 状态失败: {}", e);
        }

        let started = std::time::Instant::now();
        let result = run_admitted(permit, self.processor.process(category, &entry.input))
            .await
            .and_then(|inner| inner);
        metrics::record_generation_duration(category, started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                self.save_terminal(&entry, RequestStatus::Completed, &output).await;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(request_id = %entry.request_id, category = %category, "✅ 排队请求处理完成");
                EntryOutcome::Completed
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(request_id = %entry.request_id, category = %category, "❌ 排队请求处理失败: {}", detail);
                self.save_terminal(&entry, RequestStatus::Failed, &detail).await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                EntryOutcome::Failed
            }
        }
    }

    async fn save_terminal(&self, entry: &QueueEntry, status: RequestStatus, response: &str) {
        let input_data = entry.input.to_record_string().unwrap_or_default();
        if let Err(e) = self
            .records
            .save(&entry.request_id, entry.category, &input_data, Some(response), status)
            .await
        {
            error!(request_id = %entry.request_id, status = %status, "❌ 保存终态记录失败: {}", e);
        }
    }

    /// 关闭时把尚未准入的条目放回队首
    async fn requeue(&self, entry: QueueEntry) -> EntryOutcome {
        match self.queue.push_front(&entry).await {
            Ok(()) => info!(request_id = %entry.request_id, "↩️ 关闭中，条目已放回队首"),
            Err(e) => error!(
                request_id = %entry.request_id,
                "❌ 放回队列失败，记录将停留在 queued: {}",
                e
            ),
        }
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        EntryOutcome::Requeued
    }
}

fn preview(raw: &str) -> String {
    const MAX: usize = 120;
    match raw.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &raw[..idx]),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::error::Result;
    use crate::infra::MemoryCapacityStore;
    use crate::model::GenerationInput;
    use crate::repository::MemoryRequestRepository;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl GenerationProcessor for Upper {
        async fn process(&self, _: Category, input: &GenerationInput) -> Result<String> {
            match input.text.as_deref() {
                Some("explode") => Err(ServerError::Generation("model overloaded".to_string())),
                Some("slow") => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok("SLOW".to_string())
                }
                other => Ok(other.unwrap_or_default().to_uppercase()),
            }
        }

        fn name(&self) -> &'static str {
            "upper"
        }
    }

    struct Fixture {
        drainer: Arc<QueueDrainer>,
        controller: Arc<AdmissionController>,
        records: Arc<MemoryRequestRepository>,
        queue: Arc<OverflowQueue>,
    }

    async fn fixture(limit: u32) -> Fixture {
        let admission = AdmissionConfig {
            limits: Category::ALL.iter().map(|c| (*c, limit)).collect(),
            ..AdmissionConfig::default()
        };
        let controller = Arc::new(AdmissionController::new(
            Arc::new(MemoryCapacityStore::new()),
            &admission,
        ));
        controller.reset_all().await.unwrap();
        let records = Arc::new(MemoryRequestRepository::new());
        let queue = Arc::new(OverflowQueue::in_memory());
        let drainer = Arc::new(QueueDrainer::new(
            controller.clone(),
            records.clone(),
            queue.clone(),
            Arc::new(Upper),
            DrainerConfig::default(),
            admission.drain_timeout(),
        ));
        Fixture {
            drainer,
            controller,
            records,
            queue,
        }
    }

    async fn enqueue(f: &Fixture, id: &str, category: Category, text: &str) {
        f.records
            .save(id, category, "{}", None, RequestStatus::Queued)
            .await
            .unwrap();
        f.queue
            .push(&QueueEntry::new(id, category, GenerationInput::text(text)))
            .await
            .unwrap();
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            for jitter in [0.0, 0.5, 0.999] {
                let delay = backoff_delay(attempt, 1.0, 60.0, jitter);
                assert!(delay <= Duration::from_secs(60));
                assert!(delay >= previous || delay == Duration::from_secs(60));
            }
            previous = backoff_delay(attempt, 1.0, 60.0, 0.999);
        }
        assert_eq!(backoff_delay(0, 1.0, 60.0, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, 1.0, 60.0, 0.0), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, 1.0, 60.0, 0.5), Duration::from_secs(60));
        // 溢出保护
        assert_eq!(backoff_delay(u32::MAX, 1.0, 60.0, 0.0), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_fifo_and_finalizes_records() {
        let f = fixture(2).await;
        enqueue(&f, "a", Category::TextOnly, "first").await;
        enqueue(&f, "b", Category::TextOnly, "explode").await;

        let handled = f
            .drainer
            .drain_once(Category::TextOnly, &CancellationToken::new())
            .await;
        assert_eq!(handled, 2);

        let a = f.records.get("a").await.unwrap();
        assert_eq!(a.status, RequestStatus::Completed);
        assert_eq!(a.response.as_deref(), Some("FIRST"));
        let b = f.records.get("b").await.unwrap();
        assert_eq!(b.status, RequestStatus::Failed);
        assert!(b.response.unwrap().contains("model overloaded"));

        let stats = f.drainer.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        // 容量全部归还
        assert_eq!(
            f.controller.store().get(Category::TextOnly).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entries_dropped_without_blocking_queue() {
        let f = fixture(1).await;
        f.queue
            .push_raw(Category::MultiModal, "not json".to_string())
            .await
            .unwrap();
        enqueue(&f, "ok", Category::MultiModal, "describe").await;

        let handled = f
            .drainer
            .drain_once(Category::MultiModal, &CancellationToken::new())
            .await;
        assert_eq!(handled, 2);
        assert_eq!(f.drainer.stats().malformed, 1);
        assert_eq!(
            f.records.get("ok").await.unwrap().status,
            RequestStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_requeues_unadmitted_entry() {
        let f = fixture(1).await;
        let _held = f
            .controller
            .acquire(Category::ImageGeneration, Duration::from_secs(1))
            .await
            .unwrap();
        enqueue(&f, "img", Category::ImageGeneration, "draw a fox").await;

        let shutdown = CancellationToken::new();
        let task = {
            let drainer = f.drainer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { drainer.drain_once(Category::ImageGeneration, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(4)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(f.drainer.stats().requeued, 1);
        assert_eq!(f.queue.len(Category::ImageGeneration).await.unwrap(), 1);
        assert_eq!(
            f.records.get("img").await.unwrap().status,
            RequestStatus::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_admitted_entry_finish() {
        let f = fixture(1).await;
        enqueue(&f, "busy", Category::TextOnly, "slow").await;
        enqueue(&f, "next", Category::TextOnly, "later").await;

        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = {
            let drainer = f.drainer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { drainer.drain_once(Category::TextOnly, &shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        // 此时 busy 已获得准入，正在处理
        assert_eq!(
            f.controller.store().get(Category::TextOnly).await.unwrap(),
            Some(0)
        );
        shutdown.cancel();
        assert_eq!(task.await.unwrap(), 1);
        assert!(started.elapsed() >= Duration::from_secs(5));

        let busy = f.records.get("busy").await.unwrap();
        assert_eq!(busy.status, RequestStatus::Completed);
        assert_eq!(busy.response.as_deref(), Some("SLOW"));

        let stats = f.drainer.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.requeued, 0);
        // 关闭后不再取下一条
        assert_eq!(f.queue.len(Category::TextOnly).await.unwrap(), 1);
        assert_eq!(f.records.get("next").await.unwrap().status, RequestStatus::Queued);
        assert_eq!(
            f.controller.store().get(Category::TextOnly).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(3).await;
        enqueue(&f, "t1", Category::TextOnly, "one").await;
        enqueue(&f, "m1", Category::MultiModal, "two").await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.drainer.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(f.drainer.stats().completed, 2);
        assert_eq!(f.records.get("t1").await.unwrap().status, RequestStatus::Completed);
        assert_eq!(f.records.get("m1").await.unwrap().status, RequestStatus::Completed);
    }

    #[test]
    fn test_preview_truncates() {
        let raw = "x".repeat(500);
        assert_eq!(preview(&raw).chars().count(), 121);
        assert_eq!(preview("short"), "short");
    }
}
