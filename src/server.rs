//! 应用装配：根据配置选择存储后端，启动 HTTP 服务与队列消费 Worker

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::config::AppConfig;
use crate::error::{Result, ServerError};
use crate::http::{HttpServerState, LimiterHttpServer};
use crate::infra::{
    metrics, CapacityStore, Database, MemoryCapacityStore, MemoryQueueBackend, OverflowQueue,
    QueueBackend, RedisCapacityStore, RedisClient, RedisQueueBackend,
};
use crate::repository::{MemoryRequestRepository, PgRequestRepository, RequestRecordStore};
use crate::service::{build_processor, GenerationProcessor, SubmissionService};
use crate::worker::QueueDrainer;

/// 已装配的应用组件
pub struct LimiterApp {
    config: AppConfig,
    controller: Arc<AdmissionController>,
    records: Arc<dyn RequestRecordStore>,
    queue: Arc<OverflowQueue>,
    processor: Arc<dyn GenerationProcessor>,
    submission: Arc<SubmissionService>,
    redis: Option<RedisClient>,
    database: Option<Database>,
}

impl LimiterApp {
    /// 按配置创建各组件；Redis/数据库连接失败直接返回错误
    pub async fn build(config: AppConfig) -> Result<Self> {
        let (capacity, queue_backend, redis): (
            Arc<dyn CapacityStore>,
            Box<dyn QueueBackend>,
            Option<RedisClient>,
        ) = match &config.redis {
            Some(redis_config) => {
                let client = RedisClient::new(redis_config).await?;
                let prefix = redis_config.key_prefix.clone();
                (
                    Arc::new(RedisCapacityStore::new(client.clone(), prefix.clone())),
                    Box::new(RedisQueueBackend::new(client.clone(), prefix)),
                    Some(client),
                )
            }
            None => {
                warn!("⚠️ 未配置 Redis，使用进程内计数器与队列（仅适用于单实例）");
                (
                    Arc::new(MemoryCapacityStore::new()),
                    Box::new(MemoryQueueBackend::new()),
                    None,
                )
            }
        };

        let (records, database): (Arc<dyn RequestRecordStore>, Option<Database>) =
            match &config.database {
                Some(db_config) => {
                    let database = Database::new(db_config).await?;
                    let repo = PgRequestRepository::new(Arc::new(database.pool().clone()));
                    (Arc::new(repo), Some(database))
                }
                None => {
                    warn!("⚠️ 未配置数据库，请求记录仅保存在内存中");
                    (Arc::new(MemoryRequestRepository::new()), None)
                }
            };

        let processor = build_processor(&config.generation)?;
        info!("🤖 生成服务: {}", processor.name());

        let controller = Arc::new(AdmissionController::new(capacity, &config.admission));
        let queue = Arc::new(OverflowQueue::new(queue_backend));
        let submission = Arc::new(SubmissionService::new(
            Arc::clone(&controller),
            Arc::clone(&records),
            Arc::clone(&queue),
            Arc::clone(&processor),
            config.admission.submit_timeout(),
        ));

        Ok(Self {
            config,
            controller,
            records,
            queue,
            processor,
            submission,
            redis,
            database,
        })
    }

    pub fn http_state(&self) -> HttpServerState {
        HttpServerState {
            submission: Arc::clone(&self.submission),
            controller: Arc::clone(&self.controller),
            records: Arc::clone(&self.records),
            queue: Arc::clone(&self.queue),
            redis: self.redis.clone(),
        }
    }

    pub fn drainer(&self) -> Arc<QueueDrainer> {
        Arc::new(QueueDrainer::new(
            Arc::clone(&self.controller),
            Arc::clone(&self.records),
            Arc::clone(&self.queue),
            Arc::clone(&self.processor),
            self.config.drainer.clone(),
            self.config.admission.drain_timeout(),
        ))
    }

    fn show_config_info(&self) {
        info!("📊 服务配置:");
        info!("  - HTTP: {}", self.config.bind_address());
        info!("  - Redis: {}", self.config.redis.is_some());
        info!("  - Database: {}", self.config.database.is_some());
        for (category, limit) in &self.config.admission.limits {
            info!("  - 并发上限 {}: {}", category, limit);
        }
        info!(
            "  - 提交等待 {}s / 消费等待 {}s / 重置周期 {}s",
            self.config.admission.submit_timeout_secs,
            self.config.admission.drain_timeout_secs,
            self.config.admission.reset_interval_secs
        );
    }

    /// 运行 HTTP 服务；with_worker 为 true 时同进程内运行队列消费
    pub async fn serve(&self, with_worker: bool) -> Result<()> {
        if metrics::init().is_ok() {
            info!("📊 Prometheus 指标已启用，GET /metrics 可用");
        }
        self.show_config_info();

        self.controller.start().await?;

        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_shutdown(shutdown.clone()));

        let worker = if with_worker || self.config.drainer.embedded {
            let drainer = self.drainer();
            let token = shutdown.clone();
            Some(tokio::spawn(async move { drainer.run(token).await }))
        } else {
            None
        };

        let http = LimiterHttpServer::new(self.http_state(), self.config.bind_address());
        let served = http.start(shutdown.clone()).await;
        if let Err(e) = &served {
            error!("❌ HTTP 服务器运行失败: {}", e);
        }

        shutdown.cancel();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("❌ 队列消费 Worker 异常退出: {}", e);
            }
        }
        self.controller.stop().await;
        info!("👋 服务已关闭");
        served
    }

    /// 仅运行队列消费 Worker
    pub async fn run_worker(&self) -> Result<()> {
        if metrics::init().is_ok() {
            info!("📊 Prometheus 指标已启用");
        }
        self.show_config_info();

        self.controller.start().await?;

        let shutdown = CancellationToken::new();
        tokio::spawn(wait_for_shutdown(shutdown.clone()));

        self.drainer().run(shutdown).await;
        self.controller.stop().await;
        info!("👋 Worker 已关闭");
        Ok(())
    }

    /// 删除 updated_at 早于 days 天前的记录
    pub async fn cleanup(&self, days: u32) -> Result<u64> {
        if self.database.is_none() {
            return Err(ServerError::Configuration(
                "cleanup requires a configured database".to_string(),
            ));
        }
        let deleted = self.records.delete_older_than(days).await?;
        info!("🧹 已清理 {} 条超过 {} 天的请求记录", deleted, days);
        Ok(deleted)
    }
}

/// 等待 Ctrl+C 或 SIGTERM，然后取消 token
pub async fn wait_for_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ 监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("❌ 监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 收到 Ctrl+C，开始关闭..."),
        _ = terminate => info!("🛑 收到 SIGTERM，开始关闭..."),
        _ = token.cancelled() => {}
    }
    token.cancel();
}
