// RedisClient - Redis客户端实现
// 基于 bb8-redis 连接池

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::ServerError;

/// Redis 客户端（基于连接池）
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

impl RedisClient {
    /// 创建新的 Redis 客户端（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self, ServerError> {
        let manager = RedisConnectionManager::new(config.url.clone()).map_err(|e| {
            ServerError::Configuration(format!("Failed to create Redis manager: {}", e))
        })?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| ServerError::Store(format!("Failed to create Redis pool: {}", e)))?;

        let client = Self {
            pool: Arc::new(pool),
            command_timeout: config.command_timeout(),
        };

        // 测试连接
        client.ping().await?;

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(client)
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    /// 从连接池获取连接
    async fn get_conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, ServerError> {
        Ok(self.pool.get().await?)
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T, ServerError>
    where
        F: std::future::Future<Output = Result<T, ServerError>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                ServerError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }

    /// PING
    pub async fn ping(&self) -> Result<(), ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Store(format!("Redis ping failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // String 操作
    // ============================================================

    /// GET key
    pub async fn get(&self, key: &str) -> Result<Option<String>, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| ServerError::Store(format!("Redis GET failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    /// MULTI; SET k1 v1; SET k2 v2 ...; EXEC
    pub async fn set_many_atomic(&self, pairs: &[(String, String)]) -> Result<(), ServerError> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (key, value) in pairs {
                pipe.set(key, value).ignore();
            }
            pipe.query_async::<()>(&mut *conn)
                .await
                .map_err(|e| ServerError::Store(format!("Redis MULTI/SET failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// EVALSHA/EVAL 脚本（单 key），返回整数结果
    pub async fn eval_script(
        &self,
        script: &redis::Script,
        key: &str,
        args: &[i64],
    ) -> Result<i64, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut invocation = script.prepare_invoke();
            invocation.key(key);
            for arg in args {
                invocation.arg(*arg);
            }
            let result: i64 = invocation
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Store(format!("Redis EVAL failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    // ============================================================
    // List 操作
    // ============================================================

    /// RPUSH key value
    pub async fn rpush(&self, key: &str, value: &str) -> Result<(), ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.rpush::<_, _, ()>(key, value)
                .await
                .map_err(|e| ServerError::Store(format!("Redis RPUSH failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// LPUSH key value
    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.lpush::<_, _, ()>(key, value)
                .await
                .map_err(|e| ServerError::Store(format!("Redis LPUSH failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// LPOP key（非阻塞）
    pub async fn lpop(&self, key: &str) -> Result<Option<String>, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Option<String> = conn
                .lpop(key, None)
                .await
                .map_err(|e| ServerError::Store(format!("Redis LPOP failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    /// LLEN key
    pub async fn llen(&self, key: &str) -> Result<usize, ServerError> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: usize = conn
                .llen(key)
                .await
                .map_err(|e| ServerError::Store(format!("Redis LLEN failed: {}", e)))?;
            Ok(result)
        })
        .await
    }
}
