//! 容量计数器存储
//!
//! 每个类别一个整数计数器，表示当前还可准入的并发数。
//! 条件扣减 / 条件增加必须是单步原子操作，否则并发获取者可能同时看到 1 并都扣减成功。

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::infra::redis::RedisClient;
use crate::model::Category;

/// 容量计数器存储接口
#[async_trait]
pub trait CapacityStore: Send + Sync {
    /// 读取当前计数，key 不存在时返回 None
    async fn get(&self, category: Category) -> Result<Option<i64>>;

    /// 计数 > 0 时原子减一，返回是否成功
    async fn cond_decr(&self, category: Category) -> Result<bool>;

    /// 计数 < max 时原子加一，返回是否成功（false 表示已到上限）
    async fn cond_incr(&self, category: Category, max: u32) -> Result<bool>;

    /// 一次性写入所有类别的计数（重置用）
    async fn set_all(&self, values: &[(Category, u32)]) -> Result<()>;

    /// 存储健康检查
    async fn ping(&self) -> Result<()>;
}

const COND_DECR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    redis.call('DECR', KEYS[1])
    return 1
end
return 0
"#;

const COND_INCR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local max = tonumber(ARGV[1])
if current < max then
    redis.call('INCR', KEYS[1])
    return 1
end
return 0
"#;

/// Redis 实现，条件操作通过 Lua 脚本在服务端原子执行
pub struct RedisCapacityStore {
    client: RedisClient,
    key_prefix: String,
    decr_script: redis::Script,
    incr_script: redis::Script,
}

impl RedisCapacityStore {
    pub fn new(client: RedisClient, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            decr_script: redis::Script::new(COND_DECR_SCRIPT),
            incr_script: redis::Script::new(COND_INCR_SCRIPT),
        }
    }

    fn key(&self, category: Category) -> String {
        capacity_key(&self.key_prefix, category)
    }
}

/// `{prefix}:capacity:{category}`
pub fn capacity_key(prefix: &str, category: Category) -> String {
    format!("{}:capacity:{}", prefix, category.as_str())
}

#[async_trait]
impl CapacityStore for RedisCapacityStore {
    async fn get(&self, category: Category) -> Result<Option<i64>> {
        let raw = self.client.get(&self.key(category)).await?;
        match raw {
            Some(value) => value.parse::<i64>().map(Some).map_err(|e| {
                crate::error::ServerError::Store(format!(
                    "Invalid capacity value {:?} for {}: {}",
                    value, category, e
                ))
            }),
            None => Ok(None),
        }
    }

    async fn cond_decr(&self, category: Category) -> Result<bool> {
        let result = self
            .client
            .eval_script(&self.decr_script, &self.key(category), &[])
            .await?;
        Ok(result == 1)
    }

    async fn cond_incr(&self, category: Category, max: u32) -> Result<bool> {
        let result = self
            .client
            .eval_script(&self.incr_script, &self.key(category), &[i64::from(max)])
            .await?;
        Ok(result == 1)
    }

    async fn set_all(&self, values: &[(Category, u32)]) -> Result<()> {
        let pairs: Vec<(String, String)> = values
            .iter()
            .map(|(category, value)| (self.key(*category), value.to_string()))
            .collect();
        self.client.set_many_atomic(&pairs).await
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }
}

/// 进程内实现（未配置 Redis 时使用）
///
/// DashMap 的 entry 锁保证同一类别的条件操作互斥。
#[derive(Default)]
pub struct MemoryCapacityStore {
    counters: DashMap<Category, i64>,
}

impl MemoryCapacityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapacityStore for MemoryCapacityStore {
    async fn get(&self, category: Category) -> Result<Option<i64>> {
        Ok(self.counters.get(&category).map(|v| *v))
    }

    async fn cond_decr(&self, category: Category) -> Result<bool> {
        match self.counters.get_mut(&category) {
            Some(mut current) if *current > 0 => {
                *current -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cond_incr(&self, category: Category, max: u32) -> Result<bool> {
        let mut current = self.counters.entry(category).or_insert(0);
        if *current < i64::from(max) {
            *current += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_all(&self, values: &[(Category, u32)]) -> Result<()> {
        for (category, value) in values {
            self.counters.insert(*category, i64::from(*value));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cond_decr_stops_at_zero() {
        let store = MemoryCapacityStore::new();
        store.set_all(&[(Category::TextOnly, 2)]).await.unwrap();

        assert!(store.cond_decr(Category::TextOnly).await.unwrap());
        assert!(store.cond_decr(Category::TextOnly).await.unwrap());
        assert!(!store.cond_decr(Category::TextOnly).await.unwrap());
        assert_eq!(store.get(Category::TextOnly).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_cond_decr_missing_key_is_blocked() {
        let store = MemoryCapacityStore::new();
        assert!(!store.cond_decr(Category::MultiModal).await.unwrap());
        assert_eq!(store.get(Category::MultiModal).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cond_incr_capped() {
        let store = MemoryCapacityStore::new();
        store.set_all(&[(Category::ImageGeneration, 2)]).await.unwrap();

        // 已在上限，增加无效
        assert!(!store.cond_incr(Category::ImageGeneration, 2).await.unwrap());
        assert_eq!(store.get(Category::ImageGeneration).await.unwrap(), Some(2));

        store.cond_decr(Category::ImageGeneration).await.unwrap();
        assert!(store.cond_incr(Category::ImageGeneration, 2).await.unwrap());
        assert_eq!(store.get(Category::ImageGeneration).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_decr_never_negative() {
        let store = Arc::new(MemoryCapacityStore::new());
        store.set_all(&[(Category::TextOnly, 3)]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.cond_decr(Category::TextOnly).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(store.get(Category::TextOnly).await.unwrap(), Some(0));
    }

    #[test]
    fn test_capacity_key_format() {
        assert_eq!(
            capacity_key("llm_limiter", Category::MultiModal),
            "llm_limiter:capacity:multi_modal"
        );
    }
}
