//! 溢出队列：每个类别一个 FIFO，存放暂时无法准入的请求

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::infra::redis::RedisClient;
use crate::model::{Category, QueueEntry};

/// 原始队列后端（只处理字符串）
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// 追加到队尾
    async fn push_back(&self, category: Category, raw: String) -> Result<()>;

    /// 放回队首（仅在关闭时归还未准入的条目）
    async fn push_front(&self, category: Category, raw: String) -> Result<()>;

    /// 非阻塞弹出队首
    async fn pop_front(&self, category: Category) -> Result<Option<String>>;

    async fn len(&self, category: Category) -> Result<usize>;
}

/// Redis List 实现：RPUSH 入队，LPOP 出队
pub struct RedisQueueBackend {
    client: RedisClient,
    key_prefix: String,
}

impl RedisQueueBackend {
    pub fn new(client: RedisClient, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, category: Category) -> String {
        queue_key(&self.key_prefix, category)
    }
}

/// `{prefix}:queue:{category}`
pub fn queue_key(prefix: &str, category: Category) -> String {
    format!("{}:queue:{}", prefix, category.as_str())
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push_back(&self, category: Category, raw: String) -> Result<()> {
        self.client.rpush(&self.key(category), &raw).await
    }

    async fn push_front(&self, category: Category, raw: String) -> Result<()> {
        self.client.lpush(&self.key(category), &raw).await
    }

    async fn pop_front(&self, category: Category) -> Result<Option<String>> {
        self.client.lpop(&self.key(category)).await
    }

    async fn len(&self, category: Category) -> Result<usize> {
        self.client.llen(&self.key(category)).await
    }
}

/// 进程内实现（未配置 Redis 时使用）
#[derive(Default)]
pub struct MemoryQueueBackend {
    queues: Mutex<HashMap<Category, VecDeque<String>>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push_back(&self, category: Category, raw: String) -> Result<()> {
        self.queues.lock().entry(category).or_default().push_back(raw);
        Ok(())
    }

    async fn push_front(&self, category: Category, raw: String) -> Result<()> {
        self.queues.lock().entry(category).or_default().push_front(raw);
        Ok(())
    }

    async fn pop_front(&self, category: Category) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .get_mut(&category)
            .and_then(|queue| queue.pop_front()))
    }

    async fn len(&self, category: Category) -> Result<usize> {
        Ok(self.queues.lock().get(&category).map_or(0, |queue| queue.len()))
    }
}

/// 出队结果
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Entry(QueueEntry),
    /// 无法解析或校验失败的原始内容
    Malformed { raw: String, reason: String },
}

/// 带类型的溢出队列：负责 QueueEntry 的编码与校验
pub struct OverflowQueue {
    backend: Box<dyn QueueBackend>,
}

impl OverflowQueue {
    pub fn new(backend: Box<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryQueueBackend::new()))
    }

    /// 入队到条目所属类别的队尾
    pub async fn push(&self, entry: &QueueEntry) -> Result<()> {
        let raw = entry.encode()?;
        self.backend.push_back(entry.category, raw).await
    }

    /// 归还到队首（关闭时未准入的条目）
    pub async fn push_front(&self, entry: &QueueEntry) -> Result<()> {
        let raw = entry.encode()?;
        self.backend.push_front(entry.category, raw).await
    }

    /// 非阻塞出队；队列为空时返回 None
    pub async fn pop(&self, category: Category) -> Result<Option<Dequeued>> {
        let Some(raw) = self.backend.pop_front(category).await? else {
            return Ok(None);
        };

        let dequeued = match QueueEntry::decode(&raw) {
            Ok(entry) if entry.category == category => Dequeued::Entry(entry),
            Ok(entry) => Dequeued::Malformed {
                reason: format!(
                    "entry {} has category {} but was found in queue {}",
                    entry.request_id, entry.category, category
                ),
                raw,
            },
            Err(e) => Dequeued::Malformed {
                reason: e.to_string(),
                raw,
            },
        };
        Ok(Some(dequeued))
    }

    pub async fn len(&self, category: Category) -> Result<usize> {
        self.backend.len(category).await
    }

    /// 直接写入原始内容，用于构造异常条目
    #[cfg(test)]
    pub(crate) async fn push_raw(&self, category: Category, raw: String) -> Result<()> {
        self.backend.push_back(category, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GenerationInput;

    fn entry(id: &str, category: Category) -> QueueEntry {
        QueueEntry::new(id, category, GenerationInput::text(format!("prompt {}", id)))
    }

    #[tokio::test]
    async fn test_fifo_per_category() {
        let queue = OverflowQueue::in_memory();
        queue.push(&entry("a", Category::TextOnly)).await.unwrap();
        queue.push(&entry("b", Category::TextOnly)).await.unwrap();
        queue.push(&entry("x", Category::MultiModal)).await.unwrap();

        assert_eq!(queue.len(Category::TextOnly).await.unwrap(), 2);
        assert_eq!(queue.len(Category::MultiModal).await.unwrap(), 1);

        let first = queue.pop(Category::TextOnly).await.unwrap();
        assert!(matches!(first, Some(Dequeued::Entry(e)) if e.request_id == "a"));
        let second = queue.pop(Category::TextOnly).await.unwrap();
        assert!(matches!(second, Some(Dequeued::Entry(e)) if e.request_id == "b"));
        assert!(queue.pop(Category::TextOnly).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_front_goes_to_head() {
        let queue = OverflowQueue::in_memory();
        queue.push(&entry("a", Category::ImageGeneration)).await.unwrap();
        queue.push_front(&entry("z", Category::ImageGeneration)).await.unwrap();

        let head = queue.pop(Category::ImageGeneration).await.unwrap();
        assert!(matches!(head, Some(Dequeued::Entry(e)) if e.request_id == "z"));
    }

    #[tokio::test]
    async fn test_malformed_entries_are_reported() {
        let queue = OverflowQueue::in_memory();
        queue
            .push_raw(Category::TextOnly, "{'id': 'r1', 'data': b'...'}".to_string())
            .await
            .unwrap();
        // 类别不符也视为异常条目
        let misplaced = entry("m", Category::MultiModal).encode().unwrap();
        queue.push_raw(Category::TextOnly, misplaced).await.unwrap();

        for _ in 0..2 {
            let popped = queue.pop(Category::TextOnly).await.unwrap();
            assert!(matches!(popped, Some(Dequeued::Malformed { .. })));
        }
        assert_eq!(queue.len(Category::TextOnly).await.unwrap(), 0);
    }

    #[test]
    fn test_queue_key_format() {
        assert_eq!(queue_key("gw", Category::TextOnly), "gw:queue:text_only");
    }
}
