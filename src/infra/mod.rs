// Infrastructure layer - 基础设施层
// 负责共享存储：Redis 连接池、容量计数器、溢出队列、数据库连接、指标

pub mod capacity_store;
pub mod database;
pub mod metrics;
pub mod overflow_queue;
pub mod redis;

// 重新导出主要类型
pub use capacity_store::{CapacityStore, MemoryCapacityStore, RedisCapacityStore};
pub use database::Database;
pub use overflow_queue::{
    Dequeued, MemoryQueueBackend, OverflowQueue, QueueBackend, RedisQueueBackend,
};
pub use redis::RedisClient;
