//! 持久化层：请求记录与数据库迁移

pub mod migrations;
pub mod request_repo;

pub use migrations::{apply_migrations, MigrationReport};
pub use request_repo::{MemoryRequestRepository, PgRequestRepository, RequestRecordStore};
