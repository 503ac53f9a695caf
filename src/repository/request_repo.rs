//! 请求记录仓库 - 按 request_id 幂等 upsert，时间戳后写者胜，状态只进不退

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::{Result, ServerError};
use crate::model::{Category, RequestRecord, RequestStatus};

/// 请求记录存储接口
#[async_trait]
pub trait RequestRecordStore: Send + Sync {
    /// 幂等 upsert：同一 id 多次保存只保留一条，更新状态/输出/更新时间
    async fn save(
        &self,
        request_id: &str,
        category: Category,
        input_data: &str,
        response: Option<&str>,
        status: RequestStatus,
    ) -> Result<()>;

    /// 按 id 查询，不存在时返回 `ServerError::NotFound`
    async fn get(&self, request_id: &str) -> Result<RequestRecord>;

    /// 删除 updated_at 早于 days 天前的记录，返回删除条数
    async fn delete_older_than(&self, days: u32) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL 实现
#[derive(Clone)]
pub struct PgRequestRepository {
    pool: Arc<PgPool>,
}

impl PgRequestRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRecordStore for PgRequestRepository {
    async fn save(
        &self,
        request_id: &str,
        category: Category,
        input_data: &str,
        response: Option<&str>,
        status: RequestStatus,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO llm_requests (id, category, input_data, status, response, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (id) DO UPDATE SET
                category = EXCLUDED.category,
                input_data = EXCLUDED.input_data,
                status = EXCLUDED.status,
                response = EXCLUDED.response,
                updated_at = EXCLUDED.updated_at
            WHERE llm_requests.updated_at <= EXCLUDED.updated_at
              AND (CASE EXCLUDED.status
                       WHEN 'queued' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END)
                  >= (CASE llm_requests.status
                       WHEN 'queued' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END)
            "#,
        )
        .bind(request_id)
        .bind(category.as_str())
        .bind(input_data)
        .bind(status.as_str())
        .bind(response)
        .bind(now)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| ServerError::Database(format!("保存请求记录失败: {}", e)))?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<RequestRecord> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: String,
            category: String,
            input_data: String,
            status: String,
            response: Option<String>,
            created_at: DateTime<Utc>,
            updated_at: DateTime<Utc>,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT id, category, input_data, status, response, created_at, updated_at
            FROM llm_requests WHERE id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| ServerError::Database(format!("查询请求记录失败: {}", e)))?
        .ok_or_else(|| ServerError::NotFound(format!("request {} not found", request_id)))?;

        let category = row
            .category
            .parse::<Category>()
            .map_err(|e| ServerError::Database(format!("记录 {} 类别无效: {}", row.id, e)))?;
        let status = row
            .status
            .parse::<RequestStatus>()
            .map_err(|e| ServerError::Database(format!("记录 {} 状态无效: {}", row.id, e)))?;

        Ok(RequestRecord {
            request_id: row.id,
            category,
            input_data: row.input_data,
            status,
            response: row.response,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let result = sqlx::query("DELETE FROM llm_requests WHERE updated_at < $1")
            .bind(cutoff)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| ServerError::Database(format!("清理请求记录失败: {}", e)))?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| ServerError::Database(format!("数据库不可用: {}", e)))?;
        Ok(())
    }
}

/// 内存实现（未配置数据库时使用），规则与 PostgreSQL 实现一致
#[derive(Default)]
pub struct MemoryRequestRepository {
    records: DashMap<String, RequestRecord>,
}

impl MemoryRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 upsert 规则写入完整记录，返回是否生效
    pub fn upsert(&self, record: RequestRecord) -> bool {
        match self.records.entry(record.request_id.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get_mut();
                if current.updated_at > record.updated_at || !current.status.accepts(record.status) {
                    return false;
                }
                current.category = record.category;
                current.input_data = record.input_data;
                current.status = record.status;
                current.response = record.response;
                current.updated_at = record.updated_at;
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RequestRecordStore for MemoryRequestRepository {
    async fn save(
        &self,
        request_id: &str,
        category: Category,
        input_data: &str,
        response: Option<&str>,
        status: RequestStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let applied = self.upsert(RequestRecord {
            request_id: request_id.to_string(),
            category,
            input_data: input_data.to_string(),
            status,
            response: response.map(str::to_string),
            created_at: now,
            updated_at: now,
        });
        if !applied {
            tracing::debug!(request_id, status = %status, "记录已是更新或终态，忽略本次写入");
        }
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<RequestRecord> {
        self.records
            .get(request_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ServerError::NotFound(format!("request {} not found", request_id)))
    }

    async fn delete_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let before = self.records.len();
        self.records.retain(|_, record| record.updated_at >= cutoff);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
