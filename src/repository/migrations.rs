//! 嵌入式数据库迁移

use sqlx::PgPool;
use tracing::info;

use crate::error::{Result, ServerError};

// 由 build.rs 生成：MIGRATIONS
include!(concat!(env!("OUT_DIR"), "/migrations.rs"));

/// 迁移执行结果
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// 依次执行尚未执行过的迁移，执行记录保存在 llm_limiter_migrations 表
pub async fn apply_migrations(pool: &PgPool) -> Result<MigrationReport> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS llm_limiter_migrations (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| ServerError::Database(format!("创建迁移记录表失败: {}", e)))?;

    let done: Vec<String> =
        sqlx::query_scalar("SELECT name FROM llm_limiter_migrations ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询迁移记录失败: {}", e)))?;

    let mut report = MigrationReport::default();
    for (name, sql) in MIGRATIONS {
        if done.iter().any(|d| d == name) {
            report.skipped.push(name.to_string());
            continue;
        }

        info!("▶ 执行迁移 {}", name);
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| ServerError::Database(format!("执行迁移 {} 失败: {}", name, e)))?;

        sqlx::query("INSERT INTO llm_limiter_migrations (name) VALUES ($1)")
            .bind(*name)
            .execute(pool)
            .await
            .map_err(|e| ServerError::Database(format!("记录迁移 {} 失败: {}", name, e)))?;

        report.applied.push(name.to_string());
    }

    Ok(report)
}
