use std::sync::Arc;

use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{HealthRecord, HealthStatus};
use altmount_core::time::Clock;
use altmount_core::traits::HealthRepo;
use altmount_import::Database;

use crate::policy;

/// 健康记录仓库：`health_records` 表上的全部 SQL 操作。
///
/// # 设计背景（Why）
/// - 每条 `file_path` 至多一行由主键保证；“单写者每行”靠调度器的在途守卫
///   与 `mark_checking` 的条件更新共同成立；
/// - 登记入口（导入器、读路径）只看到 `altmount-core` 的窄接口
///   [`HealthRepo`]；调度器使用本类型的完整 API。
///
/// # 契约说明（What）
/// - `upsert_pending`：新路径按发布日期推导首检时刻；既有行重置计数并
///   复活为 `pending`（重新导入视为新生命周期）；
/// - `due`：取已到期且不在 `checking`/`corrupted` 的行，按到期时刻升序；
/// - `mark_checking`：条件更新，输掉竞争返回 `false`；
/// - `apply`：整行写回，`scheduled_check_at` 单调推进由调用方保证。
pub struct HealthStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl HealthStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// 查询单行。
    pub fn get(&self, file_path: &str) -> Result<Option<HealthRecord>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM health_records WHERE file_path = ?1"),
                [file_path],
                row_to_record,
            )
            .optional()
        })
    }

    /// 取已到期的待检行。
    pub fn due(&self, limit: usize) -> Result<Vec<HealthRecord>> {
        let now = self.clock.unix_now();
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM health_records
                 WHERE scheduled_check_at <= ?1
                   AND status NOT IN ('checking', 'corrupted')
                 ORDER BY scheduled_check_at ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![now, limit as i64], row_to_record)?;
            rows.collect()
        })
    }

    /// 把一行标记为检查在途；输掉竞争返回 `false`。
    pub fn mark_checking(&self, file_path: &str) -> Result<bool> {
        let now = self.clock.unix_now();
        let changed = self.db.with(|conn| {
            conn.execute(
                "UPDATE health_records SET status = 'checking', updated_at = ?2
                 WHERE file_path = ?1 AND status NOT IN ('checking', 'corrupted')",
                params![file_path, now],
            )
        })?;
        Ok(changed == 1)
    }

    /// 整行写回（检查结束后的状态迁移）。
    pub fn apply(&self, record: &HealthRecord) -> Result<()> {
        let changed = self.db.with(|conn| {
            conn.execute(
                "UPDATE health_records SET
                     library_path = ?2, status = ?3, last_checked = ?4, last_error = ?5,
                     retry_count = ?6, repair_retry_count = ?7, error_details = ?8,
                     release_date = ?9, scheduled_check_at = ?10, updated_at = ?11
                 WHERE file_path = ?1",
                params![
                    record.file_path,
                    record.library_path,
                    record.status.as_str(),
                    record.last_checked,
                    record.last_error,
                    record.retry_count,
                    record.repair_retry_count,
                    record.error_details,
                    record.release_date,
                    record.scheduled_check_at,
                    record.updated_at,
                ],
            )
        })?;
        if changed == 0 {
            return Err(CoreError::new(
                codes::CONFLICT,
                format!("health record for {} vanished mid-check", record.file_path),
            ));
        }
        Ok(())
    }

    /// 启动恢复：崩溃遗留的 `checking` 清回 `pending`。
    pub fn reset_checking(&self) -> Result<u64> {
        let now = self.clock.unix_now();
        let changed = self.db.with(|conn| {
            conn.execute(
                "UPDATE health_records SET status = 'pending', updated_at = ?1
                 WHERE status = 'checking'",
                [now],
            )
        })?;
        Ok(changed as u64)
    }

    /// 全部受管路径（库同步用）。
    pub fn all_paths(&self) -> Result<Vec<String>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare("SELECT file_path FROM health_records")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// 批量登记（库同步发现的缺失记录）。
    pub fn bulk_insert(&self, records: &[HealthRecord]) -> Result<u64> {
        let mut inserted = 0u64;
        for record in records {
            self.upsert_pending(record.clone())?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// 批量删除（描述符已消失的路径）。
    pub fn bulk_delete(&self, paths: &[String]) -> Result<u64> {
        self.db.with_tx(|tx| {
            let mut removed = 0u64;
            for path in paths {
                removed += tx.execute("DELETE FROM health_records WHERE file_path = ?1", [path])?
                    as u64;
            }
            Ok(removed)
        })
    }

    /// 按状态统计。
    pub fn status_counts(&self) -> Result<Vec<(HealthStatus, u64)>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM health_records GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut counts = Vec::new();
            for row in rows {
                let (status, count) = row?;
                if let Some(status) = HealthStatus::parse(&status) {
                    counts.push((status, count));
                }
            }
            Ok(counts)
        })
    }
}

impl HealthRepo for HealthStore {
    fn upsert_pending(&self, record: HealthRecord) -> Result<()> {
        let now = self.clock.unix_now();
        let scheduled =
            policy::schedule_from_release(now, record.release_date, &mut rand::thread_rng());
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO health_records
                     (file_path, library_path, status, retry_count, max_retries,
                      repair_retry_count, max_repair_retries, source_nzb_path,
                      release_date, scheduled_check_at, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(file_path) DO UPDATE SET
                     status = 'pending',
                     retry_count = 0,
                     repair_retry_count = 0,
                     last_error = NULL,
                     error_details = NULL,
                     release_date = excluded.release_date,
                     scheduled_check_at = excluded.scheduled_check_at,
                     updated_at = excluded.updated_at",
                params![
                    record.file_path,
                    record.library_path,
                    record.max_retries,
                    record.max_repair_retries,
                    record.source_nzb_path,
                    record.release_date,
                    scheduled,
                    now,
                ],
            )
        })?;
        debug!(path = %record.file_path, scheduled, "health record registered");
        Ok(())
    }

    fn request_check(&self, file_path: &str, reason: &str) -> Result<()> {
        let now = self.clock.unix_now();
        self.db.with(|conn| {
            conn.execute(
                "UPDATE health_records SET scheduled_check_at = ?2, error_details = ?3,
                     updated_at = ?2
                 WHERE file_path = ?1 AND status NOT IN ('checking', 'corrupted')",
                params![file_path, now, reason],
            )
        })?;
        Ok(())
    }

    fn remove(&self, file_path: &str) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM health_records WHERE file_path = ?1",
                [file_path],
            )
        })?;
        Ok(())
    }
}

const COLUMNS: &str = "file_path, library_path, status, last_checked, last_error, retry_count,
    max_retries, repair_retry_count, max_repair_retries, source_nzb_path, error_details,
    release_date, scheduled_check_at, created_at, updated_at";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HealthRecord> {
    let status: String = row.get(2)?;
    Ok(HealthRecord {
        file_path: row.get(0)?,
        library_path: row.get(1)?,
        status: HealthStatus::parse(&status).unwrap_or(HealthStatus::Pending),
        last_checked: row.get(3)?,
        last_error: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        repair_retry_count: row.get(7)?,
        max_repair_retries: row.get(8)?,
        source_nzb_path: row.get(9)?,
        error_details: row.get(10)?,
        release_date: row.get(11)?,
        scheduled_check_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
