use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{ImportQueueItem, QueuePriority, QueueStatus};
use altmount_core::time::Clock;

use crate::db::Database;

/// 入队请求。
#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub nzb_path: String,
    pub relative_path: Option<String>,
    pub category: Option<String>,
    pub priority: QueuePriority,
}

/// 队列统计：按状态计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// 列表过滤条件。
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub status: Option<QueueStatus>,
    pub limit: u32,
    pub offset: u32,
}

/// 持久化导入队列。
///
/// # 设计背景（Why）
/// - 摄取必须可恢复：进程崩溃后队列行仍在，启动清扫把遗留 `running`
///   复位；重复投递按 `nzb_path` 去重；
/// - 行级互斥靠条件更新（`status='pending' → 'running'`），天然保证同一行
///   至多一个工作者。
///
/// # 契约说明（What）
/// - `enqueue`：按 `nzb_path` upsert；既有行只有处于终态时才被刷新复活；
/// - `claim_next`：原子认领最高优先级、已到退避时刻的 pending 行；
/// - `fail`：瞬态失败按 `base * 2^retry_count` 退避重排，超限转 `failed`；
/// - `reset_orphans`：启动时把 `running` 复位为 `pending`，最近更新过的行
///   视作崩溃现场并递增 `retry_count`。
pub struct QueueStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

impl QueueStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// 入队（upsert 语义）。返回行 id。
    pub fn enqueue(&self, request: EnqueueRequest, max_retries: u32) -> Result<i64> {
        let now = self.clock.unix_now();
        self.db.with_tx(|tx| {
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, status FROM import_queue WHERE nzb_path = ?1",
                    [&request.nzb_path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match existing {
                Some((id, status)) => {
                    let status = QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending);
                    if status.is_terminal() {
                        tx.execute(
                            "UPDATE import_queue SET status = 'pending', retry_count = 0,
                                 error_message = NULL, priority = ?2, relative_path = ?3,
                                 category = ?4, next_attempt_at = 0, updated_at = ?5
                             WHERE id = ?1",
                            params![
                                id,
                                request.priority.as_i64(),
                                request.relative_path,
                                request.category,
                                now
                            ],
                        )?;
                    }
                    Ok(id)
                }
                None => {
                    tx.execute(
                        "INSERT INTO import_queue
                             (nzb_path, relative_path, category, priority, status,
                              retry_count, max_retries, created_at, updated_at,
                              original_release_name)
                         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6, ?7)",
                        params![
                            request.nzb_path,
                            request.relative_path,
                            request.category,
                            request.priority.as_i64(),
                            max_retries,
                            now,
                            crate::sanitize::release_name_from_path(&request.nzb_path),
                        ],
                    )?;
                    Ok(tx.last_insert_rowid())
                }
            }
        })
    }

    /// 批量入队：单事务插入，已存在的路径跳过。返回新行 id 列表。
    pub fn batch(&self, requests: &[EnqueueRequest], max_retries: u32) -> Result<Vec<i64>> {
        let now = self.clock.unix_now();
        self.db.with_tx(|tx| {
            let mut ids = Vec::with_capacity(requests.len());
            for request in requests {
                let changed = tx.execute(
                    "INSERT OR IGNORE INTO import_queue
                         (nzb_path, relative_path, category, priority, status,
                          retry_count, max_retries, created_at, updated_at,
                          original_release_name)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?6, ?7)",
                    params![
                        request.nzb_path,
                        request.relative_path,
                        request.category,
                        request.priority.as_i64(),
                        max_retries,
                        now,
                        crate::sanitize::release_name_from_path(&request.nzb_path),
                    ],
                )?;
                if changed > 0 {
                    ids.push(tx.last_insert_rowid());
                }
            }
            Ok(ids)
        })
    }

    /// 原子认领下一个可运行的行。
    pub fn claim_next(&self) -> Result<Option<ImportQueueItem>> {
        let now = self.clock.unix_now();
        // 竞争窗口：选中的行可能被并发工作者抢走，条件更新失败就换下一行。
        for _ in 0..8 {
            let candidate: Option<i64> = self.db.with(|conn| {
                conn.query_row(
                    "SELECT id FROM import_queue
                     WHERE status = 'pending' AND next_attempt_at <= ?1
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1",
                    [now],
                    |row| row.get(0),
                )
                .optional()
            })?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let claimed = self.db.with(|conn| {
                conn.execute(
                    "UPDATE import_queue SET status = 'running', updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now],
                )
            })?;
            if claimed == 1 {
                debug!(id, "queue item claimed");
                return Ok(self.get(id)?);
            }
        }
        Ok(None)
    }

    /// 查询单行。
    pub fn get(&self, id: i64) -> Result<Option<ImportQueueItem>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM import_queue WHERE id = ?1"),
                [id],
                row_to_item,
            )
            .optional()
        })
    }

    /// 按来源路径查询。
    pub fn get_by_path(&self, nzb_path: &str) -> Result<Option<ImportQueueItem>> {
        self.db.with(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM import_queue WHERE nzb_path = ?1"),
                [nzb_path],
                row_to_item,
            )
            .optional()
        })
    }

    /// 标记完成。
    pub fn complete(&self, id: i64) -> Result<()> {
        self.transition(id, QueueStatus::Running, QueueStatus::Completed, None)
    }

    /// 标记取消（工作者回滚后调用）。
    pub fn mark_cancelled(&self, id: i64) -> Result<()> {
        self.transition(id, QueueStatus::Running, QueueStatus::Cancelled, None)
    }

    /// 取消一条尚未被认领的行。
    pub fn cancel_pending(&self, id: i64) -> Result<()> {
        self.transition(id, QueueStatus::Pending, QueueStatus::Cancelled, None)
    }

    /// 失败处理：可重试则按指数退避重排，否则落入终态 `failed`。
    pub fn fail(&self, id: i64, error: &CoreError, retryable: bool, base_secs: u64) -> Result<()> {
        let now = self.clock.unix_now();
        let message = format!("{error}");
        self.db.with_tx(|tx| {
            let (retry_count, max_retries): (u32, u32) = tx.query_row(
                "SELECT retry_count, max_retries FROM import_queue WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let next_retry = retry_count + 1;
            if retryable && next_retry < max_retries {
                let backoff = base_secs.saturating_mul(1u64 << retry_count.min(20));
                tx.execute(
                    "UPDATE import_queue SET status = 'pending', retry_count = ?2,
                         error_message = ?3, next_attempt_at = ?4, updated_at = ?5
                     WHERE id = ?1",
                    params![id, next_retry, message, now + backoff as i64, now],
                )?;
            } else {
                tx.execute(
                    "UPDATE import_queue SET status = 'failed', retry_count = ?2,
                         error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![id, next_retry, message, now],
                )?;
            }
            Ok(())
        })
    }

    /// 手工重试一条失败行。
    pub fn retry_failed(&self, id: i64) -> Result<()> {
        self.transition(id, QueueStatus::Failed, QueueStatus::Pending, Some(0))
    }

    /// 更新行的来源路径（NZB 字节迁入托管目录后）。
    pub fn update_nzb_path(&self, id: i64, nzb_path: &str) -> Result<()> {
        let now = self.clock.unix_now();
        self.db.with(|conn| {
            conn.execute(
                "UPDATE import_queue SET nzb_path = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, nzb_path, now],
            )
        })?;
        Ok(())
    }

    /// 记录释出名与元数据。
    pub fn record_release(&self, id: i64, release_name: &str, metadata: Option<&str>) -> Result<()> {
        let now = self.clock.unix_now();
        self.db.with(|conn| {
            conn.execute(
                "UPDATE import_queue SET original_release_name = ?2, metadata = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, release_name, metadata, now],
            )
        })?;
        Ok(())
    }

    /// 启动清扫：遗留 `running` 复位为 `pending`。
    ///
    /// `recent_window_secs` 之内更新过的行视作崩溃现场，`retry_count` 递增；
    /// 更老的行按普通复位处理。
    pub fn reset_orphans(&self, recent_window_secs: u64) -> Result<u64> {
        let now = self.clock.unix_now();
        let threshold = now - recent_window_secs as i64;
        let changed = self.db.with(|conn| {
            conn.execute(
                "UPDATE import_queue SET
                     status = 'pending',
                     retry_count = CASE WHEN updated_at >= ?1 THEN retry_count + 1
                                        ELSE retry_count END,
                     next_attempt_at = 0,
                     updated_at = ?2
                 WHERE status = 'running'",
                params![threshold, now],
            )
        })?;
        if changed > 0 {
            info!(orphans = changed, "orphaned running rows reset to pending");
        }
        Ok(changed as u64)
    }

    /// 列表查询。
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<ImportQueueItem>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        self.db.with(|conn| match filter.status {
            Some(status) => collect_items(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM import_queue WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                ),
                params![status.as_str(), limit, filter.offset],
            ),
            None => collect_items(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM import_queue
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ),
                params![limit, filter.offset],
            ),
        })
    }

    /// 按状态统计。
    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with(|conn| {
            let mut stats = QueueStats::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM import_queue GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match QueueStatus::parse(&status) {
                    Some(QueueStatus::Pending) => stats.pending = count,
                    Some(QueueStatus::Running) => stats.running = count,
                    Some(QueueStatus::Completed) => stats.completed = count,
                    Some(QueueStatus::Failed) => stats.failed = count,
                    Some(QueueStatus::Cancelled) => stats.cancelled = count,
                    None => {}
                }
            }
            Ok(stats)
        })
    }

    fn transition(
        &self,
        id: i64,
        from: QueueStatus,
        to: QueueStatus,
        reset_retry: Option<u32>,
    ) -> Result<()> {
        let now = self.clock.unix_now();
        let changed = self.db.with(|conn| match reset_retry {
            Some(retries) => conn.execute(
                "UPDATE import_queue SET status = ?3, retry_count = ?4, error_message = NULL,
                     next_attempt_at = 0, updated_at = ?5
                 WHERE id = ?1 AND status = ?2",
                params![id, from.as_str(), to.as_str(), retries, now],
            ),
            None => conn.execute(
                "UPDATE import_queue SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?2",
                params![id, from.as_str(), to.as_str(), now],
            ),
        })?;
        if changed == 0 {
            return Err(CoreError::new(
                codes::CONFLICT,
                format!("queue row {id} is not in state {from}"),
            ));
        }
        Ok(())
    }
}

const COLUMNS: &str = "id, nzb_path, relative_path, category, priority, status, retry_count,
    max_retries, created_at, updated_at, error_message, metadata, original_release_name";

fn collect_items(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<ImportQueueItem>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_item)?;
    rows.collect()
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ImportQueueItem> {
    let status: String = row.get(5)?;
    Ok(ImportQueueItem {
        id: row.get(0)?,
        nzb_path: row.get(1)?,
        relative_path: row.get(2)?,
        category: row.get(3)?,
        priority: QueuePriority::from_i64(row.get(4)?),
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending),
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        error_message: row.get(10)?,
        metadata: row.get(11)?,
        original_release_name: row.get(12)?,
    })
}
