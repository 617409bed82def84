use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use altmount_core::error::{CoreError, Result, codes};

/// 嵌入式数据库：导入队列与健康记录共用一个 SQLite 文件。
///
/// # 设计背景（Why）
/// - 两张表的写入方都遵循“单写者每行”的条件更新纪律，SQLite 的单文件部署
///   与 WAL 模式足以支撑这种负载，免去外部数据库依赖；
/// - 迁移在打开时按文件名顺序应用并登记在 `_migrations` 表，旧库自动升级。
///
/// # 契约说明（What）
/// - 连接由互斥锁串行化；所有操作都是短事务，不跨越 await 点；
/// - SQL 层故障统一映射为 `store.io`，约束冲突由上层以 `store.conflict`
///   语义处理。
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

/// 迁移清单：新文件追加在末尾，绝不改写已发布的条目。
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init",
    include_str!("../migrations/0001_init.sql"),
)];

impl Database {
    /// 打开（必要时创建）数据库文件并应用迁移。
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                CoreError::new(codes::STORE_IO, "cannot create database directory").with_cause(err)
            })?;
        }
        let conn = Connection::open(path).map_err(sql_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_error)?;
        conn.pragma_update(None, "busy_timeout", 5_000)
            .map_err(sql_error)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库，测试专用。
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )
        .map_err(sql_error)?;

        for (version, sql) in MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                    [version],
                    |row| row.get(0),
                )
                .map_err(sql_error)?;
            if applied {
                continue;
            }
            conn.execute_batch(&format!("BEGIN;\n{sql}\nCOMMIT;"))
                .map_err(sql_error)?;
            conn.execute(
                "INSERT INTO _migrations (version, applied_at) VALUES (?1, strftime('%s','now'))",
                [version],
            )
            .map_err(sql_error)?;
            info!(version, "database migration applied");
        }
        Ok(())
    }

    /// 在持锁的连接上执行一段短操作。
    ///
    /// 回调不得阻塞或跨越 await 点；SQL 错误统一映射为 `store.io`。
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(sql_error)
    }

    /// 在单个事务里执行一段操作；回调返回错误时回滚。
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_error)?;
        let out = f(&tx).map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;
        Ok(out)
    }
}

pub(crate) fn sql_error(err: rusqlite::Error) -> CoreError {
    CoreError::new(codes::STORE_IO, "embedded database operation failed").with_cause(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("alt.db");
        drop(Database::open(&path).expect("first open"));
        let db = Database::open(&path).expect("second open");
        let count: i64 = db
            .with(|conn| conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0)))
            .expect("count");
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn corrupted_file_fails_to_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.db");
        std::fs::write(&path, b"not a valid sqlite file\x00\x00\x00").unwrap();
        let err = Database::open(&path).unwrap_err();
        assert_eq!(err.code(), codes::STORE_IO);
    }
}
