use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use altmount_core::configuration::ConfigHandle;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{HealthRecord, VirtualPath};
use altmount_core::time::Clock;
use altmount_core::traits::{DescriptorStore, HealthRepo};

use crate::repo::HealthStore;

/// 一次库同步的统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 新登记的健康记录数。
    pub records_inserted: u64,
    /// 清理的陈旧健康记录数。
    pub records_removed: u64,
    /// 写出的库指针文件数。
    pub pointers_written: u64,
    /// 清理的陈旧库指针数。
    pub pointers_removed: u64,
}

/// 库同步器：让描述符树、健康表与伴随库目录三者保持一致。
///
/// # 设计背景（Why）
/// - 三份视图各有生灭路径：描述符由导入与孤儿清理维护，健康表由调度器
///   维护，库目录给媒体管理消费；定期对账把漂移收敛掉；
/// - 库目录里放 `.strm` 指针文件（内容是虚拟路径），媒体管理按普通文件
///   扫描即可识别。
///
/// # 契约说明（What）
/// - 描述符存在而健康表缺记录 → 批量登记 `pending`；
/// - 健康表有记录而描述符消失 → 批量删除；
/// - 库目录与描述符树单向对齐：多余指针删除、缺失指针补写。
pub struct LibrarySync {
    repo: Arc<HealthStore>,
    store: Arc<dyn DescriptorStore>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
}

impl LibrarySync {
    pub fn new(
        repo: Arc<HealthStore>,
        store: Arc<dyn DescriptorStore>,
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            store,
            config,
            clock,
        }
    }

    /// 执行一轮对账。
    pub fn run_once(&self) -> Result<SyncReport> {
        let snapshot = self.config.current();
        let mut report = SyncReport::default();

        let mut descriptor_paths: BTreeSet<String> = BTreeSet::new();
        collect_files(self.store.as_ref(), &VirtualPath::root(), &mut descriptor_paths)?;
        let health_paths: BTreeSet<String> = self.repo.all_paths()?.into_iter().collect();

        // 缺记录的描述符补登记。
        let now = self.clock.unix_now();
        let health_settings = snapshot.health.clone();
        let missing: Vec<HealthRecord> = descriptor_paths
            .difference(&health_paths)
            .map(|path| {
                HealthRecord::pending(
                    path.clone(),
                    None,
                    health_settings.max_retries,
                    health_settings.max_repair_retries,
                    now,
                    now,
                )
            })
            .collect();
        if !missing.is_empty() {
            report.records_inserted = self.repo.bulk_insert(&missing)?;
        }

        // 描述符已消失的记录清掉。
        let stale: Vec<String> = health_paths
            .difference(&descriptor_paths)
            .cloned()
            .collect();
        if !stale.is_empty() {
            report.records_removed = self.repo.bulk_delete(&stale)?;
        }

        // 库目录指针对齐。
        if let Some(library_dir) = snapshot.library.dir.clone() {
            let (written, removed) = sync_pointers(&library_dir, &descriptor_paths)?;
            report.pointers_written = written;
            report.pointers_removed = removed;
        }

        info!(
            inserted = report.records_inserted,
            removed = report.records_removed,
            pointers_written = report.pointers_written,
            pointers_removed = report.pointers_removed,
            "library sync completed"
        );
        Ok(report)
    }
}

/// 递归收集描述符树里的全部文件路径。
fn collect_files(
    store: &dyn DescriptorStore,
    prefix: &VirtualPath,
    out: &mut BTreeSet<String>,
) -> Result<()> {
    let entries = match store.list(prefix) {
        Ok(entries) => entries,
        // 空树：根目录可能还没有任何描述符。
        Err(err) if err.is_not_found() && prefix.is_root() => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let child = prefix.join(&entry.name)?;
        if entry.is_dir {
            collect_files(store, &child, out)?;
        } else {
            out.insert(child.as_str().to_string());
        }
    }
    Ok(())
}

/// 把库目录的 `.strm` 指针对齐到描述符树。
fn sync_pointers(library_dir: &Path, descriptor_paths: &BTreeSet<String>) -> Result<(u64, u64)> {
    let mut written = 0u64;
    let mut removed = 0u64;

    // 期望的指针集合：`<library>/<virtual path>.strm`。
    let mut expected: BTreeSet<PathBuf> = BTreeSet::new();
    for virtual_path in descriptor_paths {
        let relative = virtual_path.trim_start_matches('/');
        let pointer = library_dir.join(format!("{relative}.strm"));
        if !pointer.exists() {
            if let Some(parent) = pointer.parent() {
                std::fs::create_dir_all(parent).map_err(io_error)?;
            }
            std::fs::write(&pointer, virtual_path.as_bytes()).map_err(io_error)?;
            written += 1;
            debug!(pointer = %pointer.display(), "library pointer written");
        }
        expected.insert(pointer);
    }

    removed += prune_stale_pointers(library_dir, &expected)?;
    Ok((written, removed))
}

fn prune_stale_pointers(dir: &Path, expected: &BTreeSet<PathBuf>) -> Result<u64> {
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(io_error(err)),
    };
    let mut removed = 0u64;
    for entry in reader.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += prune_stale_pointers(&path, expected)?;
            // 清空后的目录一并移除。
            let _ = std::fs::remove_dir(&path);
        } else if path.extension().and_then(|e| e.to_str()) == Some("strm")
            && !expected.contains(&path)
        {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(pointer = %path.display(), error = %err, "stale pointer not removed"),
            }
        }
    }
    Ok(removed)
}

fn io_error(err: std::io::Error) -> CoreError {
    CoreError::new(codes::META_IO, "library directory I/O failed").with_cause(err)
}
