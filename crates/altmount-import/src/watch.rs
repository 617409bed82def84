use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use altmount_core::model::QueuePriority;

use crate::queue::EnqueueRequest;
use crate::worker::WorkerShared;

/// 监视目录扫描循环。
///
/// # 设计背景（Why）
/// - 不依赖平台文件事件：定时扫描 + “两轮大小一致”判稳，对网络盘与
///   rsync 投递同样可靠；
/// - 去重交给队列的按路径 upsert：同一文件的重复扫描不会产生第二行，
///   成功导入后文件被移出监视目录，循环自然收敛。
pub(crate) async fn watch_loop(inner: Arc<WorkerShared>) {
    let mut observed: HashMap<PathBuf, u64> = HashMap::new();
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let settings = inner.config.current().import.clone();
        if let Some(dir) = settings.watch_dir.clone() {
            scan_once(&inner, &dir, &mut observed);
        } else {
            observed.clear();
        }
        tokio::time::sleep(settings.watch_interval()).await;
    }
}

fn scan_once(inner: &Arc<WorkerShared>, dir: &PathBuf, observed: &mut HashMap<PathBuf, u64>) {
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "watch directory unreadable");
            return;
        }
    };

    let mut seen: Vec<PathBuf> = Vec::new();
    for entry in reader.flatten() {
        let path = entry.path();
        let is_nzb = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("nzb"));
        if !is_nzb {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        seen.push(path.clone());
        let size = meta.len();
        match observed.get(&path) {
            // 两轮大小一致：认为写入已完成，可以入队。
            Some(&previous) if previous == size => {
                let request = EnqueueRequest {
                    nzb_path: path.display().to_string(),
                    relative_path: None,
                    category: None,
                    priority: QueuePriority::Normal,
                };
                let max_retries = inner.config.current().import.max_retries;
                match inner.queue.enqueue(request, max_retries) {
                    Ok(id) => debug!(id, path = %path.display(), "watched nzb enqueued"),
                    Err(err) => warn!(path = %path.display(), error = %err, "enqueue failed"),
                }
            }
            _ => {
                observed.insert(path, size);
            }
        }
    }
    // 被移走/删除的文件不再占用判稳表。
    observed.retain(|path, _| seen.contains(path));
}
