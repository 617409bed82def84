use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use altmount_core::configuration::ConfigHandle;
use altmount_core::contract::{CallContext, Cancellation, Deadline};
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{
    Encryption, FileDescriptor, FileStatus, HealthRecord, ImportQueueItem, VirtualPath,
};
use altmount_core::time::Clock;
use altmount_core::traits::{ArticleSource, DescriptorStore, HealthRepo, NzbResolver};
use altmount_meta::SegmentCache;

use crate::nzb::{self, NzbDocument, NzbFile};
use crate::queue::QueueStore;
use crate::sanitize;
use crate::watch::watch_loop;

/// 导入工作者池：认领队列行并执行逐条摄取管线。
///
/// # 设计背景（Why）
/// - 摄取是纯后台负载：固定数量的工作者竞争 pending 行，行级互斥由队列的
///   条件更新保证，工作者之间不需要任何协调；
/// - 崩溃恢复是启动时的一次清扫：遗留 `running` 行复位，近期更新过的视作
///   崩溃现场并递增重试计数。
///
/// # 契约说明（What）
/// - [`start`](Self::start) 先清扫孤儿行，再拉起工作者与监视目录扫描；
/// - [`cancel`](Self::cancel)：在途条目通过取消令牌打断，工作者回滚本轮
///   写入的描述符；未认领条目直接转 `cancelled`；
/// - [`stop`](Self::stop) 幂等，触发停机令牌并中止全部任务。
pub struct ImportWorkers {
    inner: Arc<WorkerShared>,
}

pub(crate) struct WorkerShared {
    pub(crate) queue: Arc<QueueStore>,
    pub(crate) store: Arc<dyn DescriptorStore>,
    pub(crate) health: Arc<dyn HealthRepo>,
    pub(crate) source: Arc<dyn ArticleSource>,
    pub(crate) resolver: Option<Arc<dyn NzbResolver>>,
    pub(crate) config: Arc<ConfigHandle>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) segments: SegmentCache,
    pub(crate) cancellations: DashMap<i64, Cancellation>,
    pub(crate) shutdown: Cancellation,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ImportWorkers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore>,
        store: Arc<dyn DescriptorStore>,
        health: Arc<dyn HealthRepo>,
        source: Arc<dyn ArticleSource>,
        resolver: Option<Arc<dyn NzbResolver>>,
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let segment_budget = config.current().metadata.segment_cache_bytes;
        Self {
            inner: Arc::new(WorkerShared {
                queue,
                store,
                health,
                source,
                resolver,
                config,
                clock,
                segments: SegmentCache::new(segment_budget),
                cancellations: DashMap::new(),
                shutdown: Cancellation::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 队列句柄（入队、列表、统计由调用方直接使用）。
    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.inner.queue
    }

    /// 配置句柄（热更新入口与测试使用）。
    pub fn config_handle(&self) -> Arc<ConfigHandle> {
        Arc::clone(&self.inner.config)
    }

    /// 清扫孤儿行并拉起工作者与监视扫描。必须在 Tokio 运行时内调用。
    pub fn start(&self) -> Result<()> {
        let settings = self.inner.config.current().import.clone();
        let recent_window = settings.poll_interval_secs.saturating_mul(10);
        self.inner.queue.reset_orphans(recent_window)?;

        let mut handles = self.inner.handles.lock();
        for worker in 0..settings.max_processor_workers {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(worker_loop(inner, worker)));
        }
        let inner = Arc::clone(&self.inner);
        handles.push(tokio::spawn(watch_loop(inner)));
        info!(workers = settings.max_processor_workers, "import workers started");
        Ok(())
    }

    /// 请求取消一个条目。
    pub fn cancel(&self, id: i64) -> Result<()> {
        if let Some(token) = self.inner.cancellations.get(&id) {
            token.cancel();
            return Ok(());
        }
        self.inner.queue.cancel_pending(id)
    }

    /// 停机：幂等；触发令牌并中止全部后台任务。
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ImportWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn worker_loop(inner: Arc<WorkerShared>, worker: usize) {
    debug!(worker, "import worker online");
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        match inner.queue.claim_next() {
            Ok(Some(item)) => process_claimed(&inner, item).await,
            Ok(None) => {
                let interval = inner.config.current().import.poll_interval();
                tokio::time::sleep(interval).await;
            }
            Err(err) => {
                warn!(worker, error = %err, "queue claim failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_claimed(inner: &Arc<WorkerShared>, mut item: ImportQueueItem) {
    let id = item.id;
    let token = Cancellation::new();
    inner.cancellations.insert(id, token.clone());
    let ctx = CallContext::with_parts(token, Deadline::none());

    let mut written: Vec<VirtualPath> = Vec::new();
    let outcome = run_pipeline(inner, &ctx, &mut item, &mut written).await;
    inner.cancellations.remove(&id);

    let settings = inner.config.current().import.clone();
    match outcome {
        Ok(()) => {
            info!(id, nzb = %item.nzb_path, files = written.len(), "import completed");
            if let Err(err) = inner.queue.complete(id) {
                warn!(id, error = %err, "failed to mark item completed");
            }
        }
        Err(err) if err.is_cancelled() => {
            info!(id, "import cancelled, rolling back partial writes");
            rollback(inner, &written);
            if let Err(err) = inner.queue.mark_cancelled(id) {
                warn!(id, error = %err, "failed to mark item cancelled");
            }
        }
        Err(err) => {
            let retryable = err.is_retryable();
            warn!(id, error = %err, retryable, "import failed");
            rollback(inner, &written);
            if let Err(store_err) =
                inner
                    .queue
                    .fail(id, &err, retryable, settings.retry_base_secs)
            {
                warn!(id, error = %store_err, "failed to record import failure");
            }
        }
    }
}

/// 逐条摄取管线。
///
/// # 执行步骤（How）
/// 1. 取得 NZB 字节（磁盘文件或经索引站解析 NZBLNK）；
/// 2. 落盘到托管目录 `<managed>/<id>_<name>.nzb`，更新行内路径并移走
///    来源文件；
/// 3. 解析文档；零文件/零分段按不可重试的格式错误处理；
/// 4. 逐文件恢复规范文件名：主题清洗优先，yEnc 头探测兜底（探测失败
///    非致命）；首段正文预取进分段缓存，顺带校验可用性；
/// 5. 识别 RAR 分卷集合并按规范排序记下首卷；
/// 6. 在 `(category, relative_path, 文件名)` 下写描述符并登记健康记录。
///
/// 调用方负责把成功落盘的路径回滚（取消/失败时）。
async fn run_pipeline(
    inner: &Arc<WorkerShared>,
    ctx: &CallContext,
    item: &mut ImportQueueItem,
    written: &mut Vec<VirtualPath>,
) -> Result<()> {
    let snapshot = inner.config.current();
    let now = std::time::Instant::now();
    ctx.ensure_active(now)?;

    // 1. 来源字节。
    let (bytes, link_password) = if nzb::is_nzblnk(&item.nzb_path) {
        let link = nzb::parse_nzblnk(&item.nzb_path)?;
        let resolver = inner.resolver.as_ref().ok_or_else(|| {
            CoreError::new(
                codes::CONFIG_INVALID,
                "nzblnk submitted but no indexer resolver is configured",
            )
        })?;
        let bytes = resolver
            .resolve(ctx, &link.title, &link.header, link.group.as_deref())
            .await?;
        (bytes, link.password)
    } else {
        let bytes = tokio::fs::read(&item.nzb_path).await.map_err(|err| {
            CoreError::new(
                codes::META_IO,
                format!("cannot read nzb at {}", item.nzb_path),
            )
            .with_cause(err)
        })?;
        (bytes, None)
    };

    // 2. 落盘到托管目录。
    let managed_dir = snapshot.metadata.nzb_dir.clone();
    let managed_path = persist_nzb(inner, item, &managed_dir, &bytes).await?;

    // 3. 解析。
    let document = nzb::parse_nzb(&bytes)?;
    let release_name = document
        .name
        .clone()
        .or_else(|| sanitize::release_name_from_path(&managed_path.display().to_string()))
        .unwrap_or_else(|| format!("release-{}", item.id));

    // 4. 文件名恢复 + 首段预取。
    let mut names: Vec<String> = Vec::with_capacity(document.files.len());
    for (index, file) in document.files.iter().enumerate() {
        ctx.ensure_active(std::time::Instant::now())?;
        let name = recover_name(inner, ctx, file, index).await;
        prefetch_first_segment(inner, ctx, file).await;
        names.push(name);
    }

    // 5. RAR 分类。
    let rar_first = sanitize::rar_first(&names);
    let metadata = build_metadata(&document, link_password.as_deref(), rar_first.as_deref());
    inner
        .queue
        .record_release(item.id, &release_name, metadata.as_deref())?;

    // 6. 描述符 + 健康登记。
    let release_date = document.release_date();
    let created_at = inner.clock.unix_now();
    let health_settings = snapshot.health.clone();
    for (file, name) in document.files.iter().zip(&names) {
        ctx.ensure_active(std::time::Instant::now())?;
        let path = virtual_path_for(item, name)?;
        let descriptor = FileDescriptor {
            size: file.segments.iter().map(|s| s.bytes).sum(),
            source_nzb_path: managed_path.display().to_string(),
            status: FileStatus::Healthy,
            created_at,
            release_date: file.date.or(release_date),
            password: document.password.clone().or_else(|| link_password.clone()),
            salt: None,
            encryption: Encryption::None,
            segments: file.segments.clone(),
            trailing: Vec::new(),
        };
        inner.store.write(&path, &descriptor)?;
        written.push(path.clone());

        inner.health.upsert_pending(HealthRecord::pending(
            path.as_str(),
            descriptor.release_date,
            health_settings.max_retries,
            health_settings.max_repair_retries,
            created_at,
            created_at,
        ))?;
    }

    item.nzb_path = managed_path.display().to_string();
    Ok(())
}

/// 把 NZB 字节写入托管目录并更新队列行。已在托管目录下时原样返回。
async fn persist_nzb(
    inner: &Arc<WorkerShared>,
    item: &ImportQueueItem,
    managed_dir: &Path,
    bytes: &[u8],
) -> Result<PathBuf> {
    let current = Path::new(&item.nzb_path);
    if current.starts_with(managed_dir) {
        return Ok(current.to_path_buf());
    }
    tokio::fs::create_dir_all(managed_dir).await.map_err(|err| {
        CoreError::new(codes::META_IO, "cannot create managed nzb directory").with_cause(err)
    })?;

    let stem = if nzb::is_nzblnk(&item.nzb_path) {
        nzb::parse_nzblnk(&item.nzb_path)
            .map(|link| link.title)
            .unwrap_or_else(|_| format!("item-{}", item.id))
    } else {
        sanitize::release_name_from_path(&item.nzb_path)
            .unwrap_or_else(|| format!("item-{}", item.id))
    };
    let target = managed_dir.join(format!(
        "{}_{}.nzb",
        item.id,
        sanitize::sanitize_component(&stem)
    ));
    tokio::fs::write(&target, bytes).await.map_err(|err| {
        CoreError::new(codes::META_IO, "cannot persist nzb into managed directory")
            .with_cause(err)
    })?;
    inner
        .queue
        .update_nzb_path(item.id, &target.display().to_string())?;

    // 行内路径已指向托管副本；立刻移走来源文件，监视扫描不会再看到它。
    if !nzb::is_nzblnk(&item.nzb_path) && current != target {
        if let Err(err) = std::fs::remove_file(current) {
            debug!(path = %current.display(), error = %err, "source nzb not removed");
        }
    }
    Ok(target)
}

/// 文件名恢复：主题清洗优先，yEnc 头探测兜底，最后退到首段标识。
async fn recover_name(
    inner: &Arc<WorkerShared>,
    ctx: &CallContext,
    file: &NzbFile,
    index: usize,
) -> String {
    if let Some(name) = sanitize::filename_from_subject(&file.subject) {
        return sanitize::sanitize_component(&name);
    }
    if let Some(first) = file.segments.first() {
        match inner.source.probe(ctx, &first.id, &first.groups).await {
            Ok(probe) => {
                if let Some(name) = probe.name {
                    return sanitize::sanitize_component(&name);
                }
            }
            Err(err) => {
                debug!(segment = %first.id, error = %err, "yenc header probe failed");
            }
        }
        return sanitize::sanitize_component(&first.id);
    }
    format!("file-{index:03}")
}

/// 首段正文预取：校验可用性并填充分段缓存，任何失败都不阻断导入。
///
/// 重试同一条目时缓存命中，首段不会被重复下载。
async fn prefetch_first_segment(inner: &Arc<WorkerShared>, ctx: &CallContext, file: &NzbFile) {
    let Some(first) = file.segments.first() else {
        return;
    };
    if inner.segments.get(&first.id).is_some() {
        return;
    }
    let mut payload: Vec<u8> = Vec::new();
    match inner
        .source
        .body(ctx, &first.id, &first.groups, &mut payload)
        .await
    {
        Ok(written) => {
            if written < first.bytes {
                debug!(
                    segment = %first.id,
                    declared = first.bytes,
                    actual = written,
                    "first segment shorter than declared"
                );
            }
            inner.segments.insert(first.id.clone(), payload);
        }
        Err(err) => {
            debug!(segment = %first.id, error = %err, "first segment prefetch failed");
        }
    }
}

fn virtual_path_for(item: &ImportQueueItem, name: &str) -> Result<VirtualPath> {
    let mut path = VirtualPath::root();
    if let Some(category) = item.category.as_deref() {
        path = path.join(&sanitize::sanitize_component(category))?;
    }
    if let Some(relative) = item.relative_path.as_deref() {
        for component in relative.split(['/', '\\']).filter(|c| !c.is_empty()) {
            path = path.join(&sanitize::sanitize_component(component))?;
        }
    }
    path.join(name)
}

fn build_metadata(
    document: &NzbDocument,
    link_password: Option<&str>,
    rar_first: Option<&str>,
) -> Option<String> {
    let password = document.password.as_deref().or(link_password);
    if password.is_none() && rar_first.is_none() {
        return None;
    }
    let value = serde_json::json!({
        "password": password,
        "rar_first": rar_first,
    });
    Some(value.to_string())
}

/// 回滚本轮写入：删描述符、撤健康登记、清理空目录。
fn rollback(inner: &Arc<WorkerShared>, written: &[VirtualPath]) {
    for path in written {
        if let Err(err) = inner.store.delete(path) {
            warn!(path = %path, error = %err, "rollback delete failed");
        }
        if let Err(err) = inner.health.remove(path.as_str()) {
            warn!(path = %path, error = %err, "rollback health cleanup failed");
        }
    }
}
