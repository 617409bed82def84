use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use altmount_core::configuration::ConfigHandle;
use altmount_core::contract::{CallContext, Cancellation, Deadline};
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{FileStatus, HealthRecord, HealthStatus, QueuePriority, VirtualPath};
use altmount_core::time::Clock;
use altmount_core::traits::{
    ArticleSource, DescriptorStore, HealthRepo, LibraryPathResolver, RescanDispatcher,
    VfsRefresher,
};

use crate::policy;
use crate::repo::HealthStore;

/// 一次检查的结论。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// 抽样全部命中；记录转入 `healthy` 并按年龄分档重排。
    Healthy,
    /// 有缺失；记录带着退避继续处于给定状态。
    Degraded(HealthStatus),
    /// 记录或描述符已经不存在，双双清理。
    Orphaned,
    /// 非高优先级的手工请求只是把到期时刻提前，交给常驻循环执行。
    Scheduled,
}

/// 调度器统计。
#[derive(Clone, Debug, Default)]
pub struct HealthStats {
    pub checks_run: u64,
    pub healthy_results: u64,
    pub degraded_results: u64,
    pub repairs_triggered: u64,
    pub corrupted_total: u64,
    pub in_flight: usize,
}

/// 健康调度器：持续选取到期记录、抽样探测并驱动状态机。
///
/// # 设计背景（Why）
/// - 缺文是 Usenet 的常态而不是异常：新文件密集复查、老文件稀疏抽查，
///   重试耗尽后把修复委托给外部媒体管理，而不是在读路径上硬扛；
/// - 同一路径绝不并发检查：在途守卫（DashMap）+ `mark_checking` 条件更新
///   双保险，手工检查与定时检查天然合并。
///
/// # 契约说明（What）
/// - [`start`](Self::start)/[`stop`](Self::stop)：常驻循环的生命周期；
/// - [`manual_check`](Self::manual_check)：同路径在途时合并，否则立即检查；
/// - [`cancel`](Self::cancel)：打断指定路径的在途检查；
/// - [`stats`](Self::stats)：工作者统计快照。
pub struct HealthScheduler {
    inner: Arc<SchedulerShared>,
}

struct SchedulerShared {
    repo: Arc<HealthStore>,
    store: Arc<dyn DescriptorStore>,
    source: Arc<dyn ArticleSource>,
    dispatcher: Arc<dyn RescanDispatcher>,
    refresher: Option<Arc<dyn VfsRefresher>>,
    library: Option<Arc<dyn LibraryPathResolver>>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    in_flight: DashMap<String, Cancellation>,
    shutdown: Cancellation,
    handle: Mutex<Option<JoinHandle<()>>>,
    checks_run: AtomicU64,
    healthy_results: AtomicU64,
    degraded_results: AtomicU64,
    repairs_triggered: AtomicU64,
    corrupted_total: AtomicU64,
}

impl HealthScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<HealthStore>,
        store: Arc<dyn DescriptorStore>,
        source: Arc<dyn ArticleSource>,
        dispatcher: Arc<dyn RescanDispatcher>,
        refresher: Option<Arc<dyn VfsRefresher>>,
        library: Option<Arc<dyn LibraryPathResolver>>,
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerShared {
                repo,
                store,
                source,
                dispatcher,
                refresher,
                library,
                config,
                clock,
                in_flight: DashMap::new(),
                shutdown: Cancellation::new(),
                handle: Mutex::new(None),
                checks_run: AtomicU64::new(0),
                healthy_results: AtomicU64::new(0),
                degraded_results: AtomicU64::new(0),
                repairs_triggered: AtomicU64::new(0),
                corrupted_total: AtomicU64::new(0),
            }),
        }
    }

    /// 启动常驻循环：先清理崩溃遗留的 `checking`，再进入 tick 调度。
    pub fn start(&self) -> Result<()> {
        let cleared = self.inner.repo.reset_checking()?;
        if cleared > 0 {
            info!(cleared, "stale checking records reset to pending");
        }
        let inner = Arc::clone(&self.inner);
        *self.inner.handle.lock() = Some(tokio::spawn(run_loop(inner)));
        Ok(())
    }

    /// 停止调度：幂等；打断循环并取消全部在途检查。
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.in_flight.iter() {
            entry.value().cancel();
        }
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.abort();
        }
    }

    /// 手工触发一次检查；同路径已在途时合并为既有检查。
    ///
    /// 高优先级立即在调用方上下文里执行；其余优先级只把到期时刻提前到
    /// 现在，由常驻循环按并发预算消化。
    pub async fn manual_check(
        &self,
        file_path: &str,
        priority: QueuePriority,
    ) -> Result<CheckOutcome> {
        if self.inner.in_flight.contains_key(file_path) {
            debug!(path = file_path, "manual check coalesced with in-flight check");
            return Ok(CheckOutcome::Degraded(HealthStatus::Checking));
        }
        let Some(record) = self.inner.repo.get(file_path)? else {
            return Err(CoreError::new(
                codes::PATH_NOT_FOUND,
                format!("no health record for {file_path}"),
            ));
        };
        if priority != QueuePriority::High {
            self.inner
                .repo
                .request_check(file_path, "manual check requested")?;
            return Ok(CheckOutcome::Scheduled);
        }
        check_one(&self.inner, record).await
    }

    /// 打断指定路径的在途检查。
    pub fn cancel(&self, file_path: &str) {
        if let Some(entry) = self.inner.in_flight.get(file_path) {
            entry.value().cancel();
        }
    }

    /// 配置句柄（热更新入口与测试使用）。
    pub fn config_handle(&self) -> Arc<ConfigHandle> {
        Arc::clone(&self.inner.config)
    }

    /// 工作者统计快照。
    pub fn stats(&self) -> HealthStats {
        HealthStats {
            checks_run: self.inner.checks_run.load(Ordering::Relaxed),
            healthy_results: self.inner.healthy_results.load(Ordering::Relaxed),
            degraded_results: self.inner.degraded_results.load(Ordering::Relaxed),
            repairs_triggered: self.inner.repairs_triggered.load(Ordering::Relaxed),
            corrupted_total: self.inner.corrupted_total.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
        }
    }
}

impl Drop for HealthScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(inner: Arc<SchedulerShared>) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        let settings = inner.config.current().health.clone();
        if settings.enabled {
            let budget = settings
                .max_concurrent_jobs
                .saturating_sub(inner.in_flight.len());
            if budget > 0 {
                match inner.repo.due(budget) {
                    Ok(due) => {
                        for record in due {
                            if inner.in_flight.contains_key(&record.file_path) {
                                continue;
                            }
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                let path = record.file_path.clone();
                                if let Err(err) = check_one(&inner, record).await {
                                    warn!(path, error = %err, "health check failed");
                                }
                            });
                        }
                    }
                    Err(err) => warn!(error = %err, "due query failed"),
                }
            }
        }
        inner.clock.sleep(settings.tick_interval()).await;
    }
}

/// 单条记录的完整检查流程。
///
/// # 执行步骤（How）
/// 1. 在途守卫占位 + `mark_checking` 条件更新（双保险去并发）；
/// 2. 读描述符；缺失即孤儿：记录删除；
/// 3. 随机抽样 `segment_sample_percentage`%（至少 1 段），并行 `stat`
///    探测，并发受 `max_connections_for_health_checks` 约束；
/// 4. 按状态机落盘迁移；进入 `repair_triggered` 时调用修复分发，
///   `repair.path_match_failed` 触发孤儿清理；
/// 5. 状态变化后异步通知外部 VFS 刷新父目录（失败仅记日志）。
async fn check_one(inner: &Arc<SchedulerShared>, record: HealthRecord) -> Result<CheckOutcome> {
    let path = record.file_path.clone();
    let token = Cancellation::new();
    match inner.in_flight.entry(path.clone()) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            // 竞争中输给了另一个检查者。
            return Ok(CheckOutcome::Degraded(HealthStatus::Checking));
        }
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
            vacant.insert(token.clone());
        }
    }
    let outcome = run_guarded(inner, record, token).await;
    inner.in_flight.remove(&path);
    outcome
}

async fn run_guarded(
    inner: &Arc<SchedulerShared>,
    mut record: HealthRecord,
    token: Cancellation,
) -> Result<CheckOutcome> {
    let prior_status = record.status;
    if !inner.repo.mark_checking(&record.file_path)? {
        return Ok(CheckOutcome::Degraded(HealthStatus::Checking));
    }
    inner.checks_run.fetch_add(1, Ordering::Relaxed);
    let ctx = CallContext::with_parts(token, Deadline::none());

    let virtual_path = VirtualPath::parse(&record.file_path)?;
    let descriptor = match inner.store.read(&virtual_path) {
        Ok(descriptor) => descriptor,
        Err(err) if err.is_not_found() => {
            info!(path = %record.file_path, "descriptor vanished, clearing orphan record");
            inner.repo.remove(&record.file_path)?;
            return Ok(CheckOutcome::Orphaned);
        }
        Err(err) => return Err(err),
    };

    let settings = inner.config.current().health.clone();
    let missing = sample_segments(inner, &ctx, &descriptor.segments, &settings).await?;
    let now = inner.clock.unix_now();
    record.last_checked = Some(now);
    record.updated_at = now;

    let outcome = if missing == 0 {
        record.status = HealthStatus::Healthy;
        record.retry_count = 0;
        record.repair_retry_count = 0;
        record.last_error = None;
        record.scheduled_check_at =
            policy::schedule_from_release(now, record.release_date, &mut rand::thread_rng());
        if descriptor.status != FileStatus::Healthy {
            if let Err(err) = inner.store.update_status(&virtual_path, FileStatus::Healthy) {
                warn!(path = %record.file_path, error = %err, "status restore failed");
            }
        }
        inner.healthy_results.fetch_add(1, Ordering::Relaxed);
        CheckOutcome::Healthy
    } else {
        record.last_error = Some(format!("{missing} sampled segment(s) unavailable"));
        inner.degraded_results.fetch_add(1, Ordering::Relaxed);
        match prior_status {
            HealthStatus::RepairTriggered => {
                record.repair_retry_count += 1;
                if record.repair_retry_count < record.max_repair_retries {
                    record.status = HealthStatus::RepairTriggered;
                    record.scheduled_check_at =
                        now + policy::retry_backoff(record.repair_retry_count).as_secs() as i64;
                } else {
                    // 修复重试也耗尽：终态，不再自动复查。
                    record.status = HealthStatus::Corrupted;
                    record.scheduled_check_at = i64::MAX;
                    inner.corrupted_total.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = inner
                        .store
                        .update_status(&virtual_path, FileStatus::Corrupted)
                    {
                        warn!(path = %record.file_path, error = %err, "corrupted mark failed");
                    }
                }
                CheckOutcome::Degraded(record.status)
            }
            _ => {
                record.retry_count += 1;
                if record.retry_count < record.max_retries {
                    record.status = HealthStatus::Pending;
                    record.scheduled_check_at =
                        now + policy::retry_backoff(record.retry_count).as_secs() as i64;
                } else {
                    record.status = HealthStatus::RepairTriggered;
                    record.scheduled_check_at =
                        now + policy::retry_backoff(record.repair_retry_count).as_secs() as i64;
                    inner.repairs_triggered.fetch_add(1, Ordering::Relaxed);
                    match trigger_repair(inner, &ctx, &record, &virtual_path).await {
                        RepairVerdict::Dispatched => {}
                        RepairVerdict::Orphaned => {
                            return Ok(CheckOutcome::Orphaned);
                        }
                        RepairVerdict::Failed => {}
                    }
                }
                CheckOutcome::Degraded(record.status)
            }
        }
    };

    inner.repo.apply(&record)?;
    notify_refresh(inner, &virtual_path);
    Ok(outcome)
}

enum RepairVerdict {
    Dispatched,
    Orphaned,
    Failed,
}

/// 进入 `repair_triggered` 时委托外部媒体管理重扫。
async fn trigger_repair(
    inner: &Arc<SchedulerShared>,
    ctx: &CallContext,
    record: &HealthRecord,
    virtual_path: &VirtualPath,
) -> RepairVerdict {
    let path_for_rescan = record
        .library_path
        .clone()
        .or_else(|| {
            inner
                .library
                .as_ref()
                .and_then(|resolver| resolver.resolve(virtual_path))
        })
        .unwrap_or_else(|| record.file_path.clone());
    let relative = virtual_path.file_name().to_string();

    match inner
        .dispatcher
        .trigger_rescan(ctx, &path_for_rescan, &relative)
        .await
    {
        Ok(()) => {
            info!(path = %record.file_path, rescan = %path_for_rescan, "repair dispatched");
            RepairVerdict::Dispatched
        }
        Err(err) if err.code() == codes::PATH_MATCH_FAILED => {
            // 没有任何实例认领：文件是孤儿，描述符与记录一并清理。
            info!(path = %record.file_path, "repair target unmanaged, deleting orphan");
            if let Err(err) = inner.store.delete(virtual_path) {
                warn!(path = %record.file_path, error = %err, "orphan descriptor delete failed");
            }
            if let Err(err) = inner.repo.remove(&record.file_path) {
                warn!(path = %record.file_path, error = %err, "orphan record delete failed");
            }
            notify_refresh(inner, virtual_path);
            RepairVerdict::Orphaned
        }
        Err(err) => {
            warn!(path = %record.file_path, error = %err, "repair dispatch failed");
            RepairVerdict::Failed
        }
    }
}

/// 抽样探测：返回缺失的分段数。
async fn sample_segments(
    inner: &Arc<SchedulerShared>,
    ctx: &CallContext,
    segments: &[altmount_core::model::Segment],
    settings: &altmount_core::configuration::HealthSettings,
) -> Result<usize> {
    if segments.is_empty() {
        return Ok(0);
    }
    let sample_size = ((segments.len() * settings.segment_sample_percentage as usize) / 100).max(1);
    let mut indices: Vec<usize> = (0..segments.len()).collect();
    indices.shuffle(&mut rand::thread_rng());
    indices.truncate(sample_size);

    let concurrency = settings.max_connections_for_health_checks.max(1);
    let mut missing = 0usize;
    for batch in indices.chunks(concurrency) {
        let mut probes = Vec::with_capacity(batch.len());
        for &idx in batch {
            let segment = &segments[idx];
            probes.push(inner.source.stat(ctx, &segment.id, &segment.groups));
        }
        for result in futures::future::join_all(probes).await {
            match result {
                Ok(true) => {}
                Ok(false) => missing += 1,
                Err(err) if err.is_cancelled() => return Err(err),
                // 探测性的瞬态失败不算缺失，留给下一轮。
                Err(err) => debug!(error = %err, "segment probe errored"),
            }
        }
    }
    Ok(missing)
}

fn notify_refresh(inner: &Arc<SchedulerShared>, virtual_path: &VirtualPath) {
    if let Some(refresher) = inner.refresher.as_ref() {
        let parent = virtual_path.parent();
        refresher.refresh_dir(parent.as_str(), &[parent.as_str().to_string()]);
    }
}
