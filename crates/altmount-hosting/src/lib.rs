#![doc = r#"
# altmount-hosting

## 设计动机（Why）
- **定位**：组合根。导入器、调度器与连接池通过回调能力相互引用，若放任
  各子系统自行拿单例，会出现环状初始化与“半新半旧”的配置视图；本 crate
  把全部装配收敛到一次 [`Host::build`]，依赖只在这里接线。
- **架构角色**：对 WebDAV/HTTP 前端暴露只读的
  [`VirtualFs`](altmount_vfs::VirtualFs) 与队列/健康的操作入口；持有启动
  顺序与优雅停机。

## 装配次序（How）
1. 配置快照 → 时钟 → 嵌入式数据库；
2. 描述符存储、连接池（订阅配置变更以原子替换提供方集合）；
3. 健康仓库 → 虚拟文件系统（读路径反馈缺段）；
4. 导入工作者（可选 NZBLNK 解析器）→ 健康调度器 → 库同步循环；
5. 停机逆序：调度器 → 工作者 → 同步 → 连接池。
"#]

mod resolver;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use altmount_arr::ArrDispatcher;
use altmount_core::configuration::{ConfigHandle, ConfigSnapshot};
use altmount_core::contract::Cancellation;
use altmount_core::error::Result;
use altmount_core::time::{Clock, SystemClock};
use altmount_core::traits::{
    ArticleSource, DescriptorStore, HealthRepo, LibraryPathResolver, NzbResolver,
    RescanDispatcher, VfsRefresher,
};
use altmount_health::{HealthScheduler, HealthStats, HealthStore, LibrarySync};
use altmount_import::{Database, ImportWorkers, QueueStats, QueueStore};
use altmount_meta::MetadataStore;
use altmount_nntp::{NntpPool, PoolStats};
use altmount_vfs::VirtualFs;

pub use resolver::NewznabResolver;

/// 外部协作方的注入点（全部可选）。
#[derive(Default)]
pub struct Collaborators {
    /// 外部 VFS 刷新通知（挂载助手的缓存失效入口）。
    pub refresher: Option<Arc<dyn VfsRefresher>>,
    /// 库路径解析（把虚拟路径翻译成媒体管理认识的路径）。
    pub library_resolver: Option<Arc<dyn LibraryPathResolver>>,
}

/// 聚合统计快照。
#[derive(Clone, Debug)]
pub struct HostStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub health: HealthStats,
}

/// 组合根：持有全部子系统与其生命周期。
pub struct Host {
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    pool: Arc<NntpPool>,
    store: Arc<MetadataStore>,
    vfs: Arc<VirtualFs>,
    queue: Arc<QueueStore>,
    workers: ImportWorkers,
    scheduler: HealthScheduler,
    library_sync: Arc<LibrarySync>,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Cancellation,
}

impl Host {
    /// 从配置快照装配全部子系统。必须在 Tokio 运行时内调用。
    pub fn build(snapshot: ConfigSnapshot, collaborators: Collaborators) -> Result<Self> {
        snapshot.validate()?;
        let config = ConfigHandle::new(snapshot);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let current = config.current();

        let db = Arc::new(Database::open(&current.import.db_path)?);
        let store = Arc::new(MetadataStore::new(
            current.metadata.root.clone(),
            current.metadata.lru_capacity,
        )?);

        let pool = NntpPool::new(Arc::clone(&config));
        {
            // 配置热更新：提供方集合原子替换，其余组件在决策点读新快照。
            let pool = Arc::clone(&pool);
            config.subscribe(move |snapshot| {
                pool.set_providers(snapshot.providers.clone());
            });
        }

        let health_repo = Arc::new(HealthStore::new(Arc::clone(&db), Arc::clone(&clock)));
        let vfs = VirtualFs::new(
            Arc::clone(&store) as Arc<dyn DescriptorStore>,
            Arc::clone(&pool) as Arc<dyn ArticleSource>,
            Arc::clone(&health_repo) as Arc<dyn HealthRepo>,
            Arc::clone(&config),
        );

        let queue = Arc::new(QueueStore::new(Arc::clone(&db), Arc::clone(&clock)));
        let nzb_resolver: Option<Arc<dyn NzbResolver>> = current
            .indexer
            .clone()
            .map(|settings| Arc::new(NewznabResolver::new(settings)) as Arc<dyn NzbResolver>);
        let workers = ImportWorkers::new(
            Arc::clone(&queue),
            Arc::clone(&store) as Arc<dyn DescriptorStore>,
            Arc::clone(&health_repo) as Arc<dyn HealthRepo>,
            Arc::clone(&pool) as Arc<dyn ArticleSource>,
            nzb_resolver,
            Arc::clone(&config),
            Arc::clone(&clock),
        );

        let dispatcher: Arc<dyn RescanDispatcher> =
            Arc::new(ArrDispatcher::new(Arc::clone(&config)));
        let scheduler = HealthScheduler::new(
            Arc::clone(&health_repo),
            Arc::clone(&store) as Arc<dyn DescriptorStore>,
            Arc::clone(&pool) as Arc<dyn ArticleSource>,
            dispatcher,
            collaborators.refresher,
            collaborators.library_resolver,
            Arc::clone(&config),
            Arc::clone(&clock),
        );

        let library_sync = Arc::new(LibrarySync::new(
            health_repo,
            Arc::clone(&store) as Arc<dyn DescriptorStore>,
            Arc::clone(&config),
            Arc::clone(&clock),
        ));

        Ok(Self {
            config,
            clock,
            pool,
            store,
            vfs,
            queue,
            workers,
            scheduler,
            library_sync,
            sync_handle: Mutex::new(None),
            shutdown: Cancellation::new(),
        })
    }

    /// 启动全部后台子系统。
    pub fn start(&self) -> Result<()> {
        self.workers.start()?;
        self.scheduler.start()?;

        let sync = Arc::clone(&self.library_sync);
        let config = Arc::clone(&self.config);
        let clock = Arc::clone(&self.clock);
        let shutdown = self.shutdown.child();
        *self.sync_handle.lock() = Some(tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let settings = config.current().library.clone();
                if settings.dir.is_some() {
                    if let Err(err) = sync.run_once() {
                        warn!(error = %err, "library sync pass failed");
                    }
                }
                clock
                    .sleep(std::time::Duration::from_secs(settings.sync_interval_secs))
                    .await;
            }
        }));
        info!("altmount host started");
        Ok(())
    }

    /// 优雅停机：逆装配顺序关停，幂等。
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.stop();
        self.workers.stop();
        if let Some(handle) = self.sync_handle.lock().take() {
            handle.abort();
        }
        self.pool.close();
        info!("altmount host stopped");
    }

    /// 只读文件系统表面（WebDAV 前端的调用目标）。
    pub fn vfs(&self) -> &Arc<VirtualFs> {
        &self.vfs
    }

    /// 导入队列入口（HTTP 投递、批量导入）。
    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    /// 导入工作者（取消接口）。
    pub fn import_workers(&self) -> &ImportWorkers {
        &self.workers
    }

    /// 健康调度器（手工检查、取消、统计）。
    pub fn health_scheduler(&self) -> &HealthScheduler {
        &self.scheduler
    }

    /// 描述符存储（运维工具直接访问）。
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// 配置句柄：外部装载器解析出新快照后调用 `install` 热生效。
    pub fn config_handle(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    /// 聚合统计。
    pub fn stats(&self) -> Result<HostStats> {
        Ok(HostStats {
            pool: self.pool.stats(),
            queue: self.queue.stats()?,
            health: self.scheduler.stats(),
        })
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 以环境变量过滤器初始化全局日志订阅器。
///
/// 宿主程序（或测试）显式调用一次；重复调用时保留首个订阅器。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
