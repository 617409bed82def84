use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{CoreError, Result, codes};
use crate::model::ProviderConfig;

/// 全量配置快照：核心所有子系统在每个决策点读取的单一事实来源。
///
/// # 设计背景（Why）
/// - 热更新场景下，组件缓存派生值会导致“半新半旧”的决策；统一从快照读取，
///   新旧配置的切换点就收敛为一次原子指针替换；
/// - 以 TOML 为载体、serde 反序列化为类型化结构，非法字段在装载时即被拒绝。
///
/// # 契约说明（What）
/// - 快照整体不可变；变更通过 [`ConfigHandle::install`] 整体替换；
/// - 所有字段都有保守默认值，空文件也能得到可运行的快照。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub vfs: VfsSettings,
    #[serde(default)]
    pub metadata: MetaSettings,
    #[serde(default)]
    pub import: ImportSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub repair: RepairSettings,
    #[serde(default)]
    pub library: LibrarySettings,
    /// 索引站（NZBLNK 解析用）；缺省关闭链接摄取。
    #[serde(default)]
    pub indexer: Option<IndexerSettings>,
}

impl ConfigSnapshot {
    /// 从 TOML 文本装载并校验快照。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let snapshot: Self = toml::from_str(text)
            .map_err(|err| CoreError::new(codes::CONFIG_INVALID, err.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// 校验跨字段约束；非法配置直接拒绝而不是运行期夹紧。
    pub fn validate(&self) -> Result<()> {
        if self.vfs.download_workers == 0 {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "vfs.download_workers must be at least 1",
            ));
        }
        if self.import.max_processor_workers == 0 {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "import.max_processor_workers must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.health.segment_sample_percentage) {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "health.segment_sample_percentage must be within 1..=100",
            ));
        }
        for provider in &self.providers {
            if provider.max_connections == 0 {
                return Err(CoreError::new(
                    codes::CONFIG_INVALID,
                    format!("provider {} has zero max_connections", provider.host),
                ));
            }
        }
        Ok(())
    }
}

/// NNTP 连接池参数。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// 空闲连接的最大存活秒数，超过即在清扫时关闭。
    pub max_idle_secs: u64,
    /// 连接的最大总寿命秒数，超过即在清扫时关闭。
    pub max_ttl_secs: u64,
    /// 清扫循环的间隔秒数。
    pub sweep_interval_secs: u64,
    /// 同一提供方上瞬态故障的重试上限。
    pub retry_limit: u32,
    /// 同一提供方重试前的固定退避毫秒数。
    pub retry_backoff_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_secs: 300,
            max_ttl_secs: 3_600,
            sweep_interval_secs: 30,
            retry_limit: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl PoolSettings {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// 虚拟文件系统读路径参数。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VfsSettings {
    /// 单次读请求的并发取段工作者数。
    pub download_workers: usize,
    /// 单次 `read_at` 允许返回的最大字节数。
    pub max_range_size: u64,
    /// 流式读（length = -1）单次让出的最大字节数。
    pub streaming_chunk_size: u64,
    /// 宽容模式：分段缺失时以零填充继续，而不是短读终止。默认严格。
    pub permissive_reads: bool,
    /// 单次读请求中环形缓冲允许驻留的解码字节预算。
    pub ring_budget_bytes: u64,
}

impl Default for VfsSettings {
    fn default() -> Self {
        Self {
            download_workers: 8,
            max_range_size: 32 * 1024 * 1024,
            streaming_chunk_size: 8 * 1024 * 1024,
            permissive_reads: false,
            ring_budget_bytes: 64 * 1024 * 1024,
        }
    }
}

/// 元数据存储参数。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetaSettings {
    /// 描述符树的根目录。
    pub root: PathBuf,
    /// 导入成功后 NZB 字节的托管目录。
    pub nzb_dir: PathBuf,
    /// 描述符 LRU 的条目容量。
    pub lru_capacity: usize,
    /// 导入探测期分段缓存的字节预算。
    pub segment_cache_bytes: u64,
}

impl Default for MetaSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./metadata"),
            nzb_dir: PathBuf::from("./nzbs"),
            lru_capacity: 1_024,
            segment_cache_bytes: 32 * 1024 * 1024,
        }
    }
}

/// 导入队列参数。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportSettings {
    /// 嵌入式数据库文件路径（队列与健康表共用）。
    pub db_path: PathBuf,
    /// 竞争 pending 行的工作者数量。
    pub max_processor_workers: usize,
    /// 瞬态失败的重试上限。
    pub max_retries: u32,
    /// 指数退避的基数秒（base * 2^retry_count）。
    pub retry_base_secs: u64,
    /// 工作者轮询 pending 行的间隔秒数。
    pub poll_interval_secs: u64,
    /// 监视目录：出现的 NZB 文件自动入队。缺省关闭。
    pub watch_dir: Option<PathBuf>,
    /// 监视目录扫描间隔秒数。
    pub watch_interval_secs: u64,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./altmount.db"),
            max_processor_workers: 2,
            max_retries: 3,
            retry_base_secs: 30,
            poll_interval_secs: 5,
            watch_dir: None,
            watch_interval_secs: 30,
        }
    }
}

impl ImportSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }
}

/// 健康调度参数。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    /// 总开关：关闭后调度循环空转。
    pub enabled: bool,
    /// 同时在途的健康检查上限。
    pub max_concurrent_jobs: usize,
    /// 每次检查抽样的分段百分比（1..=100，至少 1 段）。
    pub segment_sample_percentage: u8,
    /// 抽样探测允许占用的并发连接数。
    pub max_connections_for_health_checks: usize,
    /// 缺段重试上限（进入 repair_triggered 前）。
    pub max_retries: u32,
    /// 修复重试上限（进入 corrupted 前）。
    pub max_repair_retries: u32,
    /// 调度循环的 tick 间隔秒数。
    pub tick_interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_jobs: 4,
            segment_sample_percentage: 5,
            max_connections_for_health_checks: 4,
            max_retries: 3,
            max_repair_retries: 3,
            tick_interval_secs: 60,
        }
    }
}

impl HealthSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// 媒体管理实例的类别。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movies,
    Series,
}

/// 单个外部媒体管理实例。
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaInstance {
    pub kind: MediaKind,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// 修复分发参数。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepairSettings {
    pub instances: Vec<MediaInstance>,
}

/// 伴随库目录参数（符号链接 / .strm 视图）。
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibrarySettings {
    /// 库目录；缺省关闭库同步。
    pub dir: Option<PathBuf>,
    /// 库同步的间隔秒数。
    pub sync_interval_secs: u64,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            dir: None,
            sync_interval_secs: 900,
        }
    }
}

/// Newznab 风格索引站。
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexerSettings {
    pub base_url: String,
    pub api_key: String,
}

fn default_true() -> bool {
    true
}

/// 配置变更回调。回调在 `install` 的调用线程上同步执行，应保持轻量。
pub type ChangeCallback = Box<dyn Fn(&ConfigSnapshot) + Send + Sync + 'static>;

/// 配置句柄：原子快照 + 变更总线。
///
/// # 设计背景（Why）
/// - 外部配置装载器负责解析与热更新；核心只消费“当前快照”与“变更通知”两件事；
/// - `ArcSwap` 让读路径完全无锁，决策点的开销只是一次原子指针加载。
///
/// # 契约说明（What）
/// - `current()` 返回装载时刻的完整快照，组件不得缓存其中的派生值跨越快照边界；
/// - `install(next)` 原子替换快照并同步通知全部订阅者；
/// - 订阅回调不允许再调用 `install`（会死等写锁），需要级联变更时应投递到自身队列。
pub struct ConfigHandle {
    snapshot: ArcSwap<ConfigSnapshot>,
    subscribers: RwLock<Vec<ChangeCallback>>,
}

impl ConfigHandle {
    /// 以初始快照创建句柄。
    pub fn new(initial: ConfigSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(initial),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// 读取当前快照。
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// 原子替换快照并通知订阅者。
    pub fn install(&self, next: ConfigSnapshot) {
        let next = Arc::new(next);
        self.snapshot.store(Arc::clone(&next));
        for callback in self.subscribers.read().iter() {
            callback(&next);
        }
    }

    /// 注册变更回调。
    pub fn subscribe(&self, callback: impl Fn(&ConfigSnapshot) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_toml_yields_defaults() {
        let snapshot = ConfigSnapshot::from_toml_str("").expect("defaults");
        assert_eq!(snapshot.pool.retry_limit, 3);
        assert_eq!(snapshot.vfs.download_workers, 8);
        assert!(!snapshot.vfs.permissive_reads, "default must be strict");
        assert!(snapshot.health.enabled);
    }

    #[test]
    fn invalid_sample_percentage_is_rejected() {
        let err = ConfigSnapshot::from_toml_str("[health]\nsegment_sample_percentage = 0\n")
            .unwrap_err();
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ConfigSnapshot::from_toml_str("[vfs]\nbogus = 1\n").is_err());
    }

    #[test]
    fn install_notifies_subscribers_with_fresh_snapshot() {
        let handle = ConfigHandle::new(ConfigSnapshot::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = Arc::clone(&seen);
        handle.subscribe(move |snapshot| {
            seen_in_cb.store(snapshot.vfs.download_workers, Ordering::SeqCst);
        });

        let mut next = ConfigSnapshot::default();
        next.vfs.download_workers = 3;
        handle.install(next);

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(handle.current().vfs.download_workers, 3);
    }

    #[test]
    fn provider_table_parses() {
        let text = r#"
[[providers]]
host = "news.example.com"
port = 563
tls = true
username = "alice"
password = "s3cret"
max_connections = 20
"#;
        let snapshot = ConfigSnapshot::from_toml_str(text).expect("parse");
        assert_eq!(snapshot.providers.len(), 1);
        assert!(snapshot.providers[0].enabled);
    }
}
