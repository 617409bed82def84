use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{ProviderConfig, ProviderId};

use crate::conn::NntpConnection;
use crate::util::run_with_context;

/// 空闲连接在被复用前需要活性探测的年龄阈值。
const PROBE_IDLE_AFTER: Duration = Duration::from_secs(60);

/// 每提供方的连接门：空闲集、并发上限与计数器。
///
/// # 设计背景（Why）
/// - 提供方是限速资源，`max_connections` 必须以信号量硬约束；
/// - 连接不变式（空闲/租借/排空/关闭四态）在此集中维护：池只负责选门，
///   门负责连接生命周期。
///
/// # 契约说明（What）
/// - `lease` 在信号量上等待（受 `ctx` 治理），随后借空闲或新建；
/// - `checkin(healthy=true)` 放回空闲集并刷新 `idle_since`；不健康或排空中
///   的连接直接销毁；
/// - `drain` 清空空闲集并拒绝后续归还；在途租借不受影响，结束即销毁。
pub(crate) struct ProviderGate {
    config: ProviderConfig,
    id: ProviderId,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<NntpConnection>>,
    draining: AtomicBool,
    opened: AtomicU64,
    closed: AtomicU64,
    borrows: AtomicU64,
    failures: AtomicU64,
}

/// 一次成功的租借：连接 + 并发许可。
pub(crate) struct Lease {
    pub(crate) conn: NntpConnection,
    _permit: OwnedSemaphorePermit,
}

impl ProviderGate {
    pub(crate) fn new(config: ProviderConfig) -> Arc<Self> {
        let id = config.id();
        let permits = config.max_connections.max(1);
        Arc::new(Self {
            config,
            id,
            semaphore: Arc::new(Semaphore::new(permits)),
            idle: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            borrows: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> &ProviderId {
        &self.id
    }

    pub(crate) fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub(crate) fn is_backup(&self) -> bool {
        self.config.backup
    }

    pub(crate) fn note_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 租借一条连接；并发许可与连接一起归属返回的 [`Lease`]。
    pub(crate) async fn lease(&self, ctx: &CallContext) -> Result<Lease> {
        let semaphore = Arc::clone(&self.semaphore);
        let permit = run_with_context(ctx, async move {
            semaphore
                .acquire_owned()
                .await
                .map_err(|_| CoreError::new(codes::POOL_CLOSED, "provider pool closed"))
        })
        .await?;
        self.borrows.fetch_add(1, Ordering::Relaxed);

        // 先吃空闲集；超龄的空闲连接复用前做一次 DATE 活性探测。
        loop {
            let candidate = self.idle.lock().pop_front();
            let Some(mut conn) = candidate else { break };
            if conn.idle_since.elapsed() < PROBE_IDLE_AFTER {
                return Ok(Lease {
                    conn,
                    _permit: permit,
                });
            }
            match run_with_context(ctx, conn.probe()).await {
                Ok(()) => {
                    return Ok(Lease {
                        conn,
                        _permit: permit,
                    });
                }
                Err(err) if err.is_cancelled() => {
                    self.note_closed(conn);
                    return Err(err);
                }
                Err(_) => {
                    debug!(provider = %self.id, "stale idle connection discarded");
                    self.note_closed(conn);
                }
            }
        }

        let conn = run_with_context(ctx, NntpConnection::connect(&self.config)).await?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Lease {
            conn,
            _permit: permit,
        })
    }

    /// 归还连接。`healthy = false` 或门在排空时直接销毁。
    pub(crate) fn checkin(&self, lease: Lease, healthy: bool) {
        let Lease { mut conn, _permit } = lease;
        if healthy && !self.draining.load(Ordering::Acquire) {
            conn.idle_since = Instant::now();
            self.idle.lock().push_back(conn);
        } else {
            self.note_closed(conn);
        }
        // 许可随 lease 析构释放。
    }

    /// 进入排空：清空空闲集，拒绝后续归还。
    pub(crate) fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        let drained: Vec<NntpConnection> = self.idle.lock().drain(..).collect();
        for conn in drained {
            self.note_closed(conn);
        }
    }

    /// 清扫：关闭超时空闲与超龄连接。
    pub(crate) fn sweep(&self, max_idle: Duration, max_ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<NntpConnection> = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut dropped = Vec::new();
            while let Some(conn) = idle.pop_front() {
                let too_idle = now.duration_since(conn.idle_since) > max_idle;
                let too_old = now.duration_since(conn.established_at) > max_ttl;
                if too_idle || too_old {
                    dropped.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            *idle = keep;
            dropped
        };
        for conn in expired {
            debug!(provider = %self.id, "sweeping expired connection");
            self.note_closed(conn);
        }
    }

    /// 把若干既有空闲连接移交给本门（配置热更新时保留健康连接）。
    pub(crate) fn adopt_idle(&self, connections: Vec<NntpConnection>) {
        let mut idle = self.idle.lock();
        for conn in connections {
            if idle.len() < self.config.max_connections {
                idle.push_back(conn);
            } else {
                drop(conn);
                self.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 取走全部空闲连接（移交给替代门）。
    pub(crate) fn take_idle(&self) -> Vec<NntpConnection> {
        self.idle.lock().drain(..).collect()
    }

    fn note_closed(&self, conn: NntpConnection) {
        drop(conn);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            id: self.id.clone(),
            host: self.config.host.clone(),
            idle: self.idle.lock().len(),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            borrows: self.borrows.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 计数器快照，供 `PoolStats` 聚合。
#[derive(Clone, Debug)]
pub(crate) struct GateSnapshot {
    pub id: ProviderId,
    pub host: String,
    pub idle: usize,
    pub opened: u64,
    pub closed: u64,
    pub borrows: u64,
    pub failures: u64,
}
