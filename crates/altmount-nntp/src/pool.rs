use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use altmount_core::configuration::ConfigHandle;
use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result, codes};
use altmount_core::model::{ProviderConfig, ProviderId};
use altmount_core::traits::{ArticleSource, BodySink};

use crate::provider::ProviderGate;
use crate::util::run_with_context;

/// 多提供方 NNTP 连接池。
///
/// # 设计背景（Why）
/// - 单提供方的缺文率与瞬态故障率都不可忽视；把“同提供方有限重试、跨提供方
///   按序滚动、备援断后”的策略收敛在池内，调用方只面对最终结果；
/// - 提供方集合随配置原子替换：身份未变的门整体保留（连同健康连接与计数器），
///   被移除的门立即排空。
///
/// # 契约说明（What）
/// - [`body`](Self::body)/[`stat`](Self::stat) 见 [`ArticleSource`] 的契约；
/// - [`set_providers`](Self::set_providers) 原子替换提供方集合；
/// - [`close`](Self::close) 幂等，排空全部连接并让后续租借以
///   `nntp.pool_closed` 失败。
///
/// # 并发与顺序（Guarantees）
/// - 请求之间无全局顺序；单次请求的解码输出按线序交付；
/// - 每条在途正文恰好占用一个连接许可，错误路径上连接显式关闭；
/// - 单篇正文的输出在尝试缓冲内聚齐、成功后一次性交付 sink，跨提供方
///   重试不会向调用方漏出半截载荷。
pub struct NntpPool {
    config: Arc<ConfigHandle>,
    gates: ArcSwap<Vec<Arc<ProviderGate>>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// 单次提供方尝试的处置结论。
enum Disposition {
    /// 对整个请求终局（取消/截止）。
    RequestFinal,
    /// 对该提供方终局（430、凭据被拒、解码失败），滚动到下一提供方。
    ProviderFinal,
    /// 瞬态：关连接、退避、同提供方重试。
    Transient,
}

fn classify(err: &CoreError) -> Disposition {
    if err.is_cancelled() || err.code() == codes::DEADLINE_EXCEEDED {
        Disposition::RequestFinal
    } else if matches!(
        err.code(),
        codes::ARTICLE_NOT_FOUND | codes::AUTH_FAILED | codes::DECODE_FAILED
    ) {
        Disposition::ProviderFinal
    } else {
        Disposition::Transient
    }
}

impl NntpPool {
    /// 以配置句柄构造连接池并启动后台清扫。必须在 Tokio 运行时内调用。
    pub fn new(config: Arc<ConfigHandle>) -> Arc<Self> {
        let initial = build_gates(&config.current().providers, &[]);
        let pool = Arc::new(Self {
            config,
            gates: ArcSwap::from_pointee(initial),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&pool)));
        *pool.sweeper.lock() = Some(sweeper);
        pool
    }

    /// 原子替换提供方集合。
    ///
    /// 身份（`host:port@username`）与连接语义字段都未变的提供方保留原门；
    /// 仅连接数等外围字段变化的提供方换门并移交空闲连接；其余重建。
    /// 被移除的门立即排空：在途租借完成后连接即销毁。
    pub fn set_providers(&self, providers: Vec<ProviderConfig>) {
        let previous = self.gates.load_full();
        let next = Arc::new(build_gates(&providers, &previous));
        self.gates.store(Arc::clone(&next));

        for old in previous.iter() {
            if !next.iter().any(|gate| Arc::ptr_eq(gate, old)) {
                debug!(provider = %old.id(), "draining replaced provider");
                old.drain();
            }
        }
        info!(providers = next.len(), "provider set replaced");
    }

    /// 取回一篇报文的解码正文，按序写入 `sink`，返回载荷字节数。
    pub async fn body(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
        sink: &mut dyn BodySink,
    ) -> Result<u64> {
        self.ensure_open()?;
        let gates = self.ordered_gates();
        if gates.is_empty() {
            return Err(no_providers(article));
        }

        let mut last_error: Option<CoreError> = None;
        for gate in gates {
            match self.body_on_provider(&gate, ctx, article, groups).await {
                Ok((payload, _summary)) => {
                    let written = payload.len() as u64;
                    sink.write(&payload)?;
                    return Ok(written);
                }
                Err(err) => match classify(&err) {
                    Disposition::RequestFinal => return Err(err),
                    _ => {
                        gate.note_failure();
                        debug!(provider = %gate.id(), article, error = %err, "provider attempt failed");
                        last_error = Some(err);
                    }
                },
            }
        }

        let exhausted = no_providers(article);
        Err(match last_error {
            Some(cause) => exhausted.with_cause(cause),
            None => exhausted,
        })
    }

    /// 探测报文可用性：`Ok(false)` 表示至少一个提供方明确答复缺失且无人在库。
    pub async fn stat(&self, ctx: &CallContext, article: &str, groups: &[String]) -> Result<bool> {
        self.ensure_open()?;
        let gates = self.ordered_gates();
        if gates.is_empty() {
            return Err(no_providers(article));
        }

        let mut last_error: Option<CoreError> = None;
        let mut any_answered = false;
        for gate in gates {
            match self.stat_on_provider(&gate, ctx, article, groups).await {
                Ok(true) => return Ok(true),
                Ok(false) => any_answered = true,
                Err(err) => match classify(&err) {
                    Disposition::RequestFinal => return Err(err),
                    _ => {
                        gate.note_failure();
                        last_error = Some(err);
                    }
                },
            }
        }

        if any_answered {
            return Ok(false);
        }
        let exhausted = no_providers(article);
        Err(match last_error {
            Some(cause) => exhausted.with_cause(cause),
            None => exhausted,
        })
    }

    /// 取回编码头摘要：载荷在本层丢弃，只返回 `=ybegin` 声明的元信息。
    pub async fn probe(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
    ) -> Result<altmount_core::traits::ArticleProbe> {
        self.ensure_open()?;
        let gates = self.ordered_gates();
        if gates.is_empty() {
            return Err(no_providers(article));
        }

        let mut last_error: Option<CoreError> = None;
        for gate in gates {
            match self.body_on_provider(&gate, ctx, article, groups).await {
                Ok((payload, summary)) => {
                    return Ok(altmount_core::traits::ArticleProbe {
                        name: summary.name,
                        declared_part_size: summary.declared_part_size,
                        declared_total_size: summary.declared_total_size,
                        payload_len: payload.len() as u64,
                    });
                }
                Err(err) => match classify(&err) {
                    Disposition::RequestFinal => return Err(err),
                    _ => {
                        gate.note_failure();
                        last_error = Some(err);
                    }
                },
            }
        }
        let exhausted = no_providers(article);
        Err(match last_error {
            Some(cause) => exhausted.with_cause(cause),
            None => exhausted,
        })
    }

    /// 在单个提供方上取正文：瞬态故障关连接、退避、重试至上限。
    ///
    /// # 执行逻辑（How）
    /// 1. 租借连接（信号量等待受 `ctx` 治理）；
    /// 2. 惰性组选择后发 `BODY`，解码输出聚到本次尝试的缓冲；
    /// 3. 成功 → 连接回空闲集；430 → 连接健康但对本提供方终局；
    ///    凭据被拒/解码失败/取消 → 关闭连接并上抛；瞬态 → 关闭连接、
    ///    固定短退避后重试。
    async fn body_on_provider(
        &self,
        gate: &Arc<ProviderGate>,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
    ) -> Result<(Vec<u8>, altmount_yenc::DecodeSummary)> {
        let settings = self.config.current().pool.clone();
        let mut last_error: Option<CoreError> = None;

        for attempt in 0..=settings.retry_limit {
            ctx.ensure_active(Instant::now())?;
            let mut lease = gate.lease(ctx).await?;
            let outcome = run_with_context(ctx, async {
                lease.conn.select_group(groups).await?;
                let mut payload: Vec<u8> = Vec::new();
                let summary = lease.conn.body_into(article, &mut payload).await?;
                Ok((payload, summary))
            })
            .await;

            match outcome {
                Ok(payload) => {
                    gate.checkin(lease, true);
                    return Ok(payload);
                }
                Err(err) => {
                    // 430 走健康回收，其余一律关闭连接。
                    let healthy = err.code() == codes::ARTICLE_NOT_FOUND;
                    gate.checkin(lease, healthy);
                    match classify(&err) {
                        Disposition::Transient => {
                            warn!(
                                provider = %gate.id(),
                                attempt,
                                error = %err,
                                "transient failure, backing off"
                            );
                            last_error = Some(err);
                            if attempt < settings.retry_limit {
                                tokio::time::sleep(settings.retry_backoff()).await;
                            }
                        }
                        _ => return Err(err),
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::new(codes::TRANSIENT, "provider retries exhausted")))
    }

    /// 在单个提供方上探活；重试策略与取正文一致。
    async fn stat_on_provider(
        &self,
        gate: &Arc<ProviderGate>,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
    ) -> Result<bool> {
        let settings = self.config.current().pool.clone();
        let mut last_error: Option<CoreError> = None;

        for attempt in 0..=settings.retry_limit {
            ctx.ensure_active(Instant::now())?;
            let mut lease = gate.lease(ctx).await?;
            let outcome = run_with_context(ctx, async {
                lease.conn.select_group(groups).await?;
                lease.conn.stat(article).await
            })
            .await;

            match outcome {
                Ok(found) => {
                    gate.checkin(lease, true);
                    return Ok(found);
                }
                Err(err) => {
                    gate.checkin(lease, false);
                    match classify(&err) {
                        Disposition::Transient => {
                            last_error = Some(err);
                            if attempt < settings.retry_limit {
                                tokio::time::sleep(settings.retry_backoff()).await;
                            }
                        }
                        _ => return Err(err),
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::new(codes::TRANSIENT, "provider retries exhausted")))
    }

    /// 池级统计快照。
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            providers: self
                .gates
                .load()
                .iter()
                .map(|gate| {
                    let snapshot = gate.snapshot();
                    ProviderStats {
                        id: snapshot.id,
                        host: snapshot.host,
                        idle_connections: snapshot.idle,
                        opened: snapshot.opened,
                        closed: snapshot.closed,
                        borrows: snapshot.borrows,
                        failures: snapshot.failures,
                    }
                })
                .collect(),
        }
    }

    /// 关闭连接池：幂等；排空全部门并停止清扫。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for gate in self.gates.load().iter() {
            gate.drain();
        }
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        info!("nntp pool closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::new(codes::POOL_CLOSED, "pool already closed"))
        } else {
            Ok(())
        }
    }

    /// 主提供方在前、备援断后的调度顺序。
    fn ordered_gates(&self) -> Vec<Arc<ProviderGate>> {
        let gates = self.gates.load_full();
        let mut ordered: Vec<Arc<ProviderGate>> = Vec::with_capacity(gates.len());
        ordered.extend(gates.iter().filter(|g| !g.is_backup()).cloned());
        ordered.extend(gates.iter().filter(|g| g.is_backup()).cloned());
        ordered
    }
}

#[async_trait]
impl ArticleSource for NntpPool {
    async fn body(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
        sink: &mut dyn BodySink,
    ) -> Result<u64> {
        NntpPool::body(self, ctx, article, groups, sink).await
    }

    async fn stat(&self, ctx: &CallContext, article: &str, groups: &[String]) -> Result<bool> {
        NntpPool::stat(self, ctx, article, groups).await
    }

    async fn probe(
        &self,
        ctx: &CallContext,
        article: &str,
        groups: &[String],
    ) -> Result<altmount_core::traits::ArticleProbe> {
        NntpPool::probe(self, ctx, article, groups).await
    }
}

impl Drop for NntpPool {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

/// 构建门列表；身份匹配的老门按策略保留或移交连接。禁用的提供方不建门。
fn build_gates(
    providers: &[ProviderConfig],
    previous: &[Arc<ProviderGate>],
) -> Vec<Arc<ProviderGate>> {
    let mut gates = Vec::new();
    for config in providers.iter().filter(|p| p.enabled) {
        let id = config.id();
        let existing = previous.iter().find(|gate| *gate.id() == id);
        match existing {
            Some(old) if same_connection_semantics(old.config(), config) => {
                gates.push(Arc::clone(old));
            }
            Some(old) => {
                // 身份相同但外围字段变化：换门；传输语义未变时移交空闲连接。
                let gate = ProviderGate::new(config.clone());
                let transport_unchanged = config.tls == old.config().tls
                    && config.insecure_tls == old.config().insecure_tls
                    && config.password == old.config().password;
                if transport_unchanged {
                    gate.adopt_idle(old.take_idle());
                }
                old.drain();
                gates.push(gate);
            }
            None => gates.push(ProviderGate::new(config.clone())),
        }
    }
    gates
}

/// 两份配置对既有连接是否语义等价（身份字段已由调用方保证相同）。
fn same_connection_semantics(a: &ProviderConfig, b: &ProviderConfig) -> bool {
    a.tls == b.tls
        && a.insecure_tls == b.insecure_tls
        && a.password == b.password
        && a.max_connections == b.max_connections
        && a.backup == b.backup
}

fn no_providers(article: &str) -> CoreError {
    CoreError::new(
        codes::PROVIDER_EXHAUSTED,
        format!("article <{article}> unavailable on all providers"),
    )
}

/// 后台清扫循环：按快照间隔关闭超时空闲与超龄连接。
async fn sweep_loop(pool: std::sync::Weak<NntpPool>) {
    loop {
        let interval = {
            let Some(strong) = pool.upgrade() else { return };
            if strong.closed.load(Ordering::Acquire) {
                return;
            }
            let settings = strong.config.current().pool.clone();
            for gate in strong.gates.load().iter() {
                gate.sweep(settings.max_idle(), settings.max_ttl());
            }
            settings.sweep_interval()
        };
        tokio::time::sleep(interval).await;
    }
}

/// 池级统计。
#[derive(Clone, Debug)]
pub struct PoolStats {
    pub providers: Vec<ProviderStats>,
}

/// 单提供方统计。
#[derive(Clone, Debug)]
pub struct ProviderStats {
    pub id: ProviderId,
    pub host: String,
    pub idle_connections: usize,
    pub opened: u64,
    pub closed: u64,
    pub borrows: u64,
    pub failures: u64,
}
