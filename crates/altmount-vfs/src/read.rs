use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, trace};

use altmount_core::contract::CallContext;
use altmount_core::error::{CoreError, Result};
use altmount_core::model::FileDescriptor;
use altmount_core::traits::ArticleSource;

use crate::plan::plan_range;

/// 缝合器等待环形缓冲时的轮询间隔，兼作取消响应的上限。
const STITCH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 一次区间取回的结果。
///
/// `bytes` 是已装配的前缀；`failure` 记录首个失败的分段序号与原因。
/// 严格模式下 `bytes` 止步于失败分段；宽容模式下失败分段以零填充，
/// `bytes` 仍然完整但 `failure` 保留以驱动降级。
pub(crate) struct FetchResult {
    pub bytes: Vec<u8>,
    pub failure: Option<(usize, CoreError)>,
}

/// 取回流水线的共享参数。
pub(crate) struct FetchParams {
    pub workers: usize,
    pub ring_budget_bytes: u64,
    pub permissive: bool,
}

enum SlotPayload {
    Decoded(Vec<u8>, #[allow(dead_code)] OwnedSemaphorePermit),
    Failed(CoreError),
}

/// 取回 `[start, start+len)` 的流字节（解码后的分段串接空间）。
///
/// # 执行逻辑（How）
/// 1. 规划器算出分段闭区间 `[lo, hi]` 并把序号灌入通道；
/// 2. `workers` 个取回任务竞争序号：先在字节预算信号量上占位，再经
///    报文来源取回解码载荷，结果放入按序号索引的环形缓冲并唤醒缝合器；
/// 3. 缝合器严格按序消费：裁掉首段的前导偏移、截断尾段，直至凑满 `len`
///    或遇到失败分段。
///
/// # 并发与取消（Guarantees）
/// - 在途解码字节总量 ≤ `ring_budget_bytes`（单段超预算时按预算封顶占位）；
/// - 取消经 `ctx` 传播到每个取回任务；缝合器以固定节拍复查取消位，
///   不会因为工作者全部退出而悬挂；
/// - 函数返回后中止位落下，尚未开工的序号不再被领取。
pub(crate) async fn fetch_stream_range(
    source: &Arc<dyn ArticleSource>,
    ctx: &CallContext,
    descriptor: &Arc<FileDescriptor>,
    start: u64,
    len: u64,
    params: &FetchParams,
) -> Result<FetchResult> {
    let Some(plan) = plan_range(&descriptor.segments, start, len) else {
        return Ok(FetchResult {
            bytes: Vec::new(),
            failure: None,
        });
    };

    let segment_count = plan.hi - plan.lo + 1;
    let workers = params.workers.clamp(1, segment_count);
    let budget = params
        .ring_budget_bytes
        .clamp(1, u64::from(u32::MAX)) as u32;

    let (idx_tx, idx_rx) = mpsc::channel::<usize>(segment_count);
    for idx in plan.lo..=plan.hi {
        // 容量恰好等于序号数，发送不会阻塞。
        idx_tx.send(idx).await.expect("index channel capacity");
    }
    drop(idx_tx);

    let idx_rx = Arc::new(tokio::sync::Mutex::new(idx_rx));
    let ring: Arc<Mutex<HashMap<usize, SlotPayload>>> = Arc::new(Mutex::new(HashMap::new()));
    let notify = Arc::new(Notify::new());
    let sem = Arc::new(Semaphore::new(budget as usize));
    let abort = Arc::new(AtomicBool::new(false));

    for worker in 0..workers {
        let idx_rx = Arc::clone(&idx_rx);
        let ring = Arc::clone(&ring);
        let notify = Arc::clone(&notify);
        let sem = Arc::clone(&sem);
        let abort = Arc::clone(&abort);
        let source = Arc::clone(source);
        let descriptor = Arc::clone(descriptor);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                if abort.load(Ordering::Acquire) {
                    return;
                }
                let next = { idx_rx.lock().await.recv().await };
                let Some(idx) = next else { return };
                let segment = &descriptor.segments[idx];

                let permits = segment.bytes.clamp(1, u64::from(budget)) as u32;
                let Ok(permit) = Arc::clone(&sem).acquire_many_owned(permits).await else {
                    return;
                };
                if abort.load(Ordering::Acquire) {
                    return;
                }

                let mut payload: Vec<u8> = Vec::with_capacity(segment.bytes as usize);
                let outcome = source
                    .body(&ctx, &segment.id, &segment.groups, &mut payload)
                    .await;
                let slot = match outcome {
                    Ok(_) => SlotPayload::Decoded(payload, permit),
                    Err(err) => {
                        trace!(worker, idx, error = %err, "segment fetch failed");
                        SlotPayload::Failed(err)
                    }
                };
                ring.lock().insert(idx, slot);
                // 中止后清掉自己刚放入的槽位；与收尾 drain 的先后可见性
                // 由环形缓冲的互斥锁保证。
                if abort.load(Ordering::Acquire) {
                    ring.lock().remove(&idx);
                    return;
                }
                notify.notify_waiters();
            }
        });
    }

    let result = stitch(ctx, descriptor, &plan, start, len, params, &ring, &notify).await;
    abort.store(true, Ordering::Release);
    ring.lock().clear();
    notify.notify_waiters();
    result
}

#[allow(clippy::too_many_arguments)]
async fn stitch(
    ctx: &CallContext,
    descriptor: &Arc<FileDescriptor>,
    plan: &crate::plan::RangePlan,
    start: u64,
    len: u64,
    params: &FetchParams,
    ring: &Arc<Mutex<HashMap<usize, SlotPayload>>>,
    notify: &Arc<Notify>,
) -> Result<FetchResult> {
    let mut assembled: Vec<u8> = Vec::with_capacity(len as usize);
    let mut failure: Option<(usize, CoreError)> = None;

    'segments: for idx in plan.lo..=plan.hi {
        let slot = loop {
            let notified = notify.notified();
            if let Some(slot) = ring.lock().remove(&idx) {
                break slot;
            }
            ctx.ensure_active(Instant::now())?;
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(STITCH_POLL_INTERVAL) => {}
            }
        };

        let declared = descriptor.segments[idx].bytes as usize;
        let mut payload = match slot {
            SlotPayload::Decoded(mut payload, _permit) => {
                if payload.len() > declared {
                    // yEnc 填充允许末段超出声明，裁到声明大小。
                    payload.truncate(declared);
                }
                if payload.len() < declared {
                    debug!(idx, declared, actual = payload.len(), "segment shorter than declared");
                    if params.permissive {
                        failure.get_or_insert_with(|| {
                            (idx, short_segment_error(idx, declared, payload.len()))
                        });
                        payload.resize(declared, 0);
                    } else {
                        failure = Some((idx, short_segment_error(idx, declared, payload.len())));
                        break 'segments;
                    }
                }
                payload
            }
            SlotPayload::Failed(err) => {
                if err.is_cancelled() {
                    return Err(err);
                }
                if params.permissive {
                    failure.get_or_insert((idx, err));
                    vec![0u8; declared]
                } else {
                    failure = Some((idx, err));
                    break 'segments;
                }
            }
        };

        // 首段裁掉 start 之前的前缀。
        if idx == plan.lo {
            let skip = (start - plan.segment_start(idx)) as usize;
            if skip >= payload.len() {
                payload.clear();
            } else {
                payload.drain(..skip);
            }
        }
        let remaining = len as usize - assembled.len();
        if payload.len() > remaining {
            payload.truncate(remaining);
        }
        assembled.extend_from_slice(&payload);
        if assembled.len() >= len as usize {
            break;
        }
    }

    Ok(FetchResult {
        bytes: assembled,
        failure,
    })
}

fn short_segment_error(idx: usize, declared: usize, actual: usize) -> CoreError {
    CoreError::new(
        altmount_core::error::codes::SHORT_READ,
        format!("segment {idx} delivered {actual} of {declared} declared bytes"),
    )
}
