use std::future::Future;
use std::time::{Duration, Instant};

use altmount_core::contract::{CallContext, Cancellation};
use altmount_core::error::{CoreError, Result, codes};
use tokio::time::Instant as TokioInstant;

/// 取消轮询间隔：毫秒级延迟换取不在每次 I/O 上挂额外任务。
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 在 `CallContext` 的取消与截止治理下运行一个 Future。
///
/// # 契约说明（What）
/// - 截止时间已过或取消标记已触发时立即返回对应错误，不再轮询 Future；
/// - Future 完成时原样返回其产物；
/// - 被取消或超时的 Future 直接丢弃；对连接上的半截 I/O 而言，调用方
///   必须随后关闭该连接而不是放回空闲集。
pub(crate) async fn run_with_context<F, T>(ctx: &CallContext, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    ctx.ensure_active(Instant::now())?;

    let cancel = wait_for_cancellation(ctx.cancellation());
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = ctx.deadline().instant() {
        let sleep = tokio::time::sleep_until(TokioInstant::from_std(deadline));
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(CoreError::new(codes::CANCELLED, "request cancelled")),
            _ = &mut sleep => Err(CoreError::new(
                codes::DEADLINE_EXCEEDED,
                "deadline exceeded before completion",
            )),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(CoreError::new(codes::CANCELLED, "request cancelled")),
            result = &mut future => result,
        }
    }
}

async fn wait_for_cancellation(cancellation: &Cancellation) {
    while !cancellation.is_cancelled() {
        tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_future_passes_through() {
        let ctx = CallContext::new();
        let out = run_with_context(&ctx, async { Ok::<_, CoreError>(7) }).await;
        assert_eq!(out.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_future() {
        let ctx = CallContext::new();
        let token = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = run_with_context(&ctx, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), codes::CANCELLED);
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_future() {
        let ctx = CallContext::new().with_timeout(Instant::now(), Duration::from_millis(20));
        let err = run_with_context(&ctx, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, CoreError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), codes::DEADLINE_EXCEEDED);
    }
}
