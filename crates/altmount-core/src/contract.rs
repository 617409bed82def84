use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::{CoreError, Result, codes};

/// 取消原语，统一表达跨子系统的可中断性契约。
///
/// # 设计背景（Why）
/// - 读请求、健康检查与导入任务都可能长时间占用连接或工作者，必须能被外部主动打断；
/// - 用轻量原子位表达取消状态，避免绑定具体运行时的取消机制。
///
/// # 契约说明（What）
/// - **前置条件**：构造后默认处于“未取消”状态；
/// - **后置条件**：`cancel` 一旦成功，`is_cancelled` 全局可见，派生出的任务应尽快
///   终止或回滚；`cancel` 仅在首次触发时返回 `true`，便于避免重复执行兜底逻辑。
///
/// # 设计取舍（Trade-offs）
/// - 未提供回调注册接口；关键热路径需自行轮询 `is_cancelled`，框架不会强制终止
///   正在执行的 Future。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 将令牌标记为取消；首次触发返回 `true`。
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 截止原语，描述操作的最迟完成时间点。
///
/// # 契约说明（What）
/// - 可以为空（未设置），代表调用方未施加硬超时；
/// - `is_expired` 基于调用时提供的当前时间判断，调用方需保证 `now` 来自同一单调时钟；
/// - 截止到期不会自动驱动取消，需由调用方结合 [`Cancellation`] 落地。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 基于当前时间点加持续时间生成截止时间。
    pub fn with_timeout(now: Instant, timeout: Duration) -> Self {
        Self::at(now.checked_add(timeout).unwrap_or(now))
    }

    /// 返回内部时间点，便于与自定义调度器协作。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.instant {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// 距离截止还剩多久；未设置截止时返回 `None`，已超时返回零时长。
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::none()
    }
}

/// 调用上下文：取消令牌与截止时间的组合，从请求边界一路传递到连接与解码层。
///
/// # 设计背景（Why）
/// - 虚拟文件系统 → 解码器 → 连接池的调用链必须共享同一份可中断语义，
///   否则取消只会停在发起层，租借中的连接与在途解码缓冲无法及时释放；
/// - 聚合为单一参数可避免每个接口罗列 `cancellation, deadline` 两个形参。
///
/// # 契约说明（What）
/// - `ensure_active(now)` 是热路径上的统一检查点：已取消映射为 `core.cancelled`，
///   截止到期映射为 `core.deadline_exceeded`；
/// - 派生子上下文共享取消位，父级取消对所有子级立即可见。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    /// 创建不带截止时间的根上下文。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以现有取消令牌与截止时间组装上下文。
    pub fn with_parts(cancellation: Cancellation, deadline: Deadline) -> Self {
        Self {
            cancellation,
            deadline,
        }
    }

    /// 基于当前时间点附加超时，返回共享同一取消位的新上下文。
    pub fn with_timeout(&self, now: Instant, timeout: Duration) -> Self {
        Self {
            cancellation: self.cancellation.child(),
            deadline: Deadline::with_timeout(now, timeout),
        }
    }

    /// 读取取消令牌。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 读取截止时间。
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 查询是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 热路径检查点：未取消且未超时返回 `Ok(())`，否则给出对应错误码。
    pub fn ensure_active(&self, now: Instant) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(CoreError::new(codes::CANCELLED, "request cancelled"));
        }
        if self.deadline.is_expired(now) {
            return Err(CoreError::new(
                codes::DEADLINE_EXCEEDED,
                "deadline exceeded before completion",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_first_trigger_only() {
        let token = Cancellation::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_shares_the_same_flag() {
        let parent = Cancellation::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn deadline_expiry_and_remaining() {
        let now = Instant::now();
        let deadline = Deadline::with_timeout(now, Duration::from_secs(5));
        assert!(!deadline.is_expired(now));
        assert!(deadline.is_expired(now + Duration::from_secs(5)));
        assert_eq!(
            deadline.remaining(now + Duration::from_secs(6)),
            Some(Duration::ZERO)
        );
        assert_eq!(Deadline::none().remaining(now), None);
    }

    #[test]
    fn ensure_active_maps_to_stable_codes() {
        let now = Instant::now();
        let ctx = CallContext::new();
        assert!(ctx.ensure_active(now).is_ok());

        let timed = ctx.with_timeout(now, Duration::from_millis(1));
        let err = timed
            .ensure_active(now + Duration::from_millis(2))
            .unwrap_err();
        assert_eq!(err.code(), codes::DEADLINE_EXCEEDED);

        ctx.cancellation().cancel();
        let err = timed.ensure_active(now).unwrap_err();
        assert_eq!(err.code(), codes::CANCELLED);
    }
}
