use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// `Sleep` 为时钟接口返回的统一延迟 Future 类型。
///
/// # 契约说明（What）
/// - Future 完成时表示指定的持续时间已经过去；
/// - 必须实现 `Send + 'static` 以适配多线程调度与跨任务存活；
/// - 返回 `Poll::Pending` 后，状态变化时必须唤醒登记的 waker。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 抽象可注入的时钟，统一“获取当前时间”与“等待指定时间”能力。
///
/// # 设计背景（Why）
/// - 健康调度、导入退避与连接清扫都依赖时间来源；直接调用系统时钟会让
///   分层策略（年龄分档、指数退避）在测试中无法复现；
/// - 通过 trait 注入时钟，生产环境使用真实时间，测试注入可控的虚拟时间。
///
/// # 接口约束（What）
/// - `now`：返回当前的单调时间点，必须单调递增；
/// - `unix_now`：返回当前的壁钟秒（Unix epoch），供持久化字段
///   （`created_at`、`scheduled_check_at` 等）使用；
/// - `sleep`：返回在给定持续时间后完成的 Future，完成前至少等待所给时长。
///
/// # 使用指引（How）
/// - 推荐以 `Arc<dyn Clock>` 传递给需要时间能力的组件；
/// - 测试场景注入 [`MockClock`] 并调用 `advance` 推进时间。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回当前壁钟时间的 Unix 秒。
    fn unix_now(&self) -> i64;

    /// 返回一个在指定持续时间后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 基于标准库线程实现的系统时钟。
///
/// # 设计动机（Why）
/// - 不强依赖具体异步运行时，任何执行器下都可使用；
/// - 通过后台线程的阻塞睡眠唤醒 Future，满足“等待后唤醒”的最小契约。
#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(ThreadSleep::new(duration))
    }
}

/// 线程驱动的睡眠 Future，实现最小可行的“等待后唤醒”契约。
struct ThreadSleep {
    duration: Duration,
    started: bool,
    done: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl ThreadSleep {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: false,
            done: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Mutex::new(None)),
        }
    }
}

impl Future for ThreadSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *self.waker.lock().expect("sleep waker lock") = Some(cx.waker().clone());
        // 二次检查：后台线程可能在登记 waker 之前就已完成。
        if self.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if !self.started {
            self.started = true;
            if self.duration.is_zero() {
                self.done.store(true, Ordering::Release);
                return Poll::Ready(());
            }
            let done = Arc::clone(&self.done);
            let waker = Arc::clone(&self.waker);
            let duration = self.duration;
            thread::spawn(move || {
                thread::sleep(duration);
                done.store(true, Ordering::Release);
                if let Some(waker) = waker.lock().expect("sleep waker lock").take() {
                    waker.wake();
                }
            });
        }
        Poll::Pending
    }
}

/// 测试用虚拟时钟：时间只有在显式 `advance` 时才前进。
///
/// # 契约说明（What）
/// - `advance` 同步推进单调时间与壁钟秒，并唤醒所有到期的睡眠 Future；
/// - `set_unix` 仅调整壁钟（用于构造“历史发布日期”类场景），不影响单调时间；
/// - 同一实例可被多处 `Arc` 共享，内部用互斥锁保证推进的原子性。
pub struct MockClock {
    state: Mutex<MockState>,
}

struct MockState {
    now: Instant,
    unix: i64,
    sleepers: Vec<MockSleeper>,
}

struct MockSleeper {
    wake_at: Instant,
    done: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl MockClock {
    /// 以当前真实时间为原点创建虚拟时钟。
    pub fn new() -> Self {
        Self::starting_at(Instant::now(), 1_700_000_000)
    }

    /// 指定单调原点与壁钟秒创建虚拟时钟。
    pub fn starting_at(origin: Instant, unix: i64) -> Self {
        Self {
            state: Mutex::new(MockState {
                now: origin,
                unix,
                sleepers: Vec::new(),
            }),
        }
    }

    /// 推进虚拟时间并唤醒所有到期的睡眠者。
    pub fn advance(&self, delta: Duration) {
        let woken: Vec<MockSleeper> = {
            let mut state = self.state.lock().expect("mock clock lock");
            state.now += delta;
            state.unix += delta.as_secs() as i64;
            let now = state.now;
            let (due, rest) = state
                .sleepers
                .drain(..)
                .partition(|sleeper| sleeper.wake_at <= now);
            state.sleepers = rest;
            due
        };
        for sleeper in woken {
            sleeper.done.store(true, Ordering::Release);
            if let Some(waker) = sleeper.waker.lock().expect("mock waker lock").take() {
                waker.wake();
            }
        }
    }

    /// 直接设置壁钟秒，不触碰单调时间与睡眠者。
    pub fn set_unix(&self, unix: i64) {
        self.state.lock().expect("mock clock lock").unix = unix;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.state.lock().expect("mock clock lock").now
    }

    fn unix_now(&self) -> i64 {
        self.state.lock().expect("mock clock lock").unix
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let done = Arc::new(AtomicBool::new(false));
        let waker: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
        {
            let mut state = self.state.lock().expect("mock clock lock");
            let wake_at = state.now + duration;
            if duration.is_zero() {
                done.store(true, Ordering::Release);
            } else {
                state.sleepers.push(MockSleeper {
                    wake_at,
                    done: Arc::clone(&done),
                    waker: Arc::clone(&waker),
                });
            }
        }
        Box::pin(MockSleepFuture { done, waker })
    }
}

struct MockSleepFuture {
    done: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl Future for MockSleepFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            *self.waker.lock().expect("mock waker lock") = Some(cx.waker().clone());
            // 二次检查：advance 可能发生在登记 waker 之前。
            if self.done.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test]
    async fn mock_sleep_completes_only_after_advance() {
        let clock = Arc::new(MockClock::new());
        let mut sleep = clock.sleep(Duration::from_secs(10));

        let pending = poll_fn(|cx| Poll::Ready(sleep.as_mut().poll(cx).is_pending())).await;
        assert!(pending);

        clock.advance(Duration::from_secs(10));
        sleep.await;
    }

    #[test]
    fn advance_moves_both_time_sources() {
        let clock = MockClock::starting_at(Instant::now(), 1_000);
        let before = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.unix_now(), 1_090);
        assert_eq!(clock.now().duration_since(before), Duration::from_secs(90));
    }

    #[test]
    fn set_unix_does_not_touch_monotonic_time() {
        let clock = MockClock::starting_at(Instant::now(), 1_000);
        let before = clock.now();
        clock.set_unix(42);
        assert_eq!(clock.unix_now(), 42);
        assert_eq!(clock.now(), before);
    }
}
