//! 响应 Future：把传输层的异步完成桥接给同步阻塞与异步等待两类调用方。

mod latch;

pub use latch::{CompletionLatch, LatchState};

use std::{
    fmt,
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{AppError, CallError, RpcError},
    response::Outcome,
};

/// 终态监听器。
pub type Listener = Box<dyn FnOnce(&Outcome) + Send + 'static>;

enum Waiter {
    Listener(Listener),
    Task(Waker),
}

/// `ResponseFuture` 表示一次已分发调用的最终结果，可在任意线程间共享。
///
/// # 设计背景（Why）
/// - 请求由调用线程分发，响应由传输层 I/O 线程送达，超时由看门狗线程裁决；
///   三方只通过本类型交互，因此“谁完成这次调用”必须有唯一答案；
/// - 同一类型同时服务阻塞式 `get` 与 `.await`，避免在框架内部维护两套 Future。
///
/// # 逻辑解析（How）
/// - [`CompletionLatch`] 的比较交换决定唯一完成者；胜出者写入 `OnceLock` 后发布终态；
/// - 监听器列表与条件变量共用一把互斥锁，完成者在锁内取走列表并唤醒阻塞者，
///   释放锁之后才执行监听器，监听器内部再次读取本 Future 不会死锁；
/// - 注册监听器时若已处于终态，则在注册线程上立即执行，不会丢失。
///
/// # 契约说明（What）
/// - `complete*` 系列仅对第一次调用返回 `true`，之后的调用不改变已观察到的结果；
/// - [`get`](Self::get) 在截止时间到达时自身也会尝试以超时终态完成 Future，
///   与真实响应竞争同一个闩，胜者对所有观察者生效；
/// - 克隆共享同一内部状态。
#[derive(Clone)]
pub struct ResponseFuture {
    inner: Arc<Inner>,
}

struct Inner {
    latch: CompletionLatch,
    outcome: OnceLock<Outcome>,
    waiters: Mutex<Vec<Waiter>>,
    ready: Condvar,
    created_at: Instant,
    budget: Duration,
}

impl ResponseFuture {
    /// 创建处于 Pending 状态的 Future，`budget` 为 [`wait`](Self::wait) 使用的默认超时。
    pub fn new(budget: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                latch: CompletionLatch::new(),
                outcome: OnceLock::new(),
                waiters: Mutex::new(Vec::new()),
                ready: Condvar::new(),
                created_at: Instant::now(),
                budget,
            }),
        }
    }

    /// 创建已处于终态的 Future。
    pub fn completed(outcome: Outcome) -> Self {
        let future = Self::new(Duration::ZERO);
        future.complete_with(outcome);
        future
    }

    /// 以业务返回值完成。
    pub fn complete(&self, value: serde_json::Value) -> bool {
        self.complete_with(Outcome::Value(value))
    }

    /// 以业务异常完成。
    pub fn complete_with_application_error(&self, err: AppError) -> bool {
        self.complete_with(Outcome::AppError(err))
    }

    /// 以框架错误完成。
    pub fn complete_with_framework_error(&self, err: RpcError) -> bool {
        self.complete_with(Outcome::Framework(err))
    }

    /// 尝试写入终态；仅第一个调用者返回 `true`，其余调用被丢弃。
    pub fn complete_with(&self, outcome: Outcome) -> bool {
        if !self.inner.latch.try_acquire() {
            tracing::trace!(
                outcome = outcome.label(),
                "response future already settled; completion ignored"
            );
            return false;
        }
        let succeeded = outcome.is_success();
        let _ = self.inner.outcome.set(outcome);
        self.inner.latch.publish(succeeded);

        let waiters = {
            let mut guard = self.inner.waiters.lock();
            let waiters = mem::take(&mut *guard);
            self.inner.ready.notify_all();
            waiters
        };
        if let Some(outcome) = self.inner.outcome.get() {
            for waiter in waiters {
                run_waiter(waiter, outcome);
            }
        }
        true
    }

    /// 注册终态监听器；已完成时在当前线程立即执行。
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        {
            let mut guard = self.inner.waiters.lock();
            if !self.inner.latch.is_terminal() {
                guard.push(Waiter::Listener(Box::new(listener)));
                return;
            }
        }
        if let Some(outcome) = self.inner.outcome.get() {
            run_waiter(Waiter::Listener(Box::new(listener)), outcome);
        }
    }

    /// 阻塞等待终态，最长 `timeout`。
    ///
    /// 截止时间到达仍未完成时，以 `RpcErrorKind::Timeout` 尝试完成本 Future，
    /// 然后返回胜出的终态：若真实响应恰好抢先一步，调用方拿到的是真实响应。
    pub fn get(&self, timeout: Duration) -> Result<serde_json::Value, CallError> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        {
            let mut guard = self.inner.waiters.lock();
            while !self.inner.latch.is_terminal() {
                if self.inner.ready.wait_until(&mut guard, deadline).timed_out() {
                    break;
                }
            }
        }

        if !self.inner.latch.is_terminal() {
            let elapsed = self.inner.created_at.elapsed();
            if self.complete_with_framework_error(RpcError::timeout(elapsed, timeout)) {
                tracing::debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = timeout.as_millis() as u64,
                    "response future timed out"
                );
            }
            self.wait_settled();
        }
        self.settled_outcome().into_result()
    }

    /// 以创建时给定的预算阻塞等待。
    pub fn wait(&self) -> Result<serde_json::Value, CallError> {
        self.get(self.inner.budget)
    }

    pub fn is_done(&self) -> bool {
        self.inner.latch.is_terminal()
    }

    pub fn state(&self) -> LatchState {
        self.inner.latch.state()
    }

    /// 非阻塞读取终态。
    pub fn try_outcome(&self) -> Option<Outcome> {
        if self.inner.latch.is_terminal() {
            self.inner.outcome.get().cloned()
        } else {
            None
        }
    }

    /// 自创建（即分发）以来的耗时。
    pub fn elapsed(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.inner.budget
    }

    fn wait_settled(&self) {
        let mut guard = self.inner.waiters.lock();
        while !self.inner.latch.is_terminal() {
            self.inner.ready.wait(&mut guard);
        }
    }

    fn settled_outcome(&self) -> Outcome {
        self.inner.outcome.get().cloned().unwrap_or_else(|| {
            Outcome::Framework(RpcError::shutdown("response future settled without outcome"))
        })
    }
}

impl Future for ResponseFuture {
    type Output = Result<serde_json::Value, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.try_outcome() {
            return Poll::Ready(outcome.into_result());
        }
        {
            let mut guard = self.inner.waiters.lock();
            if !self.inner.latch.is_terminal() {
                let registered = guard.iter().any(|waiter| {
                    matches!(waiter, Waiter::Task(existing) if existing.will_wake(cx.waker()))
                });
                if !registered {
                    guard.push(Waiter::Task(cx.waker().clone()));
                }
                return Poll::Pending;
            }
        }
        Poll::Ready(self.settled_outcome().into_result())
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("state", &self.state())
            .field("budget", &self.inner.budget)
            .finish()
    }
}

fn run_waiter(waiter: Waiter, outcome: &Outcome) {
    match waiter {
        Waiter::Task(waker) => waker.wake(),
        Waiter::Listener(listener) => {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(outcome))).is_err() {
                tracing::error!(
                    outcome = outcome.label(),
                    "response listener panicked; remaining listeners still run"
                );
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::error::RpcErrorKind;
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    #[test]
    fn first_completion_wins_and_later_ones_are_ignored() {
        let future = ResponseFuture::new(Duration::from_secs(1));
        assert!(future.complete(serde_json::json!("first")));
        assert!(!future.complete(serde_json::json!("second")));
        assert!(!future.complete_with_framework_error(RpcError::transport("late")));
        assert_eq!(future.get(Duration::ZERO).unwrap(), serde_json::json!("first"));
        assert_eq!(future.state(), LatchState::Succeeded);
    }

    #[test]
    fn listener_on_completed_future_fires_immediately() {
        let future = ResponseFuture::completed(Outcome::AppError(AppError::new("E", "boom")));
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        future.add_listener(move |outcome| {
            assert!(matches!(outcome, Outcome::AppError(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1, "已完成时注册必须同步触发");
    }

    #[test]
    fn listener_registered_before_completion_fires_once() {
        let future = ResponseFuture::new(Duration::from_secs(1));
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        future.add_listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        future.complete(serde_json::Value::Null);
        future.complete(serde_json::Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_read_the_future_without_deadlock() {
        let future = ResponseFuture::new(Duration::from_secs(1));
        let observed = Arc::new(Mutex::new(None));
        let (reader, slot) = (future.clone(), Arc::clone(&observed));
        future.add_listener(move |_| {
            *slot.lock() = reader.try_outcome().map(|o| o.label());
        });
        future.complete(serde_json::json!(1));
        assert_eq!(*observed.lock(), Some("value"));
    }

    #[test]
    fn get_times_out_with_elapsed_and_budget() {
        let future = ResponseFuture::new(Duration::from_millis(20));
        let err = future.get(Duration::from_millis(20)).unwrap_err();
        let framework = err.as_framework().expect("超时属于框架错误");
        match framework.kind() {
            RpcErrorKind::Timeout { elapsed, budget } => {
                assert!(*elapsed >= Duration::from_millis(20));
                assert_eq!(*budget, Duration::from_millis(20));
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(
            !future.complete(serde_json::json!("late")),
            "超时后到达的响应必须被丢弃"
        );
        assert!(future.get(Duration::ZERO).unwrap_err().is_timeout());
    }

    #[test]
    fn response_before_deadline_is_returned() {
        let future = ResponseFuture::new(Duration::from_millis(500));
        let completer = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.complete(serde_json::json!({"ok": true}));
        });
        let value = future.get(Duration::from_millis(500)).unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));
        handle.join().unwrap();
    }

    #[test]
    fn racing_completers_produce_a_single_winner() {
        for _ in 0..64 {
            let future = ResponseFuture::new(Duration::from_secs(1));
            let barrier = Arc::new(Barrier::new(3));
            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..3)
                .map(|idx| {
                    let (future, barrier, wins) =
                        (future.clone(), Arc::clone(&barrier), Arc::clone(&wins));
                    thread::spawn(move || {
                        barrier.wait();
                        if future.complete(serde_json::json!(idx)) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            let first = future.get(Duration::ZERO).unwrap();
            assert_eq!(future.get(Duration::ZERO).unwrap(), first);
        }
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let future = ResponseFuture::new(Duration::from_secs(1));
        let hits = Arc::new(AtomicUsize::new(0));
        future.add_listener(|_| panic!("listener bug"));
        let seen = Arc::clone(&hits);
        future.add_listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(future.complete(serde_json::Value::Null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn await_resolves_after_cross_thread_completion() {
        let future = ResponseFuture::new(Duration::from_secs(1));
        let completer = future.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            completer.complete_with_application_error(AppError::new("E", "nope"));
        });
        let err = futures::executor::block_on(future).unwrap_err();
        assert_eq!(err.as_application().map(|e| e.message.as_str()), Some("nope"));
        handle.join().unwrap();
    }
}
