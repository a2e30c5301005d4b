use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    error::{AppError, RpcError},
    request::RequestHead,
    response::Outcome,
};

/// 用户回调：三种终态各有独立入口，每次调用至多触发其一。
///
/// # 契约说明（What）
/// - 对到达终态的调用恰好触发一次；进程关闭导致的放弃除外；
/// - 默认在完成 Future 的线程（通常是传输 I/O 线程）上执行，应避免长时间阻塞，
///   需要重活时请为引用配置 [`CallbackExecutor`]；
/// - 回调内部的 panic 会被捕获并记录，不会影响 I/O 线程。
pub trait ResponseCallback: Send + Sync + 'static {
    /// 远端正常返回。
    fn on_app_response(&self, value: &serde_json::Value, head: &RequestHead);

    /// 远端业务方法抛出异常。
    fn on_app_exception(&self, error: &AppError, head: &RequestHead);

    /// 框架错误：超时、连接失败、编解码失败、过滤器中止等。
    fn on_framework_exception(&self, error: &RpcError, head: &RequestHead);
}

/// 回调执行器：决定回调在哪条线程上运行。
pub trait CallbackExecutor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// 把终态路由到用户回调。
#[derive(Clone, Default)]
pub(crate) struct CallbackDispatcher {
    executor: Option<Arc<dyn CallbackExecutor>>,
}

impl CallbackDispatcher {
    pub(crate) fn new(executor: Option<Arc<dyn CallbackExecutor>>) -> Self {
        Self { executor }
    }

    pub(crate) fn dispatch(
        &self,
        callback: Arc<dyn ResponseCallback>,
        head: RequestHead,
        outcome: Outcome,
    ) {
        match &self.executor {
            Some(executor) => {
                executor.execute(Box::new(move || notify(callback.as_ref(), &head, &outcome)))
            }
            None => notify(callback.as_ref(), &head, &outcome),
        }
    }
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

fn notify(callback: &dyn ResponseCallback, head: &RequestHead, outcome: &Outcome) {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| match outcome {
        Outcome::Value(value) => callback.on_app_response(value, head),
        Outcome::AppError(error) => callback.on_app_exception(error, head),
        Outcome::Framework(error) => callback.on_framework_exception(error, head),
    }));
    if delivered.is_err() {
        tracing::error!(
            service = %head.service,
            method = %head.method,
            outcome = outcome.label(),
            "response callback panicked"
        );
    }
}
