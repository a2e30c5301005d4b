//! 调用上下文：把调用点的带外状态（超时覆盖、回调、附件）交给过滤器链与异步续延。
//!
//! # 教案式说明
//! - **意图（Why）**：线程池中的线程会被复用，若上下文残留在线程局部存储中，会串入下一次无关调用；
//!   异步响应又在另一条线程上处理，线程局部存储无法自然跟随。
//! - **逻辑（How）**：[`InvokeContext`] 首先是一个普通值，可直接通过
//!   [`ClientProxyInvoker::invoke_with`](crate::ClientProxyInvoker::invoke_with) 显式传入；
//!   为兼容“先设置、后调用”的写法，也可用 [`InvokeContext::enter`] 安装到当前线程，
//!   代理调用器在调用开始时 [`take_current`](InvokeContext::take_current) 取走它，
//!   因此分发交接时线程槽位已经为空；回调等续延所需状态随闭包显式移动到响应线程。
//! - **契约（What）**：同一个上下文值永远只属于一次调用，不会被两个在途调用同时触碰。

use std::{cell::RefCell, fmt, marker::PhantomData, sync::Arc, time::Duration};

use crate::{callback::ResponseCallback, request::Attachments};

thread_local! {
    static CURRENT: RefCell<Option<InvokeContext>> = const { RefCell::new(None) };
}

/// 单次调用的带外状态。
#[derive(Clone, Default)]
pub struct InvokeContext {
    timeout: Option<Duration>,
    callback: Option<Arc<dyn ResponseCallback>>,
    attachments: Attachments,
}

impl InvokeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本次调用的超时覆盖，优先级高于方法级与引用级配置。
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// 暂存响应回调；存在回调时本次调用按回调方式分发。
    pub fn set_response_callback(&mut self, callback: Arc<dyn ResponseCallback>) -> &mut Self {
        self.callback = Some(callback);
        self
    }

    pub fn response_callback(&self) -> Option<&Arc<dyn ResponseCallback>> {
        self.callback.as_ref()
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn remove_attachment(&mut self, key: &str) -> Option<String> {
        self.attachments.remove(key)
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn is_empty(&self) -> bool {
        self.timeout.is_none() && self.callback.is_none() && self.attachments.is_empty()
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<Duration>,
        Option<Arc<dyn ResponseCallback>>,
        Attachments,
    ) {
        (self.timeout, self.callback, self.attachments)
    }

    /// 安装为当前线程的上下文，返回的守卫在析构时清空槽位。
    ///
    /// 已存在的上下文会被替换；守卫析构时不会恢复旧值，嵌套使用需调用方自行保存。
    pub fn enter(self) -> ContextGuard {
        CURRENT.with(|slot| *slot.borrow_mut() = Some(self));
        ContextGuard {
            _thread_bound: PhantomData,
        }
    }

    /// 读写当前线程的上下文，槽位为空时先创建默认值。
    pub fn with_current<R>(f: impl FnOnce(&mut InvokeContext) -> R) -> R {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            f(slot.get_or_insert_with(InvokeContext::default))
        })
    }

    /// 取走当前线程的上下文，槽位随即为空。
    pub fn take_current() -> Option<InvokeContext> {
        CURRENT.with(|slot| slot.borrow_mut().take())
    }

    /// 当前线程是否持有上下文。
    pub fn has_current() -> bool {
        CURRENT.with(|slot| slot.borrow().is_some())
    }

    pub fn clear_current() {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}

impl fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeContext")
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.is_some())
            .field("attachments", &self.attachments)
            .finish()
    }
}

/// [`InvokeContext::enter`] 返回的守卫，析构时清空当前线程的上下文。
#[must_use = "守卫析构即清空上下文"]
pub struct ContextGuard {
    // 守卫只能在安装它的线程上析构。
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        InvokeContext::clear_current();
    }
}
