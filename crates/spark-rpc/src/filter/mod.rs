//! 过滤器链：围绕终端调用器的严格嵌套中间件。
//!
//! # 教案式说明
//! - **意图（Why）**：超时记录、指标、追踪、故障注入、熔断等横切逻辑需要在每次调用前后执行，
//!   且执行顺序必须可预测，才能保证“先进后出”的资源配对（开始计时/结束计时、打开 span/关闭 span）。
//! - **逻辑（How）**：[`FilterChainBuilder`] 按激活侧、排除列表、`need_to_load` 筛选过滤器，
//!   以声明的 `order` 稳定排序，再从尾到头把每个过滤器包成一个 [`Invoker`] 节点；
//!   每个节点只持有“下一个调用器”，调用即向内递归，返回即向外回溯。
//! - **契约（What）**：进入顺序为 `order` 升序，回溯顺序严格相反；异步终态通知
//!   [`FilterChain::notify_async`] 同样按相反顺序执行。

mod chain;

pub use chain::{FilterChain, FilterChainBuilder};

use std::{borrow::Cow, fmt};

use crate::{
    error::RpcError,
    request::{Request, RequestHead, ServiceIdentity},
    response::{Outcome, Reply},
};

/// 链上的一个调用步骤：过滤器节点或终端调用器。
pub trait Invoker: Send + Sync + 'static {
    fn invoke(&self, request: Request) -> Result<Reply, RpcError>;
}

/// 由闭包实现的调用器。
pub struct FnInvoker<F> {
    f: F,
}

impl<F> Invoker for FnInvoker<F>
where
    F: Fn(Request) -> Result<Reply, RpcError> + Send + Sync + 'static,
{
    fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        (self.f)(request)
    }
}

impl<F> fmt::Debug for FnInvoker<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnInvoker")
    }
}

/// 以闭包构造调用器，常用于测试与服务端方法路由。
pub fn invoker_fn<F>(f: F) -> FnInvoker<F>
where
    F: Fn(Request) -> Result<Reply, RpcError> + Send + Sync + 'static,
{
    FnInvoker { f }
}

/// 过滤器所在的调用侧。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterSide {
    Consumer,
    Provider,
}

/// 过滤器声明的激活侧。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterActivation {
    #[default]
    Consumer,
    Provider,
    Both,
}

impl FilterActivation {
    pub fn applies_to(self, side: FilterSide) -> bool {
        matches!(
            (self, side),
            (FilterActivation::Both, _)
                | (FilterActivation::Consumer, FilterSide::Consumer)
                | (FilterActivation::Provider, FilterSide::Provider)
        )
    }
}

/// 过滤器元数据：稳定名称、排序值与激活侧。
///
/// `name` 用于排除列表匹配与观测标签，建议遵循 `vendor.component` 或短横线命名。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterDescriptor {
    name: Cow<'static, str>,
    order: i32,
    activation: FilterActivation,
}

impl FilterDescriptor {
    pub fn new(name: impl Into<Cow<'static, str>>, order: i32) -> Self {
        Self {
            name: name.into(),
            order,
            activation: FilterActivation::Consumer,
        }
    }

    pub fn with_activation(mut self, activation: FilterActivation) -> Self {
        self.activation = activation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 排序值，越小越靠外层。
    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn activation(&self) -> FilterActivation {
        self.activation
    }
}

/// 装配时提供给 [`Filter::need_to_load`] 的信息。
#[derive(Clone, Debug)]
pub struct FilterScope {
    pub side: FilterSide,
    pub service: Option<ServiceIdentity>,
}

/// 过滤器契约。
///
/// # 契约说明（What）
/// - `invoke`：可修改请求后调用 `next.invoke` 继续向内，或直接返回以短路；返回 `Err`
///   会原样向外传播，除非外层过滤器显式转换；
/// - 异步调用时 `next` 返回 `Reply::Pending`，过滤器在回溯阶段只能看到“已分发”，
///   真实终态随后经 [`on_async_response`](Self::on_async_response) 到达，通常在 I/O 线程上；
/// - 同一实例被多个引用、多个线程共享，状态必须内部同步；跨调用的数据应放在请求附件中，
///   而不是过滤器字段里。
pub trait Filter: Send + Sync + 'static {
    fn descriptor(&self) -> FilterDescriptor;

    /// 装配期动态退出，默认总是装配。
    fn need_to_load(&self, _scope: &FilterScope) -> bool {
        true
    }

    fn invoke(&self, next: &dyn Invoker, request: Request) -> Result<Reply, RpcError>;

    /// 异步调用到达终态后的通知。
    fn on_async_response(&self, _head: &RequestHead, _outcome: &Outcome) {}
}
