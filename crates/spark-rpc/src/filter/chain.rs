use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use super::{Filter, FilterScope, FilterSide, Invoker};
use crate::{
    error::RpcError,
    request::{Request, RequestHead, ServiceIdentity},
    response::{Outcome, Reply},
};

/// 通配排除符，排除全部过滤器。
const EXCLUDE_ALL: &str = "*";

/// 链上的过滤器节点：持有过滤器与下一个调用器。
struct FilterNode {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
}

impl Invoker for FilterNode {
    fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        self.filter.invoke(self.next.as_ref(), request)
    }
}

/// 装配完成的过滤器链，构建后不可变，可被任意线程并发调用。
#[derive(Clone)]
pub struct FilterChain {
    head: Arc<dyn Invoker>,
    loaded: Arc<[Arc<dyn Filter>]>,
}

impl FilterChain {
    /// 不含过滤器、直接调用终端的链。
    pub fn direct(terminal: Arc<dyn Invoker>) -> Self {
        Self {
            head: terminal,
            loaded: Arc::from(Vec::new()),
        }
    }

    /// 从最外层过滤器开始驱动调用。
    pub fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        self.head.invoke(request)
    }

    /// 按进入顺序的相反顺序向已装配过滤器广播异步终态。
    pub fn notify_async(&self, head: &RequestHead, outcome: &Outcome) {
        for filter in self.loaded.iter().rev() {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                filter.on_async_response(head, outcome)
            }));
            if notified.is_err() {
                tracing::error!(
                    filter = filter.descriptor().name(),
                    service = %head.service,
                    method = %head.method,
                    "filter panicked while handling async response"
                );
            }
        }
    }

    /// 已装配过滤器的名称，按进入顺序。
    pub fn filter_names(&self) -> Vec<String> {
        self.loaded
            .iter()
            .map(|filter| filter.descriptor().name().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

impl Invoker for FilterChain {
    fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        FilterChain::invoke(self, request)
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filter_names())
            .finish()
    }
}

/// 过滤器链构建器。
///
/// # 逻辑解析（How）
/// 1. 丢弃激活侧不匹配的过滤器；
/// 2. 丢弃名称出现在排除列表中的过滤器，排除列表含 `*` 时全部丢弃；
/// 3. 询问 `need_to_load`；
/// 4. 按 `order` 稳定排序，相同 `order` 保持注册顺序；
/// 5. 从尾到头包装节点，最后一个节点指向终端调用器。
pub struct FilterChainBuilder {
    side: FilterSide,
    service: Option<ServiceIdentity>,
    filters: Vec<Arc<dyn Filter>>,
    excluded: Vec<String>,
}

impl FilterChainBuilder {
    pub fn new(side: FilterSide) -> Self {
        Self {
            side,
            service: None,
            filters: Vec::new(),
            excluded: Vec::new(),
        }
    }

    /// 链所服务的目标，透传给 `need_to_load`。
    pub fn for_service(mut self, service: ServiceIdentity) -> Self {
        self.service = Some(service);
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Filter>>,
    {
        self.filters.extend(filters);
        self
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self, terminal: Arc<dyn Invoker>) -> FilterChain {
        let scope = FilterScope {
            side: self.side,
            service: self.service,
        };
        let exclude_all = self.excluded.iter().any(|name| name == EXCLUDE_ALL);
        let mut loaded: Vec<Arc<dyn Filter>> = Vec::with_capacity(self.filters.len());
        for filter in self.filters {
            let descriptor = filter.descriptor();
            if !descriptor.activation().applies_to(scope.side) {
                continue;
            }
            if exclude_all || self.excluded.iter().any(|name| name == descriptor.name()) {
                tracing::debug!(filter = descriptor.name(), "filter excluded by configuration");
                continue;
            }
            if !filter.need_to_load(&scope) {
                tracing::debug!(filter = descriptor.name(), "filter declined to load");
                continue;
            }
            loaded.push(filter);
        }
        loaded.sort_by_key(|filter| filter.descriptor().order());

        let mut head = terminal;
        for filter in loaded.iter().rev() {
            head = Arc::new(FilterNode {
                filter: Arc::clone(filter),
                next: head,
            });
        }
        FilterChain {
            head,
            loaded: Arc::from(loaded),
        }
    }
}

impl fmt::Debug for FilterChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChainBuilder")
            .field("side", &self.side)
            .field("filters", &self.filters.len())
            .field("excluded", &self.excluded)
            .finish()
    }
}
