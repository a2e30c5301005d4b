use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use dashmap::DashMap;
use serde::Deserialize;
use spark_rpc::{
    Filter, FilterActivation, FilterDescriptor, FilterScope, Invoker, Reply, Request, RpcError,
    RpcErrorKind,
};

/// 单个方法的故障规则。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MethodFault {
    /// 每 N 次调用中止一次（第 N、2N…次）；`0` 与缺省均表示不中止。
    #[serde(default)]
    pub abort_every: Option<u64>,
    /// 向内调用前注入的延迟。
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl MethodFault {
    pub fn abort_every(n: u64) -> Self {
        Self {
            abort_every: Some(n),
            ..Self::default()
        }
    }

    pub fn delay(delay: Duration) -> Self {
        Self {
            delay_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            ..Self::default()
        }
    }
}

/// 故障注入配置；`methods` 的键为方法名，`"*"` 作用于未单独配置的方法。
///
/// ```toml
/// [methods.echo]
/// abort_every = 3
///
/// [methods."*"]
/// delay_ms = 20
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FaultInjectionConfig {
    #[serde(default)]
    pub methods: BTreeMap<String, MethodFault>,
}

impl FaultInjectionConfig {
    pub fn with_method(mut self, method: impl Into<String>, fault: MethodFault) -> Self {
        self.methods.insert(method.into(), fault);
        self
    }

    fn rule(&self, method: &str) -> Option<&MethodFault> {
        self.methods.get(method).or_else(|| self.methods.get("*"))
    }
}

/// 按方法注入延迟或中止，用于演练超时与失败处理路径。
///
/// # 教案式说明
/// - **意图（Why）**：超时、熔断与回调失败分支在真实环境中难以稳定复现，
///   在链内注入可控故障即可覆盖这些路径。
/// - **逻辑（How）**：每个方法维护独立计数；命中 `abort_every` 时直接返回
///   [`RpcErrorKind::Filter`] 错误并短路后续过滤器与传输；否则先睡眠 `delay_ms` 再向内调用。
/// - **风险提示（Trade-offs）**：延迟在调用线程上睡眠，只应在演练环境启用。
#[derive(Debug)]
pub struct FaultInjectionFilter {
    order: i32,
    config: FaultInjectionConfig,
    counters: DashMap<String, AtomicU64>,
}

impl FaultInjectionFilter {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self {
            order: crate::order::FAULT_INJECTION,
            config,
            counters: DashMap::new(),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    fn next_count(&self, method: &str) -> u64 {
        if let Some(counter) = self.counters.get(method) {
            return counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.counters
            .entry(method.to_owned())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }
}

impl Filter for FaultInjectionFilter {
    fn descriptor(&self) -> FilterDescriptor {
        FilterDescriptor::new("fault-injection", self.order).with_activation(FilterActivation::Both)
    }

    fn need_to_load(&self, _scope: &FilterScope) -> bool {
        !self.config.methods.is_empty()
    }

    fn invoke(&self, next: &dyn Invoker, request: Request) -> Result<Reply, RpcError> {
        let Some(rule) = self.config.rule(request.method()) else {
            return next.invoke(request);
        };
        let count = self.next_count(request.method());
        if let Some(every) = rule.abort_every.filter(|every| *every > 0) {
            if count % every == 0 {
                let message = rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("fault injected into {}", request.method()));
                tracing::warn!(
                    service = %request.service(),
                    method = %request.method(),
                    count,
                    "fault injection aborted invocation"
                );
                return Err(RpcError::new(RpcErrorKind::Filter, message));
            }
        }
        if let Some(delay_ms) = rule.delay_ms.filter(|delay| *delay > 0) {
            thread::sleep(Duration::from_millis(delay_ms));
        }
        next.invoke(request)
    }
}
