use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use spark_rpc::{
    Filter, FilterActivation, FilterDescriptor, Invoker, Outcome, Reply, Request, RpcError,
};

/// 单个方法的计数器。
#[derive(Debug, Default)]
struct MethodCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    app_errors: AtomicU64,
    framework_errors: AtomicU64,
    timeouts: AtomicU64,
    in_flight: AtomicI64,
    latency_micros: AtomicU64,
}

impl MethodCounters {
    fn begin(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, outcome: Finished, elapsed: Duration) {
        match outcome {
            Finished::Success => self.successes.fetch_add(1, Ordering::Relaxed),
            Finished::AppError => self.app_errors.fetch_add(1, Ordering::Relaxed),
            Finished::Framework { timeout } => {
                if timeout {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.framework_errors.fetch_add(1, Ordering::Relaxed)
            }
        };
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MethodStats {
        MethodStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            app_errors: self.app_errors.load(Ordering::Relaxed),
            framework_errors: self.framework_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Clone, Copy)]
enum Finished {
    Success,
    AppError,
    Framework { timeout: bool },
}

impl From<&Outcome> for Finished {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Value(_) => Finished::Success,
            Outcome::AppError(_) => Finished::AppError,
            Outcome::Framework(err) => Finished::Framework {
                timeout: err.is_timeout(),
            },
        }
    }
}

/// 某个方法的指标快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub calls: u64,
    pub successes: u64,
    pub app_errors: u64,
    /// 含超时。
    pub framework_errors: u64,
    pub timeouts: u64,
    pub in_flight: i64,
    /// 已完成调用的累计耗时。
    pub total_latency: Duration,
}

impl MethodStats {
    pub fn completed(&self) -> u64 {
        self.successes + self.app_errors + self.framework_errors
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        let completed = u32::try_from(self.completed()).ok().filter(|n| *n > 0)?;
        Some(self.total_latency / completed)
    }
}

/// 按“服务唯一名#方法”聚合调用计数与耗时。
///
/// # 教案式说明
/// - **意图（Why）**：熔断阈值、容量评估都依赖按方法区分的成功率与耗时；
///   计数必须覆盖同步与异步两种路径，且不能因为异步终态延后到达而丢失。
/// - **逻辑（How）**：进入时递增 `calls` 与 `in_flight`；同步终态在回溯时结算；
///   回复为 `Pending` 时在 Future 上挂监听器，于完成线程结算，耗时从进入过滤器起算。
/// - **契约（What）**：每次调用恰好结算一次；`framework_errors` 包含超时，`timeouts` 单列。
#[derive(Debug)]
pub struct MetricsFilter {
    order: i32,
    methods: Arc<DashMap<String, Arc<MethodCounters>>>,
}

impl MetricsFilter {
    pub fn new() -> Self {
        Self::with_order(crate::order::METRICS)
    }

    pub fn with_order(order: i32) -> Self {
        Self {
            order,
            methods: Arc::new(DashMap::new()),
        }
    }

    /// 读取某个方法的快照；`service` 为服务唯一名，如 `com.example.Echo:1.0`。
    pub fn stats(&self, service: &str, method: &str) -> Option<MethodStats> {
        self.methods
            .get(&key(service, method))
            .map(|counters| counters.snapshot())
    }

    /// 全部方法的快照，按键排序。
    pub fn snapshot(&self) -> Vec<(String, MethodStats)> {
        let mut all: Vec<_> = self
            .methods
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn counters(&self, request: &Request) -> Arc<MethodCounters> {
        let key = key(&request.service().unique_name(), request.method());
        if let Some(existing) = self.methods.get(&key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.methods.entry(key).or_default().value())
    }
}

impl Default for MetricsFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn key(service: &str, method: &str) -> String {
    format!("{service}#{method}")
}

impl Filter for MetricsFilter {
    fn descriptor(&self) -> FilterDescriptor {
        FilterDescriptor::new("metrics", self.order).with_activation(FilterActivation::Both)
    }

    fn invoke(&self, next: &dyn Invoker, request: Request) -> Result<Reply, RpcError> {
        let counters = self.counters(&request);
        counters.begin();
        let started = Instant::now();
        let result = next.invoke(request);
        match &result {
            Ok(Reply::Pending(future)) => {
                future.add_listener(move |outcome| {
                    counters.finish(Finished::from(outcome), started.elapsed());
                });
            }
            Ok(Reply::Value(_)) => counters.finish(Finished::Success, started.elapsed()),
            Ok(Reply::AppError(_)) => counters.finish(Finished::AppError, started.elapsed()),
            Err(err) => counters.finish(
                Finished::Framework {
                    timeout: err.is_timeout(),
                },
                started.elapsed(),
            ),
        }
        result
    }
}
