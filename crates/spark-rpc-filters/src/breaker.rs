use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use spark_rpc::{
    Filter, FilterDescriptor, Invoker, Outcome, Reply, Request, RpcError, RpcErrorKind,
};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN_MS: u64 = 10_000;

/// 熔断配置。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开。
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// 打开后多久放行一次探测调用。
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// 打开期间的降级返回值；缺省时以 `rpc.circuit_open` 错误拒绝。
    #[serde(default)]
    pub fallback: Option<serde_json::Value>,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            fallback: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_fallback(mut self, value: serde_json::Value) -> Self {
        self.fallback = Some(value);
        self
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// 冷却期已过，正放行一次探测调用。
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Circuit {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// 按服务统计连续失败，超过阈值后在冷却期内直接拒绝调用。
///
/// # 教案式说明
/// - **意图（Why）**：下游持续超时或不可达时，继续发请求只会堆积在途调用并拖垮调用方；
///   快速失败或降级能让故障止步于本进程。
/// - **逻辑（How）**：
///   - `Closed`：放行；可重试错误与超时计为失败，成功与业务异常清零计数；
///   - `Open`：冷却期内拒绝；冷却期满后转入 `HalfOpen` 并放行一次探测；
///   - `HalfOpen`：探测结束前拒绝其他调用；探测成功回到 `Closed`，失败重新 `Open`。
/// - **契约（What）**：异步调用的终态经 Future 监听器结算，与同步调用计入同一计数。
#[derive(Debug)]
pub struct CircuitBreakerFilter {
    order: i32,
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<Circuit>>>,
}

impl CircuitBreakerFilter {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            order: crate::order::CIRCUIT_BREAKER,
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// 查询某个服务（唯一名）的当前状态；从未调用过的服务视为 `Closed`。
    pub fn state(&self, service: &str) -> BreakerState {
        self.circuits
            .get(service)
            .map(|circuit| circuit.lock().state)
            .unwrap_or(BreakerState::Closed)
    }

    fn circuit(&self, service: String) -> Arc<Mutex<Circuit>> {
        if let Some(existing) = self.circuits.get(&service) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(service)
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::closed())))
                .value(),
        )
    }

    /// 决定是否放行；返回 `false` 表示拒绝。
    fn admit(&self, circuit: &Mutex<Circuit>, service: &str) -> bool {
        let mut guard = circuit.lock();
        match guard.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let cooled = guard
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.cooldown());
                if cooled {
                    guard.state = BreakerState::HalfOpen;
                    tracing::info!(service, "circuit half-open, probing");
                }
                cooled
            }
        }
    }

    fn reject(&self, request: &Request) -> Result<Reply, RpcError> {
        tracing::debug!(service = %request.service(), method = %request.method(), "circuit open, call rejected");
        match &self.config.fallback {
            Some(value) => Ok(Reply::Value(value.clone())),
            None => Err(RpcError::new(
                RpcErrorKind::CircuitOpen,
                format!("circuit open for {}", request.service()),
            )),
        }
    }
}

fn settle(circuit: &Mutex<Circuit>, threshold: u32, service: &str, failed: bool) {
    let mut guard = circuit.lock();
    if !failed {
        if guard.state != BreakerState::Closed {
            tracing::info!(service, "circuit closed");
        }
        *guard = Circuit::closed();
        return;
    }
    guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);
    let trip = guard.state == BreakerState::HalfOpen
        || (guard.state == BreakerState::Closed && guard.consecutive_failures >= threshold);
    if trip {
        guard.state = BreakerState::Open;
        guard.opened_at = Some(Instant::now());
        tracing::warn!(
            service,
            failures = guard.consecutive_failures,
            "circuit opened"
        );
    }
}

fn is_failure(err: &RpcError) -> bool {
    err.is_retryable() || err.is_timeout()
}

impl Filter for CircuitBreakerFilter {
    fn descriptor(&self) -> FilterDescriptor {
        FilterDescriptor::new("circuit-breaker", self.order)
    }

    fn invoke(&self, next: &dyn Invoker, request: Request) -> Result<Reply, RpcError> {
        let service = request.service().unique_name();
        let circuit = self.circuit(service.clone());
        if !self.admit(&circuit, &service) {
            return self.reject(&request);
        }
        let threshold = self.config.failure_threshold.max(1);
        let result = next.invoke(request);
        match &result {
            Ok(Reply::Pending(future)) => {
                future.add_listener(move |outcome| {
                    let failed = matches!(outcome, Outcome::Framework(err) if is_failure(err));
                    settle(&circuit, threshold, &service, failed);
                });
            }
            Ok(_) => settle(&circuit, threshold, &service, false),
            Err(err) => settle(&circuit, threshold, &service, is_failure(err)),
        }
        result
    }
}
