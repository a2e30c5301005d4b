//! spark-rpc-filters: 面向 `spark-rpc` 过滤器链的内置过滤器。
//!
//! # 教案式概览
//! - **意图（Why）**：追踪、指标、故障演练、熔断是每个服务引用都会用到的横切能力，
//!   以 [`spark_rpc::Filter`] 实现后按 `order` 装配即可，无需改动调用代码。
//! - **结构（How）**：按关注点拆分为 [`tracing_filter`]、[`metrics`]、[`fault`] 与 [`breaker`] 四个模块；
//!   默认排序值见 [`order`]，数值越小越靠外层。
//! - **契约（What）**：所有过滤器实例可被多个引用共享，内部状态以原子量、`DashMap` 或互斥锁保护；
//!   跨调用的数据只经由请求附件与 `RequestHead` 传递。

pub mod breaker;
pub mod fault;
pub mod metrics;
pub mod tracing_filter;

pub use breaker::{BreakerState, CircuitBreakerConfig, CircuitBreakerFilter};
pub use fault::{FaultInjectionConfig, FaultInjectionFilter, MethodFault};
pub use metrics::{MethodStats, MetricsFilter};
pub use tracing_filter::TracingFilter;

/// 内置过滤器的默认排序值。
pub mod order {
    /// 追踪最先进入、最后退出，span 覆盖整条链。
    pub const TRACING: i32 = -100;
    /// 指标位于追踪之内，统计熔断与故障注入造成的失败。
    pub const METRICS: i32 = -50;
    pub const CIRCUIT_BREAKER: i32 = 0;
    /// 故障注入最靠近传输，模拟的是远端故障。
    pub const FAULT_INJECTION: i32 = 100;
}
