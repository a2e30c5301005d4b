//! 内置过滤器按默认排序装配进同一条链时的协作行为。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use spark_rpc::{
    Filter, FilterChainBuilder, FilterSide, Reply, Request, RpcError, SerializeType,
    ServiceIdentity, codes, invoker_fn,
};
use spark_rpc_filters::{
    BreakerState, CircuitBreakerConfig, CircuitBreakerFilter, FaultInjectionConfig,
    FaultInjectionFilter, MethodFault, MetricsFilter, TracingFilter,
};

const SERVICE: &str = "com.example.Echo:1.0";

fn request(method: &str) -> Request {
    Request::new(
        ServiceIdentity::new("com.example.Echo", "1.0", ""),
        method,
        Vec::new(),
        SerializeType::JSON,
    )
}

#[test]
fn default_orders_place_tracing_outermost_and_faults_innermost() {
    let chain = FilterChainBuilder::new(FilterSide::Consumer)
        .filter(Arc::new(FaultInjectionFilter::new(
            FaultInjectionConfig::default().with_method("echo", MethodFault::abort_every(10)),
        )))
        .filter(Arc::new(CircuitBreakerFilter::new(CircuitBreakerConfig::default())))
        .filter(Arc::new(MetricsFilter::new()))
        .filter(Arc::new(TracingFilter::new()))
        .build(Arc::new(invoker_fn(|_| Ok(Reply::Value(serde_json::Value::Null)))));

    assert_eq!(
        chain.filter_names(),
        ["tracing", "metrics", "circuit-breaker", "fault-injection"]
    );
}

#[test]
fn transport_failures_trip_the_breaker_and_metrics_see_rejections() {
    let reached = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reached);
    let metrics = Arc::new(MetricsFilter::new());
    let breaker = Arc::new(CircuitBreakerFilter::new(
        CircuitBreakerConfig::default().with_failure_threshold(2),
    ));
    let transport_failure = invoker_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(RpcError::connection("connection refused"))
    });
    let chain = FilterChainBuilder::new(FilterSide::Consumer)
        .filter(Arc::clone(&metrics) as Arc<dyn Filter>)
        .filter(Arc::clone(&breaker) as Arc<dyn Filter>)
        .build(Arc::new(transport_failure));

    let codes_seen: Vec<&str> = (0..4)
        .map(|_| chain.invoke(request("echo")).unwrap_err().code())
        .collect();
    assert_eq!(
        codes_seen,
        [
            codes::CONNECTION,
            codes::CONNECTION,
            codes::CIRCUIT_OPEN,
            codes::CIRCUIT_OPEN
        ]
    );
    assert_eq!(reached.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(SERVICE), BreakerState::Open);

    let stats = metrics.stats(SERVICE, "echo").expect("应记录 echo 的指标");
    assert_eq!(stats.calls, 4);
    assert_eq!(stats.framework_errors, 4, "熔断拒绝同样计为框架错误");
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn fault_injection_errors_do_not_open_the_breaker() {
    let breaker = Arc::new(CircuitBreakerFilter::new(
        CircuitBreakerConfig::default().with_failure_threshold(1),
    ));
    let chain = FilterChainBuilder::new(FilterSide::Consumer)
        .filter(Arc::clone(&breaker) as Arc<dyn Filter>)
        .filter(Arc::new(FaultInjectionFilter::new(
            FaultInjectionConfig::default().with_method("echo", MethodFault::abort_every(1)),
        )))
        .build(Arc::new(invoker_fn(|_| Ok(Reply::Value(serde_json::Value::Null)))));

    let err = chain.invoke(request("echo")).unwrap_err();
    assert_eq!(err.code(), codes::FILTER);
    assert_eq!(breaker.state(SERVICE), BreakerState::Closed);
}

#[test]
fn provider_side_chain_skips_consumer_only_filters() {
    let chain = FilterChainBuilder::new(FilterSide::Provider)
        .filter(Arc::new(TracingFilter::new()))
        .filter(Arc::new(MetricsFilter::new()))
        .filter(Arc::new(CircuitBreakerFilter::new(CircuitBreakerConfig::default())))
        .build(Arc::new(invoker_fn(|_| Ok(Reply::Value(serde_json::Value::Null)))));

    assert_eq!(chain.filter_names(), ["tracing", "metrics"]);
}
