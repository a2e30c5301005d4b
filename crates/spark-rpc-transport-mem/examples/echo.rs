//! 进程内 Echo 演示：同步、Future 与回调三种调用方式走同一条链路。
//!
//! 运行：`RUST_LOG=debug cargo run -p spark-rpc-transport-mem --example echo`

use std::{sync::Arc, thread, time::Duration};

use spark_rpc::{
    AppError, Argument, ClientProxyInvoker, InvokeContext, ReferenceConfig,
    RequestHead, ResponseCallback, RpcError, ServiceIdentity,
};
use spark_rpc_filters::{MetricsFilter, TracingFilter};
use spark_rpc_transport_mem::{MemNetwork, MemServer, MemTransport, MethodRouter};
use tracing_subscriber::EnvFilter;

const REFERENCE: &str = r#"
interface = "com.example.Echo"
serialization = "json"
direct_url = "mem://echo"
timeout_ms = 500

[methods.shout]
invoke_type = "future"
"#;

struct PrintCallback;

impl ResponseCallback for PrintCallback {
    fn on_app_response(&self, value: &serde_json::Value, head: &RequestHead) {
        tracing::info!(method = %head.method, %value, "callback: response");
    }

    fn on_app_exception(&self, error: &AppError, head: &RequestHead) {
        tracing::info!(method = %head.method, error = %error.type_name, "callback: application error");
    }

    fn on_framework_exception(&self, error: &RpcError, head: &RequestHead) {
        tracing::warn!(method = %head.method, code = error.code(), "callback: framework error");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let network = MemNetwork::new();
    let server = MemServer::builder("echo")
        .filter(Arc::new(TracingFilter::new()))
        .service(
            ServiceIdentity::new("com.example.Echo", "1.0", ""),
            MethodRouter::new()
                .typed("echo", |text: String| Ok(text))
                .typed("shout", |text: String| Ok(text.to_uppercase())),
        )
        .build();
    network.bind("mem://echo", server);

    let metrics = Arc::new(MetricsFilter::new());
    let proxy = ClientProxyInvoker::builder(ReferenceConfig::from_toml_str(REFERENCE)?)
        .transport(Arc::new(MemTransport::new(network)?))
        .filter(Arc::new(TracingFilter::new()))
        .filter(metrics.clone())
        .build()?;

    let echoed: String = proxy.call("echo", vec![Argument::of("hello")?])?;
    tracing::info!(%echoed, "sync call returned");

    if let Some(future) = proxy
        .invoke("shout", vec![Argument::of("hello")?])?
        .into_future()
    {
        let shouted = future.get(Duration::from_secs(1))?;
        tracing::info!(%shouted, "future resolved");
    }

    let mut context = InvokeContext::new();
    context
        .set_response_callback(Arc::new(PrintCallback))
        .set_attachment("tenant", "demo");
    proxy.invoke_with(context, "echo", vec![Argument::of("via callback")?])?;
    thread::sleep(Duration::from_millis(100));

    for (method, stats) in metrics.snapshot() {
        tracing::info!(%method, calls = stats.calls, successes = stats.successes, "metrics");
    }
    Ok(())
}
