use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{Criterion, criterion_group, criterion_main};
use spark_rpc::{
    Argument, ClientProxyInvoker, Codec, Completion, InvokeContext, JsonCodec, ProviderAddress,
    ReferenceConfig, ResponseFuture, Transport, TransportError, WireRequest, WireResponse,
};

/// 在调用线程上同步完成的传输，基准只测量调用链路本身。
struct Loopback {
    response: bytes::Bytes,
}

impl Transport for Loopback {
    fn send(
        &self,
        _address: &ProviderAddress,
        _request: WireRequest,
        completion: Completion,
    ) -> Result<(), TransportError> {
        completion(Ok(self.response.clone()));
        Ok(())
    }

    fn send_oneway(&self, _address: &ProviderAddress, _request: WireRequest) -> Result<(), TransportError> {
        Ok(())
    }
}

/// 量化一次同步调用在过滤器链、编解码与 Future 桥接上的开销。
///
/// # 设计目的（Why）
/// - 调用路径上的每一次分配与加锁都会被放大到每秒数万次调用，回归需要尽早暴露；
/// - 传输在调用线程上直接完成，排除线程切换噪声。
fn bench_sync_invoke(c: &mut Criterion) {
    let response = JsonCodec
        .encode_response(&WireResponse::Value {
            value: serde_json::json!("pong"),
        })
        .expect("响应编码");
    let proxy = ClientProxyInvoker::builder(
        ReferenceConfig::new("com.example.Ping")
            .with_serialization("json")
            .with_direct_url("mem://loopback"),
    )
    .transport(Arc::new(Loopback { response }))
    .build()
    .expect("引用构建");

    c.bench_function("sync_invoke_loopback", |b| {
        b.iter(|| {
            let outcome = proxy
                .invoke("ping", vec![Argument::new("string", serde_json::json!("ping"))])
                .expect("调用成功");
            black_box(outcome);
        })
    });

    c.bench_function("sync_invoke_with_context", |b| {
        b.iter(|| {
            let mut context = InvokeContext::new();
            context
                .set_timeout(Duration::from_millis(500))
                .set_attachment("tenant", "bench");
            black_box(proxy.invoke_with(context, "ping", Vec::new()).expect("调用成功"));
        })
    });
}

/// 完成与读取一个 Future 的基础成本。
fn bench_future_completion(c: &mut Criterion) {
    c.bench_function("future_complete_then_get", |b| {
        b.iter(|| {
            let future = ResponseFuture::new(Duration::from_secs(1));
            future.complete(serde_json::Value::Null);
            black_box(future.get(Duration::ZERO).is_ok());
        })
    });
}

criterion_group!(invoke_benches, bench_sync_invoke, bench_future_completion);
criterion_main!(invoke_benches);
