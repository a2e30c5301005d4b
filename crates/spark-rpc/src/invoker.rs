//! 链尾的传输调用器：选址、编码、分发，并把传输完成桥接到 [`ResponseFuture`]。

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    codec::Codec,
    error::{CallError, RpcError},
    filter::Invoker,
    future::ResponseFuture,
    registry::{AddressHolder, LoadBalancer},
    request::{InvokeType, Request},
    response::{Outcome, Reply},
    timer::Timer,
    transport::{Transport, TransportError, WireRequest},
};

/// 过滤器链的终端调用器。
///
/// # 逻辑解析（How）
/// 1. 在地址快照上执行负载均衡，空列表直接返回路由错误；
/// 2. 以引用的编解码器编码请求，失败即序列化错误，不触碰传输；
/// 3. 单向调用交给 `send_oneway` 后立即返回；
/// 4. 其余调用创建 [`ResponseFuture`]，完成回调在 I/O 线程上解码响应并尝试完成 Future，
///    输给超时的迟到响应记录 `warn` 后丢弃；
/// 5. 异步调用在定时器上挂一个看门狗，截止时间到达时以超时终态竞争完成；
///    Future 完成后监听器取消看门狗；同步调用直接在调用线程上 `get(timeout)`。
pub struct TransportInvoker {
    addresses: Arc<AddressHolder>,
    balancer: Arc<dyn LoadBalancer>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    timer: Arc<dyn Timer>,
}

impl TransportInvoker {
    pub fn new(
        addresses: Arc<AddressHolder>,
        balancer: Arc<dyn LoadBalancer>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        Self {
            addresses,
            balancer,
            transport,
            codec,
            timer,
        }
    }

    fn arm_watchdog(&self, future: &ResponseFuture, budget: Duration) {
        let watched = future.clone();
        let handle = self.timer.schedule(
            budget,
            Box::new(move || {
                let elapsed = watched.elapsed();
                if watched.complete_with_framework_error(RpcError::timeout(elapsed, budget)) {
                    tracing::debug!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        budget_ms = budget.as_millis() as u64,
                        "watchdog timed out invocation"
                    );
                }
            }),
        );
        future.add_listener(move |_| {
            handle.cancel();
        });
    }
}

impl Invoker for TransportInvoker {
    fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        let address = self.addresses.select(self.balancer.as_ref(), &request)?;
        let body = self.codec.encode_request(&request)?;
        let timeout = request.timeout();
        let invoke_type = request.invoke_type();
        let service = request.service().unique_name();
        let method = request.method().to_owned();
        let wire = WireRequest {
            service: service.clone(),
            method: method.clone(),
            serialize_type: request.serialize_type(),
            timeout,
            body,
        };
        tracing::debug!(
            service = %service,
            method = %method,
            invoke_type = invoke_type.as_str(),
            provider = %address,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching request"
        );

        if invoke_type == InvokeType::Oneway {
            self.transport
                .send_oneway(&address, wire)
                .map_err(RpcError::from)?;
            return Ok(Reply::Value(serde_json::Value::Null));
        }

        let future = ResponseFuture::new(timeout);
        if invoke_type.is_async() {
            self.arm_watchdog(&future, timeout);
        }
        let completion = {
            let future = future.clone();
            let codec = Arc::clone(&self.codec);
            Box::new(move |result: Result<Bytes, TransportError>| {
                let outcome = match result {
                    Ok(bytes) => match codec.decode_response(&bytes) {
                        Ok(response) => response.into_outcome(),
                        Err(err) => Outcome::Framework(err),
                    },
                    Err(err) => Outcome::Framework(RpcError::from(err)),
                };
                let label = outcome.label();
                if !future.complete_with(outcome) {
                    tracing::warn!(
                        service = %service,
                        method = %method,
                        outcome = label,
                        "late response discarded"
                    );
                }
            })
        };
        if let Err(err) = self.transport.send(&address, wire, completion) {
            let err = RpcError::from(err);
            future.complete_with_framework_error(err.clone());
            return Err(err);
        }

        if invoke_type.is_async() {
            return Ok(Reply::Pending(future));
        }
        match future.get(timeout) {
            Ok(value) => Ok(Reply::Value(value)),
            Err(CallError::Application(err)) => Ok(Reply::AppError(err)),
            Err(CallError::Framework(err)) => Err(err),
        }
    }
}

impl fmt::Debug for TransportInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportInvoker")
            .field("providers", &self.addresses.snapshot().len())
            .field("serialization", &self.codec.serialize_type())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::{
        codec::JsonCodec,
        error::{AppError, codes},
        registry::{ProviderAddress, RoundRobin},
        request::ServiceIdentity,
        response::WireResponse,
        serialization::SerializeType,
        timer::ThreadTimer,
        transport::Completion,
    };
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    /// 把完成回调暂存起来，由测试决定何时、以何种结果完成。
    #[derive(Default)]
    struct Parked {
        pending: Mutex<Vec<Completion>>,
        oneway: Mutex<Vec<WireRequest>>,
    }

    impl Transport for Parked {
        fn send(
            &self,
            address: &ProviderAddress,
            _request: WireRequest,
            completion: Completion,
        ) -> Result<(), TransportError> {
            if address.as_str() == "mem://down" {
                return Err(TransportError::Unreachable {
                    address: address.clone(),
                });
            }
            self.pending.lock().push(completion);
            Ok(())
        }

        fn send_oneway(&self, _address: &ProviderAddress, request: WireRequest) -> Result<(), TransportError> {
            self.oneway.lock().push(request);
            Ok(())
        }
    }

    fn invoker(transport: Arc<Parked>, address: &str) -> TransportInvoker {
        invoker_with_timer(
            transport,
            address,
            Arc::new(ThreadTimer::start("invoker-test-timer").unwrap()),
        )
    }

    fn invoker_with_timer(transport: Arc<Parked>, address: &str, timer: Arc<ThreadTimer>) -> TransportInvoker {
        TransportInvoker::new(
            Arc::new(AddressHolder::new(vec![ProviderAddress::from(address)])),
            Arc::new(RoundRobin::new()),
            transport,
            Arc::new(JsonCodec),
            timer,
        )
    }

    fn request(invoke_type: InvokeType, timeout: Duration) -> Request {
        Request::new(
            ServiceIdentity::new("svc", "1.0", ""),
            "m",
            Vec::new(),
            SerializeType::JSON,
        )
        .with_invoke_type(invoke_type)
        .with_timeout(timeout)
    }

    fn respond(transport: &Parked, response: &WireResponse) {
        let completion = transport.pending.lock().pop().unwrap();
        completion(Ok(JsonCodec.encode_response(response).unwrap()));
    }

    #[test]
    fn future_mode_completes_from_transport_callback() {
        let transport = Arc::new(Parked::default());
        let invoker = invoker(Arc::clone(&transport), "mem://a");
        let reply = invoker
            .invoke(request(InvokeType::Future, Duration::from_secs(5)))
            .unwrap();
        let Reply::Pending(future) = reply else {
            panic!("异步调用必须返回 Pending");
        };
        respond(
            &transport,
            &WireResponse::AppError {
                error: AppError::new("E", "boom"),
            },
        );
        let err = future.get(Duration::ZERO).unwrap_err();
        assert_eq!(err.as_application().map(|e| e.type_name.as_str()), Some("E"));
    }

    #[traced_test]
    #[test]
    fn watchdog_times_out_async_call_and_late_response_is_dropped() {
        let transport = Arc::new(Parked::default());
        let invoker = invoker(Arc::clone(&transport), "mem://a");
        let Reply::Pending(future) = invoker
            .invoke(request(InvokeType::Future, Duration::from_millis(20)))
            .unwrap()
        else {
            panic!("异步调用必须返回 Pending");
        };
        let err = futures::executor::block_on(future.clone()).unwrap_err();
        assert!(err.is_timeout());
        respond(
            &transport,
            &WireResponse::Value {
                value: serde_json::json!("late"),
            },
        );
        assert!(future.get(Duration::ZERO).unwrap_err().is_timeout());
        assert!(logs_contain("late response discarded"));
    }

    #[test]
    fn settled_async_calls_release_their_watchdogs() {
        let transport = Arc::new(Parked::default());
        let timer = Arc::new(ThreadTimer::start("invoker-release-timer").unwrap());
        let invoker = invoker_with_timer(Arc::clone(&transport), "mem://a", Arc::clone(&timer));
        let body = serde_json::json!("x".repeat(1024));
        for _ in 0..100 {
            let Reply::Pending(future) = invoker
                .invoke(request(InvokeType::Future, Duration::from_secs(60)))
                .unwrap()
            else {
                panic!("异步调用必须返回 Pending");
            };
            respond(&transport, &WireResponse::Value { value: body.clone() });
            assert_eq!(future.get(Duration::ZERO).unwrap(), body);
        }
        assert_eq!(timer.pending(), 0, "已结算调用的看门狗必须随即撤下");
    }

    #[test]
    fn unreachable_provider_fails_at_dispatch() {
        let transport = Arc::new(Parked::default());
        let invoker = invoker(transport, "mem://down");
        let err = invoker
            .invoke(request(InvokeType::Future, Duration::from_secs(1)))
            .unwrap_err();
        assert_eq!(err.code(), codes::CONNECTION);
    }

    #[test]
    fn oneway_returns_without_waiting() {
        let transport = Arc::new(Parked::default());
        let invoker = invoker(Arc::clone(&transport), "mem://a");
        let reply = invoker
            .invoke(request(InvokeType::Oneway, Duration::from_secs(1)))
            .unwrap();
        assert!(matches!(reply, Reply::Value(serde_json::Value::Null)));
        assert_eq!(transport.oneway.lock().len(), 1);
        assert!(transport.pending.lock().is_empty());
    }
}
