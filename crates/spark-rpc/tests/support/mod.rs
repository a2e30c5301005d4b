//! 集成测试共用的脚本化传输与回调记录器。
#![allow(dead_code)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use spark_rpc::{
    AppError, Codec, Completion, JsonCodec, ProviderAddress, ReferenceConfig, Request,
    RequestHead, ResponseCallback, RpcError, Transport, TransportError, WireRequest,
    WireResponse,
};

/// 服务端对单个请求的脚本化反应。
pub enum Script {
    /// 在 `after` 之后由独立线程（模拟 I/O 线程）送达响应。
    Respond { after: Duration, response: WireResponse },
    /// 永不响应。
    Silent,
    /// 建连失败。
    Refuse,
}

impl Script {
    pub fn value(after: Duration, value: serde_json::Value) -> Self {
        Script::Respond {
            after,
            response: WireResponse::Value { value },
        }
    }

    pub fn app_error(after: Duration, error: AppError) -> Self {
        Script::Respond {
            after,
            response: WireResponse::AppError { error },
        }
    }
}

type Handler = Box<dyn Fn(&Request) -> Script + Send + Sync>;

/// 线程驱动的脚本化传输：解码请求、记录，再按脚本完成。
pub struct ScriptedTransport {
    handler: Handler,
    pub received: Mutex<Vec<Request>>,
    pub oneway: Mutex<Vec<Request>>,
    parked: Mutex<Vec<Completion>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Script + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            received: Mutex::new(Vec::new()),
            oneway: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
        })
    }

    /// 立即以参数回显的传输。
    pub fn echo() -> Arc<Self> {
        Self::new(|request| {
            let value = request
                .args()
                .first()
                .map(|arg| arg.value.clone())
                .unwrap_or(serde_json::Value::Null);
            Script::value(Duration::ZERO, value)
        })
    }

    fn decode(request: &WireRequest) -> Request {
        JsonCodec
            .decode_request(&request.body)
            .expect("测试传输只接收 JSON 请求")
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        address: &ProviderAddress,
        request: WireRequest,
        completion: Completion,
    ) -> Result<(), TransportError> {
        let decoded = Self::decode(&request);
        let script = (self.handler)(&decoded);
        self.received.lock().push(decoded);
        match script {
            Script::Refuse => Err(TransportError::Unreachable {
                address: address.clone(),
            }),
            Script::Silent => {
                self.parked.lock().push(completion);
                Ok(())
            }
            Script::Respond { after, response } => {
                let bytes = JsonCodec
                    .encode_response(&response)
                    .expect("响应必须可编码");
                thread::spawn(move || {
                    if !after.is_zero() {
                        thread::sleep(after);
                    }
                    completion(Ok(bytes));
                });
                Ok(())
            }
        }
    }

    fn send_oneway(&self, _address: &ProviderAddress, request: WireRequest) -> Result<(), TransportError> {
        self.oneway.lock().push(Self::decode(&request));
        Ok(())
    }
}

/// 回调收到的事件。
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Response(serde_json::Value),
    AppException(AppError),
    FrameworkException(&'static str),
}

/// 记录每次回调及其所在线程。
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<(Event, RequestHead)>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().iter().map(|(event, _)| event.clone()).collect()
    }

    pub fn heads(&self) -> Vec<RequestHead> {
        self.events.lock().iter().map(|(_, head)| head.clone()).collect()
    }

    /// 轮询等待至少 `count` 个事件。
    pub fn wait_for(&self, count: usize, limit: Duration) -> Vec<Event> {
        let deadline = Instant::now() + limit;
        while self.events.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        self.events()
    }
}

impl ResponseCallback for RecordingCallback {
    fn on_app_response(&self, value: &serde_json::Value, head: &RequestHead) {
        self.events
            .lock()
            .push((Event::Response(value.clone()), head.clone()));
    }

    fn on_app_exception(&self, error: &AppError, head: &RequestHead) {
        self.events
            .lock()
            .push((Event::AppException(error.clone()), head.clone()));
    }

    fn on_framework_exception(&self, error: &RpcError, head: &RequestHead) {
        self.events
            .lock()
            .push((Event::FrameworkException(error.code()), head.clone()));
    }
}

pub fn json_reference(interface: &str) -> ReferenceConfig {
    ReferenceConfig::new(interface)
        .with_serialization("json")
        .with_direct_url("mem://provider")
}
