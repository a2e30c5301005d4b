#![deny(unsafe_code)]
#![doc = "spark-rpc: 客户端调用链路核心。"]
#![doc = ""]
#![doc = "== 调用模型 =="]
#![doc = "调用线程构造请求并驱动过滤器链；传输 I/O 线程送达响应；定时器线程裁决超时。"]
#![doc = "三方只通过 `ResponseFuture` 与显式传递的 `InvokeContext` 交互，终态由一次比较交换决定。"]
#![doc = ""]
#![doc = "== 调用方式 =="]
#![doc = "`sync` 阻塞等待；`future` 返回可 `get`/`.await` 的 Future；`callback` 把终态交给"]
#![doc = "`ResponseCallback`；`oneway` 只发送。超时优先级：上下文 > 方法级 > 引用级 > 3000ms 默认值。"]
#![doc = ""]
#![doc = "== 错误模型 =="]
#![doc = "远端业务异常 `AppError` 原样交付；框架错误 `RpcError` 携带稳定错误码与处置分类。"]

pub mod callback;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod future;
pub mod invoker;
pub mod proxy;
pub mod registry;
pub mod request;
pub mod response;
pub mod serialization;
pub mod timer;
pub mod transport;

mod sync;

pub use callback::{CallbackExecutor, ResponseCallback};
pub use codec::{Codec, CodecRegistry, JsonCodec};
pub use config::{DEFAULT_INVOKE_TIMEOUT, MethodConfig, MethodSettings, ReferenceConfig};
pub use context::{ContextGuard, InvokeContext};
pub use error::{AppError, CallError, ErrorCategory, Result, RpcError, RpcErrorKind, codes};
pub use filter::{
    Filter, FilterActivation, FilterChain, FilterChainBuilder, FilterDescriptor, FilterScope,
    FilterSide, Invoker, invoker_fn,
};
pub use future::{LatchState, ResponseFuture};
pub use invoker::TransportInvoker;
pub use proxy::{ClientProxyInvoker, InvokeOutcome, ReferenceBuilder};
pub use registry::{
    AddressHolder, AddressListener, LoadBalancer, ProviderAddress, Registry, RoundRobin,
    StaticRegistry,
};
pub use request::{Argument, Attachments, InvokeType, Request, RequestHead, ServiceIdentity};
pub use response::{Outcome, Reply, WireResponse};
pub use serialization::{SerializeType, parse_serialize_type};
pub use timer::{ThreadTimer, Timer, TimerHandle, TimerTask};
pub use transport::{Completion, Transport, TransportError, WireRequest};
