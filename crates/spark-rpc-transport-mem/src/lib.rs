//! spark-rpc-transport-mem: `spark-rpc` 的进程内传输与服务端分发。
//!
//! # 教案式概览
//! - **意图（Why）**：在不引入真实网络协议的前提下，让调用链路跑完整的
//!   “编码 → 跨线程交换 → 服务端过滤器链 → 方法处理 → 响应还原”闭环。
//! - **结构（How）**：
//!   - [`MemNetwork`]：地址到 [`MemServer`] 的映射，支持分区与恢复；
//!   - [`MemTransport`]：实现 [`spark_rpc::Transport`]，以 tokio 任务完成交换；
//!   - [`MemServer`]/[`MethodRouter`]：服务端分发与方法表。
//! - **契约（What）**：服务端框架错误以 [`codes`] 中的码值经 `WireResponse::ProviderError` 回传，
//!   客户端还原为 `RpcErrorKind::Provider { code }`。

mod network;
mod router;
mod server;
mod transport;

pub use network::MemNetwork;
pub use router::MethodRouter;
pub use server::{MemServer, MemServerBuilder};
pub use transport::MemTransport;

/// 服务端框架错误码。
pub mod codes {
    pub const SERVICE_NOT_FOUND: &str = "provider.service_not_found";
    pub const METHOD_NOT_FOUND: &str = "provider.method_not_found";
    pub const HANDLER_PANICKED: &str = "provider.handler_panicked";
}
