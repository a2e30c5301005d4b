use std::{fmt, io, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    error::RpcError,
    registry::ProviderAddress,
    serialization::SerializeType,
};

/// 交给传输层的已编码请求帧。
///
/// `service` 与 `method` 作为帧头明文携带，供传输与服务端在不解码请求体的情况下路由与观测。
#[derive(Clone, Debug)]
pub struct WireRequest {
    pub service: String,
    pub method: String,
    pub serialize_type: SerializeType,
    pub timeout: Duration,
    pub body: Bytes,
}

/// 传输层错误。
///
/// # What
/// - `Unreachable`：建连失败、对端不存在或网络分区；
/// - `Closed`：连接在交换完成前关闭；
/// - `Io`：读写阶段的底层错误，保留原始 `io::Error`。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider `{address}` is unreachable")]
    Unreachable { address: ProviderAddress },
    #[error("connection to `{address}` closed before the response arrived")]
    Closed { address: ProviderAddress },
    #[error("transport i/o failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        let mapped = match &err {
            TransportError::Unreachable { address } => {
                RpcError::connection(format!("failed to reach provider `{address}`"))
            }
            TransportError::Closed { address } => {
                RpcError::transport(format!("connection to `{address}` closed"))
            }
            TransportError::Io { .. } => RpcError::transport("transport i/o failed"),
        };
        mapped.with_cause(err)
    }
}

/// 响应完成回调：对每次 [`Transport::send`] 恰好调用一次。
pub type Completion = Box<dyn FnOnce(Result<Bytes, TransportError>) + Send + 'static>;

/// 请求/响应交换的传输契约。
///
/// # 契约说明（What）
/// - `send` 不阻塞调用线程，`completion` 在传输 I/O 线程上以响应字节或错误恰好调用一次；
///   若建连在调用线程上即失败，实现可以同步返回 `Err`，此时 `completion` 不会被调用；
/// - `send_oneway` 只保证请求被交付给传输，不等待也不返回响应；
/// - 传输不负责超时，截止时间由调用侧看门狗裁决，`WireRequest::timeout` 仅供对端参考。
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        address: &ProviderAddress,
        request: WireRequest,
        completion: Completion,
    ) -> Result<(), TransportError>;

    fn send_oneway(&self, address: &ProviderAddress, request: WireRequest) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transport")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, codes};
    use std::error::Error as _;

    #[test]
    fn unreachable_maps_to_retryable_connection_error() {
        let err = RpcError::from(TransportError::Unreachable {
            address: "mem://gone".into(),
        });
        assert_eq!(err.code(), codes::CONNECTION);
        assert_eq!(err.category(), ErrorCategory::Retryable);
        assert!(err.source().is_some());
    }

    #[test]
    fn io_failure_maps_to_transport_error() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err = RpcError::from(TransportError::from(io));
        assert_eq!(err.code(), codes::TRANSPORT);
    }
}
