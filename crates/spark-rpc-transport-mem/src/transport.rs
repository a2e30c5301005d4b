use std::{io, time::Duration};

use dashmap::DashMap;
use spark_rpc::{Completion, ProviderAddress, Transport, TransportError, WireRequest};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::MemNetwork;

const IO_THREAD_NAME: &str = "spark-rpc-mem-io";
const IO_WORKERS: usize = 2;

/// 基于 tokio 运行时的进程内传输：每次交换在一个 tokio 任务上完成，任务所在线程即“I/O 线程”。
///
/// # 教案式说明
/// - **意图（Why）**：调用链路的所有异步语义（看门狗与真实响应竞争、回调所在线程、迟到响应）
///   只有在响应确实从另一个线程到达时才能被验证。
/// - **逻辑（How）**：
///   1. `send` 在调用线程上建连，未绑定或分区的地址同步返回 `Unreachable`；
///   2. 之后投递 tokio 任务：按方法注入延迟，再检查分区（延迟期间被分区视为连接关闭）；
///   3. 服务端处理在 `spawn_blocking` 上执行，结果交给 `completion`。
/// - **契约（What）**：`send` 返回 `Ok` 后 `completion` 恰好调用一次，除非传输先被销毁。
/// - **风险提示（Trade-offs）**：销毁自有运行时会丢弃在途任务，对应调用只能由看门狗或
///   调用方的等待期限收尾。
pub struct MemTransport {
    network: MemNetwork,
    latencies: DashMap<String, Duration>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl MemTransport {
    /// 创建自带多线程运行时的传输。
    pub fn new(network: MemNetwork) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(IO_WORKERS)
            .thread_name(IO_THREAD_NAME)
            .enable_time()
            .build()?;
        Ok(Self {
            network,
            latencies: DashMap::new(),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// 复用调用方已有的运行时。
    pub fn with_handle(network: MemNetwork, handle: Handle) -> Self {
        Self {
            network,
            latencies: DashMap::new(),
            handle,
            runtime: None,
        }
    }

    pub fn network(&self) -> &MemNetwork {
        &self.network
    }

    /// 为某个方法注入固定的网络延迟；`Duration::ZERO` 等价于清除。
    pub fn set_latency(&self, method: impl Into<String>, latency: Duration) {
        let method = method.into();
        if latency.is_zero() {
            self.latencies.remove(&method);
        } else {
            self.latencies.insert(method, latency);
        }
    }

    fn latency(&self, method: &str) -> Duration {
        self.latencies
            .get(method)
            .map(|entry| *entry.value())
            .unwrap_or(Duration::ZERO)
    }
}

impl Transport for MemTransport {
    fn send(
        &self,
        address: &ProviderAddress,
        request: WireRequest,
        completion: Completion,
    ) -> Result<(), TransportError> {
        let server = self.network.connect(address)?;
        let latency = self.latency(&request.method);
        let network = self.network.clone();
        let address = address.clone();
        self.handle.spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if network.is_partitioned(&address) {
                tracing::debug!(address = %address, "exchange cut by partition");
                completion(Err(TransportError::Closed { address }));
                return;
            }
            let exchange = tokio::task::spawn_blocking(move || server.handle(&request)).await;
            let result = match exchange {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(address = %address, error = %err, "mem exchange aborted");
                    Err(TransportError::Closed { address })
                }
            };
            completion(result);
        });
        Ok(())
    }

    fn send_oneway(&self, address: &ProviderAddress, request: WireRequest) -> Result<(), TransportError> {
        let server = self.network.connect(address)?;
        let latency = self.latency(&request.method);
        let address = address.clone();
        self.handle.spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let method = request.method.clone();
            match tokio::task::spawn_blocking(move || server.handle(&request)).await {
                Ok(Ok(_)) => tracing::trace!(address = %address, method = %method, "oneway delivered"),
                Ok(Err(err)) => tracing::warn!(address = %address, method = %method, error = %err, "oneway rejected"),
                Err(err) => tracing::warn!(address = %address, method = %method, error = %err, "oneway aborted"),
            }
        });
        Ok(())
    }
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
