use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use spark_rpc::{ProviderAddress, TransportError};

use crate::MemServer;

#[derive(Default)]
struct NetworkInner {
    servers: DashMap<ProviderAddress, Arc<MemServer>>,
    partitioned: DashSet<ProviderAddress>,
}

/// 进程内“网络”：地址到服务端的映射，外加可人为制造的网络分区。
///
/// 克隆共享同一张地址表，服务端与多个传输实例可以各持一份。
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<NetworkInner>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将服务端挂到地址上；同一地址重复绑定时替换旧服务端。
    pub fn bind(&self, address: impl Into<String>, server: Arc<MemServer>) -> ProviderAddress {
        let address = ProviderAddress::new(address);
        tracing::debug!(address = %address, server = server.name(), "mem server bound");
        self.inner.servers.insert(address.clone(), server);
        address
    }

    pub fn unbind(&self, address: &ProviderAddress) -> Option<Arc<MemServer>> {
        self.inner.servers.remove(address).map(|(_, server)| server)
    }

    /// 切断到该地址的连接：新请求建连失败，在途请求在响应前被关闭。
    pub fn partition(&self, address: &ProviderAddress) {
        tracing::info!(address = %address, "mem network partitioned");
        self.inner.partitioned.insert(address.clone());
    }

    pub fn heal(&self, address: &ProviderAddress) {
        if self.inner.partitioned.remove(address).is_some() {
            tracing::info!(address = %address, "mem network healed");
        }
    }

    pub fn is_partitioned(&self, address: &ProviderAddress) -> bool {
        self.inner.partitioned.contains(address)
    }

    /// 建连：地址未绑定或处于分区时返回 `Unreachable`。
    pub fn connect(&self, address: &ProviderAddress) -> Result<Arc<MemServer>, TransportError> {
        if self.is_partitioned(address) {
            return Err(TransportError::Unreachable {
                address: address.clone(),
            });
        }
        self.inner
            .servers
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::Unreachable {
                address: address.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_blocks_connect_until_healed() {
        let network = MemNetwork::new();
        let address = network.bind("mem://a", MemServer::builder("a").build());
        assert!(network.connect(&address).is_ok());

        network.partition(&address);
        assert!(matches!(
            network.connect(&address),
            Err(TransportError::Unreachable { .. })
        ));
        network.heal(&address);
        assert!(network.connect(&address).is_ok());

        network.unbind(&address);
        assert!(network.connect(&address).is_err());
    }
}
