//! 地址管理：注册中心契约、地址快照持有者与负载均衡。
//!
//! # 教案式说明
//! - **意图（Why）**：调用路径每次都要挑选一个提供者地址，而地址列表由注册中心推送、随时变化；
//!   读路径必须无锁，写路径整表替换。
//! - **逻辑（How）**：[`AddressHolder`] 以 `ArcSwap<Vec<ProviderAddress>>` 保存最新快照，
//!   注册中心推送时一次 `store` 生效；[`LoadBalancer`] 只读取快照做选择。
//! - **契约（What）**：快照为空时返回 `RpcErrorKind::Routing`，不等待地址出现。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::{
    error::{Result, RpcError},
    request::{Request, ServiceIdentity},
};

/// 提供者地址，形如 `mem://echo` 或 `10.0.0.1:12200`。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderAddress(String);

impl ProviderAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 地址变更监听者；注册中心每次推送完整的新列表。
pub trait AddressListener: Send + Sync + 'static {
    fn on_addresses(&self, service: &ServiceIdentity, addresses: Vec<ProviderAddress>);
}

/// 注册中心契约。
///
/// # 契约说明（What）
/// - `resolve`：返回当前已知的提供者列表，可能为空；
/// - `subscribe`：登记监听者，实现方应在登记时立即推送一次当前列表，之后每次变化推送全量。
pub trait Registry: Send + Sync + 'static {
    fn resolve(&self, service: &ServiceIdentity) -> Result<Vec<ProviderAddress>>;

    fn subscribe(&self, service: &ServiceIdentity, listener: Arc<dyn AddressListener>) -> Result<()>;
}

/// 进程内静态注册中心，通过 [`publish`](Self::publish) 推送地址。
#[derive(Default)]
pub struct StaticRegistry {
    services: DashMap<String, Vec<ProviderAddress>>,
    listeners: DashMap<String, Vec<Arc<dyn AddressListener>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以全量列表替换服务地址，并通知所有订阅者。
    pub fn publish<I>(&self, service: &ServiceIdentity, addresses: I)
    where
        I: IntoIterator<Item = ProviderAddress>,
    {
        let key = service.unique_name();
        let addresses: Vec<_> = addresses.into_iter().collect();
        self.services.insert(key.clone(), addresses.clone());
        // 先复制监听者列表再回调，避免在分片锁内执行外部代码。
        let listeners = self
            .listeners
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        tracing::debug!(
            service = %key,
            providers = addresses.len(),
            listeners = listeners.len(),
            "static registry published addresses"
        );
        for listener in listeners {
            listener.on_addresses(service, addresses.clone());
        }
    }
}

impl Registry for StaticRegistry {
    fn resolve(&self, service: &ServiceIdentity) -> Result<Vec<ProviderAddress>> {
        Ok(self
            .services
            .get(&service.unique_name())
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn subscribe(&self, service: &ServiceIdentity, listener: Arc<dyn AddressListener>) -> Result<()> {
        let key = service.unique_name();
        self.listeners
            .entry(key)
            .or_default()
            .push(Arc::clone(&listener));
        listener.on_addresses(service, self.resolve(service)?);
        Ok(())
    }
}

impl fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

/// 某个服务的最新地址快照。
#[derive(Debug)]
pub struct AddressHolder {
    addresses: ArcSwap<Vec<ProviderAddress>>,
    revision: AtomicU64,
}

impl AddressHolder {
    pub fn new(initial: Vec<ProviderAddress>) -> Self {
        Self {
            addresses: ArcSwap::from_pointee(initial),
            revision: AtomicU64::new(0),
        }
    }

    /// 当前快照；调用方持有的 `Arc` 不受后续替换影响。
    pub fn snapshot(&self) -> Arc<Vec<ProviderAddress>> {
        self.addresses.load_full()
    }

    pub fn replace(&self, addresses: Vec<ProviderAddress>) {
        self.addresses.store(Arc::new(addresses));
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// 快照被替换的次数。
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// 以负载均衡器在当前快照中挑选地址。
    pub fn select(&self, balancer: &dyn LoadBalancer, request: &Request) -> Result<ProviderAddress> {
        let snapshot = self.addresses.load();
        if snapshot.is_empty() {
            return Err(RpcError::routing(format!(
                "no provider available for {}",
                request.service().unique_name()
            )));
        }
        balancer.select(&snapshot, request).cloned().ok_or_else(|| {
            RpcError::routing(format!(
                "load balancer rejected all providers of {}",
                request.service().unique_name()
            ))
        })
    }
}

impl AddressListener for AddressHolder {
    fn on_addresses(&self, service: &ServiceIdentity, addresses: Vec<ProviderAddress>) {
        tracing::debug!(
            service = %service,
            providers = addresses.len(),
            "provider addresses updated"
        );
        self.replace(addresses);
    }
}

/// 负载均衡策略；`addresses` 保证非空。
pub trait LoadBalancer: Send + Sync + 'static {
    fn select<'a>(&self, addresses: &'a [ProviderAddress], request: &Request) -> Option<&'a ProviderAddress>;
}

/// 轮询。
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select<'a>(&self, addresses: &'a [ProviderAddress], _request: &Request) -> Option<&'a ProviderAddress> {
        if addresses.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();
        addresses.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::codes, serialization::SerializeType};

    fn service() -> ServiceIdentity {
        ServiceIdentity::new("com.example.Echo", "1.0", "")
    }

    fn request() -> Request {
        Request::new(service(), "echo", Vec::new(), SerializeType::JSON)
    }

    #[test]
    fn empty_snapshot_is_a_routing_error() {
        let holder = AddressHolder::new(Vec::new());
        let err = holder.select(&RoundRobin::new(), &request()).unwrap_err();
        assert_eq!(err.code(), codes::ROUTING);
    }

    #[test]
    fn round_robin_cycles_through_the_snapshot() {
        let holder = AddressHolder::new(vec!["mem://a".into(), "mem://b".into()]);
        let balancer = RoundRobin::new();
        let picks: Vec<_> = (0..4)
            .map(|_| holder.select(&balancer, &request()).unwrap().to_string())
            .collect();
        assert_eq!(picks, vec!["mem://a", "mem://b", "mem://a", "mem://b"]);
    }

    #[test]
    fn subscribers_receive_current_and_published_lists() {
        let registry = StaticRegistry::new();
        registry.publish(&service(), [ProviderAddress::from("mem://a")]);
        let holder = Arc::new(AddressHolder::new(Vec::new()));
        registry
            .subscribe(&service(), holder.clone() as Arc<dyn AddressListener>)
            .unwrap();
        assert_eq!(holder.snapshot().as_slice(), &[ProviderAddress::from("mem://a")]);

        let before = holder.snapshot();
        registry.publish(&service(), [ProviderAddress::from("mem://b"), ProviderAddress::from("mem://c")]);
        assert_eq!(holder.snapshot().len(), 2);
        assert_eq!(before.len(), 1, "旧快照持有者不受替换影响");
        assert_eq!(holder.revision(), 2);
    }
}
