//! 客户端代理调用器：把“方法名 + 参数”变成一次经过过滤器链的远程调用。
//!
//! # 教案式说明
//! - **意图（Why）**：调用方只关心方法与参数；服务标识、序列化、超时决议、调用方式、
//!   过滤器链与回调路由都应在引用构建时一次性确定，调用路径只读取缓存。
//! - **逻辑（How）**：[`ReferenceBuilder::build`] 解析配置、校验序列化类型与编解码器、
//!   装配地址持有者与过滤器链；[`ClientProxyInvoker::invoke_with`] 取出上下文、
//!   决议超时与调用方式、驱动过滤器链，再按调用方式交付结果。
//! - **契约（What）**：
//!   - `Sync`：返回值或抛出 [`CallError`]；
//!   - `Future`：返回 [`ResponseFuture`]，分发阶段的失败以已失败的 Future 返回；
//!   - `Callback`：返回 `Dispatched`，包括分发失败在内的每个终态恰好交付回调一次；
//!   - `Oneway`：返回 `Dispatched`，分发阶段的失败直接抛出。

use std::{collections::HashMap, fmt, sync::Arc};

use serde::de::DeserializeOwned;

use crate::{
    callback::{CallbackDispatcher, CallbackExecutor, ResponseCallback},
    codec::CodecRegistry,
    config::{MethodSettings, ReferenceConfig, effective_timeout},
    context::InvokeContext,
    error::{CallError, Result, RpcError},
    filter::{Filter, FilterChain, FilterChainBuilder, FilterSide},
    future::ResponseFuture,
    invoker::TransportInvoker,
    registry::{AddressHolder, AddressListener, LoadBalancer, ProviderAddress, Registry, RoundRobin},
    request::{Argument, InvokeType, Request, RequestHead, ServiceIdentity},
    response::{Outcome, Reply},
    serialization::{SerializeType, parse_serialize_type},
    timer::{ThreadTimer, Timer},
    transport::Transport,
};

/// 一次调用的直接结果。
#[derive(Debug)]
pub enum InvokeOutcome {
    /// 同步调用的返回值。
    Value(serde_json::Value),
    /// Future 方式的待定结果。
    Future(ResponseFuture),
    /// 回调或单向方式：请求已分发。
    Dispatched,
}

impl InvokeOutcome {
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            InvokeOutcome::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_future(self) -> Option<ResponseFuture> {
        match self {
            InvokeOutcome::Future(future) => Some(future),
            _ => None,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, InvokeOutcome::Dispatched)
    }
}

/// 服务引用构建器。
pub struct ReferenceBuilder {
    config: ReferenceConfig,
    registry: Option<Arc<dyn Registry>>,
    transport: Option<Arc<dyn Transport>>,
    codecs: CodecRegistry,
    filters: Vec<Arc<dyn Filter>>,
    balancer: Arc<dyn LoadBalancer>,
    timer: Option<Arc<dyn Timer>>,
    callback: Option<Arc<dyn ResponseCallback>>,
    executor: Option<Arc<dyn CallbackExecutor>>,
}

impl ReferenceBuilder {
    pub fn new(config: ReferenceConfig) -> Self {
        Self {
            config,
            registry: None,
            transport: None,
            codecs: CodecRegistry::default(),
            filters: Vec::new(),
            balancer: Arc::new(RoundRobin::new()),
            timer: None,
            callback: None,
            executor: None,
        }
    }

    /// 未配置 `direct_url` 时用于订阅地址的注册中心。
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn load_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    /// 看门狗使用的定时器，缺省为进程共享的 [`ThreadTimer`]。
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// 引用级默认回调，上下文中未设置回调时使用。
    pub fn response_callback(mut self, callback: Arc<dyn ResponseCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn callback_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 构建代理调用器；任何配置问题都在此暴露，而不是第一次调用时。
    pub fn build(self) -> Result<ClientProxyInvoker> {
        self.config.validate()?;
        let serialize_type = parse_serialize_type(&self.config.serialization)?;
        let codec = self.codecs.require(serialize_type)?;
        let transport = self
            .transport
            .ok_or_else(|| RpcError::configuration("reference requires a transport"))?;
        let service = self.config.service_identity();

        let direct = self.config.direct_urls();
        let addresses = if !direct.is_empty() {
            Arc::new(AddressHolder::new(
                direct.into_iter().map(ProviderAddress::new).collect(),
            ))
        } else {
            let registry = self.registry.ok_or_else(|| {
                RpcError::configuration(format!(
                    "reference {} has neither direct_url nor registry",
                    service.unique_name()
                ))
            })?;
            let holder = Arc::new(AddressHolder::new(Vec::new()));
            registry.subscribe(&service, Arc::clone(&holder) as Arc<dyn AddressListener>)?;
            holder
        };

        let timer = match self.timer {
            Some(timer) => timer,
            None => ThreadTimer::shared()?,
        };

        let default_settings = MethodSettings {
            timeout: self.config.reference_timeout(),
            invoke_type: self.config.invoke_type,
        };
        let method_settings = self
            .config
            .methods
            .keys()
            .map(|name| (name.clone(), self.config.method_settings(name)))
            .collect();

        let terminal = Arc::new(TransportInvoker::new(
            Arc::clone(&addresses),
            self.balancer,
            transport,
            codec,
            timer,
        ));
        let chain = FilterChainBuilder::new(FilterSide::Consumer)
            .for_service(service.clone())
            .filters(self.filters)
            .exclude(self.config.exclude_filters.iter().cloned())
            .build(terminal);

        tracing::info!(
            service = %service,
            serialization = %serialize_type,
            providers = addresses.snapshot().len(),
            filters = ?chain.filter_names(),
            "reference built"
        );

        Ok(ClientProxyInvoker {
            service,
            serialize_type,
            default_settings,
            method_settings,
            chain,
            addresses,
            default_callback: self.callback,
            dispatcher: CallbackDispatcher::new(self.executor),
        })
    }
}

impl fmt::Debug for ReferenceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceBuilder")
            .field("config", &self.config)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// 服务引用的通用调用入口。
///
/// 构建后所有字段只读，可在线程间共享；同一实例可并发调用。
pub struct ClientProxyInvoker {
    service: ServiceIdentity,
    serialize_type: SerializeType,
    default_settings: MethodSettings,
    method_settings: HashMap<String, MethodSettings>,
    chain: FilterChain,
    addresses: Arc<AddressHolder>,
    default_callback: Option<Arc<dyn ResponseCallback>>,
    dispatcher: CallbackDispatcher,
}

impl ClientProxyInvoker {
    pub fn builder(config: ReferenceConfig) -> ReferenceBuilder {
        ReferenceBuilder::new(config)
    }

    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    pub fn serialize_type(&self) -> SerializeType {
        self.serialize_type
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.chain
    }

    /// 当前地址快照。
    pub fn providers(&self) -> Arc<Vec<ProviderAddress>> {
        self.addresses.snapshot()
    }

    /// 方法在构建期解析出的有效设置。
    pub fn method_settings(&self, method: &str) -> MethodSettings {
        self.method_settings
            .get(method)
            .copied()
            .unwrap_or(self.default_settings)
    }

    /// 以当前线程安装的上下文（若有）发起调用；上下文在调用开始时被取走。
    pub fn invoke(&self, method: &str, args: Vec<Argument>) -> Result<InvokeOutcome, CallError> {
        let context = InvokeContext::take_current().unwrap_or_default();
        self.invoke_with(context, method, args)
    }

    /// 以显式上下文发起调用。
    pub fn invoke_with(
        &self,
        context: InvokeContext,
        method: &str,
        args: Vec<Argument>,
    ) -> Result<InvokeOutcome, CallError> {
        let (timeout_override, context_callback, attachments) = context.into_parts();
        let settings = self.method_settings(method);
        let timeout = effective_timeout(timeout_override, &settings);
        let invoke_type = if context_callback.is_some() {
            InvokeType::Callback
        } else {
            settings.invoke_type
        };
        let callback = match invoke_type {
            InvokeType::Callback => Some(
                context_callback
                    .or_else(|| self.default_callback.clone())
                    .ok_or_else(|| {
                        RpcError::configuration(format!(
                            "method `{method}` uses callback mode but no response callback is set"
                        ))
                    })?,
            ),
            _ => None,
        };

        let request = Request::new(self.service.clone(), method, args, self.serialize_type)
            .with_timeout(timeout)
            .with_invoke_type(invoke_type)
            .with_attachments(attachments);
        let head = request.head();
        let result = self.chain.invoke(request);

        match invoke_type {
            InvokeType::Sync => match result {
                Ok(Reply::Value(value)) => Ok(InvokeOutcome::Value(value)),
                Ok(Reply::AppError(err)) => Err(CallError::Application(err)),
                Ok(Reply::Pending(future)) => {
                    self.observe(&future, head, None);
                    future.get(timeout).map(InvokeOutcome::Value)
                }
                Err(err) => Err(CallError::Framework(err)),
            },
            InvokeType::Future => {
                let future = match result {
                    Ok(Reply::Pending(future)) => {
                        self.observe(&future, head, None);
                        future
                    }
                    Ok(reply) => ResponseFuture::completed(settled(reply)),
                    Err(err) => {
                        tracing::debug!(
                            service = %head.service,
                            method = %head.method,
                            code = err.code(),
                            "dispatch failed; returning failed future"
                        );
                        ResponseFuture::completed(Outcome::Framework(err))
                    }
                };
                Ok(InvokeOutcome::Future(future))
            }
            InvokeType::Callback => {
                let Some(callback) = callback else {
                    return Err(RpcError::configuration("callback mode without callback").into());
                };
                match result {
                    Ok(Reply::Pending(future)) => self.observe(&future, head, Some(callback)),
                    Ok(reply) => self.dispatcher.dispatch(callback, head, settled(reply)),
                    Err(err) => {
                        self.dispatcher
                            .dispatch(callback, head, Outcome::Framework(err))
                    }
                }
                Ok(InvokeOutcome::Dispatched)
            }
            InvokeType::Oneway => result
                .map(|_| InvokeOutcome::Dispatched)
                .map_err(CallError::Framework),
        }
    }

    /// 同步调用并把返回值反序列化为 `R`。
    pub fn call<R: DeserializeOwned>(&self, method: &str, args: Vec<Argument>) -> Result<R, CallError> {
        let value = match self.invoke(method, args)? {
            InvokeOutcome::Value(value) => value,
            InvokeOutcome::Future(future) => future.wait()?,
            InvokeOutcome::Dispatched => {
                return Err(RpcError::configuration(format!(
                    "method `{method}` does not produce a response value"
                ))
                .into());
            }
        };
        serde_json::from_value(value).map_err(|err| {
            CallError::Framework(
                RpcError::serialization(format!("response of `{method}` has unexpected shape"))
                    .with_cause(err),
            )
        })
    }

    /// 注册唯一的终态监听器：先通知过滤器，再路由到回调。
    fn observe(
        &self,
        future: &ResponseFuture,
        head: RequestHead,
        callback: Option<Arc<dyn ResponseCallback>>,
    ) {
        let chain = self.chain.clone();
        let dispatcher = self.dispatcher.clone();
        future.add_listener(move |outcome| {
            chain.notify_async(&head, outcome);
            if let Some(callback) = callback {
                dispatcher.dispatch(callback, head, outcome.clone());
            }
        });
    }
}

impl fmt::Debug for ClientProxyInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProxyInvoker")
            .field("service", &self.service.unique_name())
            .field("serialization", &self.serialize_type)
            .field("chain", &self.chain)
            .finish()
    }
}

fn settled(reply: Reply) -> Outcome {
    match reply {
        Reply::Value(value) => Outcome::Value(value),
        Reply::AppError(err) => Outcome::AppError(err),
        Reply::Pending(future) => future
            .try_outcome()
            .unwrap_or_else(|| Outcome::Framework(RpcError::shutdown("pending reply was not observed"))),
    }
}
