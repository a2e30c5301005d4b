use std::{collections::HashMap, fmt, io, sync::Arc};

use bytes::Bytes;
use spark_rpc::{
    CodecRegistry, Filter, FilterChain, FilterChainBuilder, FilterSide, Request, ServiceIdentity,
    TransportError, WireRequest, WireResponse,
};

use crate::{MethodRouter, codes};

/// 进程内服务端：解码请求，经服务端过滤器链分发到 [`MethodRouter`]，再编码响应。
///
/// # 教案式说明
/// - **意图（Why）**：端到端测试需要一个真实经过编解码与服务端过滤器的对端，
///   才能验证附件透传、业务异常与服务端框架错误的还原。
/// - **逻辑（How）**：每个服务在构建期装配一条 `FilterSide::Provider` 过滤器链，
///   末端是该服务的方法表；请求按服务唯一名查表。
/// - **契约（What）**：
///   - 未知服务返回 `provider.service_not_found`；
///   - 请求体无法解码时以服务端错误响应，保留解码错误码；
///   - 仅当没有对应序列化的编解码器时返回 [`TransportError`]，因为此时无法编码任何响应。
pub struct MemServer {
    name: String,
    codecs: CodecRegistry,
    services: HashMap<String, FilterChain>,
}

impl MemServer {
    pub fn builder(name: impl Into<String>) -> MemServerBuilder {
        MemServerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// 处理一次请求/响应交换，返回编码后的响应体。
    pub fn handle(&self, request: &WireRequest) -> Result<Bytes, TransportError> {
        let codec = self.codecs.get(request.serialize_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("server `{}` has no codec for {}", self.name, request.serialize_type),
            )
        })?;
        let response = match codec.decode_request(&request.body) {
            Ok(decoded) => self.dispatch(decoded),
            Err(err) => {
                tracing::warn!(server = %self.name, code = err.code(), "request body rejected");
                WireResponse::from_reply(Err(err))
            }
        };
        codec
            .encode_response(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err).into())
    }

    fn dispatch(&self, request: Request) -> WireResponse {
        let service = request.service().unique_name();
        let Some(chain) = self.services.get(&service) else {
            tracing::warn!(server = %self.name, service = %service, "service not exported");
            return WireResponse::ProviderError {
                code: codes::SERVICE_NOT_FOUND.to_owned(),
                message: format!("service `{service}` is not exported by `{}`", self.name),
            };
        };
        tracing::debug!(
            server = %self.name,
            service = %service,
            method = %request.method(),
            "dispatching request"
        );
        WireResponse::from_reply(chain.invoke(request))
    }
}

impl fmt::Debug for MemServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemServer")
            .field("name", &self.name)
            .field("services", &self.services())
            .finish()
    }
}

/// [`MemServer`] 构建器；过滤器对所有导出服务生效。
pub struct MemServerBuilder {
    name: String,
    codecs: CodecRegistry,
    filters: Vec<Arc<dyn Filter>>,
    excluded: Vec<String>,
    services: Vec<(ServiceIdentity, MethodRouter)>,
}

impl MemServerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codecs: CodecRegistry::default(),
            filters: Vec::new(),
            excluded: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// 服务端排除的过滤器名，`"*"` 排除全部。
    pub fn exclude_filter(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn service(mut self, service: ServiceIdentity, router: MethodRouter) -> Self {
        self.services.push((service, router));
        self
    }

    pub fn build(self) -> Arc<MemServer> {
        let mut services = HashMap::with_capacity(self.services.len());
        for (service, router) in self.services {
            let chain = FilterChainBuilder::new(FilterSide::Provider)
                .for_service(service.clone())
                .filters(self.filters.iter().cloned())
                .exclude(self.excluded.iter().cloned())
                .build(Arc::new(router));
            tracing::debug!(
                server = %self.name,
                service = %service,
                filters = ?chain.filter_names(),
                "service exported"
            );
            services.insert(service.unique_name(), chain);
        }
        Arc::new(MemServer {
            name: self.name,
            codecs: self.codecs,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_rpc::{Argument, Codec, InvokeType, JsonCodec, SerializeType};
    use std::time::Duration;

    fn server() -> Arc<MemServer> {
        MemServer::builder("mem-test")
            .service(
                ServiceIdentity::new("com.example.Echo", "1.0", ""),
                MethodRouter::new().typed("echo", |text: String| Ok(text)),
            )
            .build()
    }

    fn wire(service: ServiceIdentity, method: &str) -> WireRequest {
        let request = Request::new(
            service.clone(),
            method,
            vec![Argument::new("string", serde_json::json!("hi"))],
            SerializeType::JSON,
        )
        .with_invoke_type(InvokeType::Sync);
        WireRequest {
            service: service.unique_name(),
            method: method.to_owned(),
            serialize_type: SerializeType::JSON,
            timeout: Duration::from_secs(1),
            body: JsonCodec.encode_request(&request).unwrap(),
        }
    }

    fn respond(server: &MemServer, request: &WireRequest) -> WireResponse {
        JsonCodec.decode_response(&server.handle(request).unwrap()).unwrap()
    }

    #[test]
    fn exported_service_answers() {
        let response = respond(&server(), &wire(ServiceIdentity::new("com.example.Echo", "1.0", ""), "echo"));
        assert_eq!(
            response,
            WireResponse::Value {
                value: serde_json::json!("hi")
            }
        );
    }

    #[test]
    fn unexported_service_is_a_provider_error() {
        let response = respond(&server(), &wire(ServiceIdentity::new("com.example.Echo", "2.0", ""), "echo"));
        assert!(matches!(
            response,
            WireResponse::ProviderError { code, .. } if code == codes::SERVICE_NOT_FOUND
        ));
    }

    #[test]
    fn garbage_body_is_answered_not_dropped() {
        let mut request = wire(ServiceIdentity::new("com.example.Echo", "1.0", ""), "echo");
        request.body = Bytes::from_static(b"not json");
        let response = respond(&server(), &request);
        assert!(matches!(
            response,
            WireResponse::ProviderError { code, .. } if code == spark_rpc::codes::SERIALIZATION
        ));
    }

    #[test]
    fn missing_codec_fails_the_exchange() {
        let mut request = wire(ServiceIdentity::new("com.example.Echo", "1.0", ""), "echo");
        request.serialize_type = SerializeType::HESSIAN2;
        assert!(matches!(server().handle(&request), Err(TransportError::Io { .. })));
    }
}
