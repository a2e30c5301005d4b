use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    error::{Result, RpcError},
    request::Request,
    response::WireResponse,
    serialization::SerializeType,
};

/// 请求与响应的线上编解码契约。
///
/// # 契约说明（What）
/// - 实现必须无状态或内部同步，同一实例会被多个调用线程与 I/O 线程并发使用；
/// - 任何编解码失败映射为 `RpcErrorKind::Serialization`；
/// - [`serialize_type`](Self::serialize_type) 与请求携带的序列化码一致，服务端据此选择解码器。
pub trait Codec: Send + Sync + 'static {
    fn serialize_type(&self) -> SerializeType;

    fn encode_request(&self, request: &Request) -> Result<Bytes>;

    fn decode_request(&self, bytes: &[u8]) -> Result<Request>;

    fn encode_response(&self, response: &WireResponse) -> Result<Bytes>;

    fn decode_response(&self, bytes: &[u8]) -> Result<WireResponse>;
}

/// 基于 `serde_json` 的编解码器，序列化码 12。
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize_type(&self) -> SerializeType {
        SerializeType::JSON
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|err| RpcError::serialization("failed to encode request").with_cause(err))
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<Request> {
        serde_json::from_slice(bytes)
            .map_err(|err| RpcError::serialization("failed to decode request").with_cause(err))
    }

    fn encode_response(&self, response: &WireResponse) -> Result<Bytes> {
        serde_json::to_vec(response)
            .map(Bytes::from)
            .map_err(|err| RpcError::serialization("failed to encode response").with_cause(err))
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<WireResponse> {
        serde_json::from_slice(bytes)
            .map_err(|err| RpcError::serialization("failed to decode response").with_cause(err))
    }
}

/// 按序列化码索引的编解码器集合。
///
/// 默认只注册 [`JsonCodec`]；hessian2 等其他格式由使用方按需注册。
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<u8, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// 空注册表。
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// 注册编解码器，同一序列化码后注册者覆盖先注册者。
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(codec.serialize_type().code(), codec);
        self
    }

    /// 以另一序列化码注册同一实现，用于测试或格式兼容场景。
    pub fn register_as(&mut self, serialize_type: SerializeType, codec: Arc<dyn Codec>) -> &mut Self {
        self.codecs.insert(serialize_type.code(), codec);
        self
    }

    pub fn get(&self, serialize_type: SerializeType) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&serialize_type.code()).cloned()
    }

    /// 查找编解码器，缺失时返回配置错误。
    pub fn require(&self, serialize_type: SerializeType) -> Result<Arc<dyn Codec>> {
        self.get(serialize_type).ok_or_else(|| {
            RpcError::configuration(format!(
                "no codec registered for serialization `{serialize_type}`"
            ))
        })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonCodec));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<_> = self.codecs.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("CodecRegistry").field("codes", &codes).finish()
    }
}
