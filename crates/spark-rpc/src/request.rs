use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{Result, RpcError},
    serialization::SerializeType,
};

/// 附件：随请求跨线传播的键值元数据。
pub type Attachments = BTreeMap<String, String>;

/// 目标服务标识：接口名 + 版本 + 可选唯一 ID。
///
/// `unique_name` 在构造时计算一次，调用路径只读取缓存值。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    interface: String,
    version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    unique_id: String,
}

impl ServiceIdentity {
    pub fn new(
        interface: impl Into<String>,
        version: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            version: version.into(),
            unique_id: unique_id.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// 服务唯一名：`interface:version`，存在唯一 ID 时追加 `:unique_id`。
    pub fn unique_name(&self) -> String {
        if self.unique_id.is_empty() {
            format!("{}:{}", self.interface, self.version)
        } else {
            format!("{}:{}:{}", self.interface, self.version, self.unique_id)
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_name())
    }
}

/// 调用方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeType {
    /// 阻塞等待终态。
    #[default]
    Sync,
    /// 立即返回 [`ResponseFuture`](crate::ResponseFuture)。
    Future,
    /// 立即返回，终态交付注册的回调。
    Callback,
    /// 单向发送，不关心响应。
    Oneway,
}

impl InvokeType {
    pub fn as_str(self) -> &'static str {
        match self {
            InvokeType::Sync => "sync",
            InvokeType::Future => "future",
            InvokeType::Callback => "callback",
            InvokeType::Oneway => "oneway",
        }
    }

    /// 是否在分发后立即返回。
    pub fn is_async(self) -> bool {
        matches!(self, InvokeType::Future | InvokeType::Callback)
    }
}

/// 单个调用参数：声明类型 + 值。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub type_name: String,
    pub value: serde_json::Value,
}

impl Argument {
    pub fn new(type_name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    /// 以 Rust 类型名作为声明类型序列化任意值。
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(|err| {
            RpcError::serialization("failed to serialize argument").with_cause(err)
        })?;
        Ok(Self::new(std::any::type_name::<T>(), value))
    }

    /// 反序列化为目标类型，供服务端处理器使用。
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.value.clone()).map_err(|err| {
            RpcError::serialization(format!("argument of type `{}` is malformed", self.type_name))
                .with_cause(err)
        })
    }
}

/// 一次逻辑调用的完整请求。
///
/// # 契约说明（What）
/// - 每次调用新建，进入过滤器链前由调用线程独占；过滤器可在向内传递前修改附件与超时；
/// - 交给传输调用器后被编码为线上字节，原对象不再被并发修改。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    service: ServiceIdentity,
    method: String,
    args: Vec<Argument>,
    serialize_type: SerializeType,
    timeout: Duration,
    #[serde(default)]
    invoke_type: InvokeType,
    #[serde(default)]
    attachments: Attachments,
}

impl Request {
    pub fn new(
        service: ServiceIdentity,
        method: impl Into<String>,
        args: Vec<Argument>,
        serialize_type: SerializeType,
    ) -> Self {
        Self {
            service,
            method: method.into(),
            args,
            serialize_type,
            timeout: crate::config::DEFAULT_INVOKE_TIMEOUT,
            invoke_type: InvokeType::Sync,
            attachments: Attachments::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn with_invoke_type(mut self, invoke_type: InvokeType) -> Self {
        self.invoke_type = invoke_type;
        self
    }

    pub fn with_attachments(mut self, attachments: Attachments) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    pub fn serialize_type(&self) -> SerializeType {
        self.serialize_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn invoke_type(&self) -> InvokeType {
        self.invoke_type
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    pub fn remove_attachment(&mut self, key: &str) -> Option<String> {
        self.attachments.remove(key)
    }

    /// 不含参数的请求摘要，随异步续延跨线程传递。
    pub fn head(&self) -> RequestHead {
        RequestHead {
            service: self.service.clone(),
            method: self.method.clone(),
            invoke_type: self.invoke_type,
            timeout: self.timeout(),
            attachments: self.attachments.clone(),
        }
    }
}

/// 请求摘要：异步终态通知（过滤器 `on_async_response` 与用户回调）所需的只读信息。
#[derive(Clone, Debug, PartialEq)]
pub struct RequestHead {
    pub service: ServiceIdentity,
    pub method: String,
    pub invoke_type: InvokeType,
    pub timeout: Duration,
    pub attachments: Attachments,
}
