use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use crate::{
    error::{Result, RpcError},
    request::{InvokeType, ServiceIdentity},
};

/// 未配置任何超时时的协议默认值。
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_millis(3000);

/// 未配置版本时使用的服务版本。
pub const DEFAULT_VERSION: &str = "1.0";

/// 默认序列化名称。
pub const DEFAULT_SERIALIZATION: &str = "hessian2";

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

fn default_serialization() -> String {
    DEFAULT_SERIALIZATION.to_owned()
}

/// 方法级覆盖配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodConfig {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub invoke_type: Option<InvokeType>,
}

/// 服务引用配置：描述“调用谁、怎么调用”。
///
/// # 契约说明（What）
/// - `interface` 必填；`version` 默认 `1.0`；`serialization` 默认 `hessian2`；
/// - `direct_url` 非空时绕过注册中心直连，多个地址以逗号分隔；
/// - `exclude_filters` 中的名称不会装配进过滤器链，`*` 表示排除全部；
/// - `methods.<name>` 为方法级覆盖，优先级高于引用级。
///
/// 构建完成后配置被冻结在 [`ClientProxyInvoker`](crate::ClientProxyInvoker) 中，
/// 调用路径只读、不修改。
///
/// ```toml
/// interface = "com.example.EchoService"
/// serialization = "json"
/// timeout_ms = 1500
/// direct_url = "mem://echo"
///
/// [methods.slow]
/// timeout_ms = 50
/// invoke_type = "future"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceConfig {
    pub interface: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
    #[serde(default)]
    pub invoke_type: InvokeType,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub direct_url: Option<String>,
    #[serde(default)]
    pub exclude_filters: Vec<String>,
    #[serde(default)]
    pub methods: BTreeMap<String, MethodConfig>,
}

impl ReferenceConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            version: default_version(),
            unique_id: String::new(),
            serialization: default_serialization(),
            invoke_type: InvokeType::Sync,
            timeout_ms: None,
            direct_url: None,
            exclude_filters: Vec::new(),
            methods: BTreeMap::new(),
        }
    }

    /// 从 TOML 文本加载，解析失败映射为配置错误。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ReferenceConfig = toml::from_str(text).map_err(|err| {
            RpcError::configuration("malformed reference configuration").with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn with_serialization(mut self, serialization: impl Into<String>) -> Self {
        self.serialization = serialization.into();
        self
    }

    pub fn with_invoke_type(mut self, invoke_type: InvokeType) -> Self {
        self.invoke_type = invoke_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(duration_to_millis(timeout));
        self
    }

    pub fn with_direct_url(mut self, url: impl Into<String>) -> Self {
        self.direct_url = Some(url.into());
        self
    }

    pub fn exclude_filter(mut self, name: impl Into<String>) -> Self {
        self.exclude_filters.push(name.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>, config: MethodConfig) -> Self {
        self.methods.insert(method.into(), config);
        self
    }

    /// 基本合法性校验。
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(RpcError::configuration("reference interface must not be empty"));
        }
        if self.timeout_ms == Some(0) {
            return Err(RpcError::configuration("reference timeout_ms must be positive"));
        }
        if let Some((name, _)) = self
            .methods
            .iter()
            .find(|(_, method)| method.timeout_ms == Some(0))
        {
            return Err(RpcError::configuration(format!(
                "timeout_ms of method `{name}` must be positive"
            )));
        }
        Ok(())
    }

    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(&self.interface, &self.version, &self.unique_id)
    }

    /// 直连地址列表。
    pub fn direct_urls(&self) -> Vec<String> {
        self.direct_url
            .as_deref()
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 引用级超时，未配置时回退协议默认值。
    pub fn reference_timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INVOKE_TIMEOUT)
    }

    /// 方法的有效设置：方法级 > 引用级 > 默认。
    pub fn method_settings(&self, method: &str) -> MethodSettings {
        let overrides = self.methods.get(method);
        MethodSettings {
            timeout: overrides
                .and_then(|m| m.timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.reference_timeout()),
            invoke_type: overrides
                .and_then(|m| m.invoke_type)
                .unwrap_or(self.invoke_type),
        }
    }
}

/// 方法在构建期解析出的有效设置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodSettings {
    pub timeout: Duration,
    pub invoke_type: InvokeType,
}

/// 调用期的超时决议：上下文覆盖 > 方法级/引用级设置。
pub fn effective_timeout(context_override: Option<Duration>, settings: &MethodSettings) -> Duration {
    context_override.unwrap_or(settings.timeout)
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
