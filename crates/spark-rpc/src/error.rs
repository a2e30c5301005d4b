use std::{borrow::Cow, error::Error, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// 稳定错误码集合。
///
/// # 设计背景（Why）
/// - 日志、指标与外层重试器按错误码聚合，码值一经发布不可修改；
/// - 统一遵循 `rpc.<语义>` 命名，便于与传输层 `spark.transport.*` 码值区分。
pub mod codes {
    /// 调用在截止时间内未收到终态。
    pub const TIMEOUT: &str = "rpc.timeout";
    /// 建连失败或对端不可达。
    pub const CONNECTION: &str = "rpc.connection";
    /// 建连后的读写失败、连接被关闭。
    pub const TRANSPORT: &str = "rpc.transport";
    /// 请求或响应编解码失败。
    pub const SERIALIZATION: &str = "rpc.serialization";
    /// 无可用地址或路由失败。
    pub const ROUTING: &str = "rpc.routing";
    /// 引用配置不合法（序列化类型不支持、目标不可解析等）。
    pub const CONFIGURATION: &str = "rpc.configuration";
    /// 服务端框架错误（服务或方法不存在等）。
    pub const PROVIDER: &str = "rpc.provider";
    /// 熔断器处于打开状态。
    pub const CIRCUIT_OPEN: &str = "rpc.circuit_open";
    /// 过滤器主动中止调用。
    pub const FILTER: &str = "rpc.filter";
    /// 进程或定时器关闭导致调用被放弃。
    pub const SHUTDOWN: &str = "rpc.shutdown";
}

/// 错误的处置分类，外层重试/熔断组件据此决策，而无需解析错误码。
///
/// - `Retryable`：瞬时故障（连接、传输），换地址或稍后重试可能成功；
/// - `Timeout`：与连接失败区分，远端可能仍在执行，重试需业务自行保证幂等；
/// - `NonRetryable`：配置、编解码、业务路由等确定性失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
    Timeout,
}

/// 框架错误的种类。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum RpcErrorKind {
    /// 截止时间耗尽；携带已消耗时长与配置预算，便于排障。
    Timeout { elapsed: Duration, budget: Duration },
    Connection,
    Transport,
    Serialization,
    Routing,
    Configuration,
    /// 服务端返回的框架错误，`code` 为服务端给出的稳定码值。
    Provider { code: String },
    CircuitOpen,
    Filter,
    Shutdown,
}

impl RpcErrorKind {
    /// 种类对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RpcErrorKind::Timeout { .. } => codes::TIMEOUT,
            RpcErrorKind::Connection => codes::CONNECTION,
            RpcErrorKind::Transport => codes::TRANSPORT,
            RpcErrorKind::Serialization => codes::SERIALIZATION,
            RpcErrorKind::Routing => codes::ROUTING,
            RpcErrorKind::Configuration => codes::CONFIGURATION,
            RpcErrorKind::Provider { .. } => codes::PROVIDER,
            RpcErrorKind::CircuitOpen => codes::CIRCUIT_OPEN,
            RpcErrorKind::Filter => codes::FILTER,
            RpcErrorKind::Shutdown => codes::SHUTDOWN,
        }
    }

    /// 种类的默认处置分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcErrorKind::Timeout { .. } => ErrorCategory::Timeout,
            RpcErrorKind::Connection | RpcErrorKind::Transport | RpcErrorKind::CircuitOpen => {
                ErrorCategory::Retryable
            }
            _ => ErrorCategory::NonRetryable,
        }
    }
}

/// 底层原因；以 `Arc` 共享，使 [`RpcError`] 可克隆并同时交付给 Future 的多个观察者。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// `RpcError` 表示源自 RPC 基础设施的框架错误，与远端业务异常 [`AppError`] 严格区分。
///
/// # 设计背景（Why）
/// - 调用方与外层重试器需要稳定、可区分的错误种类：超时、连接失败、配置错误各自对应不同处置；
/// - 同一终态可能被 `get` 调用者、监听器与用户回调同时观察，因此错误必须廉价可克隆。
///
/// # 契约说明（What）
/// - `kind`：错误种类，决定 [`code`](Self::code) 与 [`category`](Self::category)；
/// - `message`：面向排障人员的描述，不含敏感信息；
/// - `cause`：可选底层原因，通过 [`Error::source`] 暴露。
///
/// # 风险提示（Trade-offs）
/// - `message` 以 `Cow` 保存，静态文案零分配；动态文案会产生一次堆分配。
#[derive(Clone)]
pub struct RpcError {
    kind: RpcErrorKind,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl RpcError {
    /// 构造框架错误。
    pub fn new(kind: RpcErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// 超时错误，消息中同时给出已耗时与预算。
    pub fn timeout(elapsed: Duration, budget: Duration) -> Self {
        Self::new(
            RpcErrorKind::Timeout { elapsed, budget },
            format!("invocation timed out after {elapsed:?} (budget {budget:?})"),
        )
    }

    pub fn connection(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Connection, message)
    }

    pub fn transport(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Transport, message)
    }

    pub fn serialization(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Serialization, message)
    }

    pub fn routing(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Routing, message)
    }

    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Configuration, message)
    }

    pub fn provider(code: impl Into<String>, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Provider { code: code.into() }, message)
    }

    pub fn shutdown(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(RpcErrorKind::Shutdown, message)
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> &RpcErrorKind {
        &self.kind
    }

    /// 稳定错误码，见 [`codes`]。
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 处置分类；外层重试器只应依据该值判断是否重试。
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, RpcErrorKind::Timeout { .. })
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Retryable
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcError")
            .field("code", &self.code())
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|cause| cause.to_string()))
            .finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl Error for RpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 远端业务方法抛出的应用异常，原样交付调用方，框架不包装、不重试。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{type_name}: {message}")]
pub struct AppError {
    /// 业务异常的类型标识，例如 `com.example.OrderNotFound`。
    pub type_name: String,
    pub message: String,
    /// 可选的结构化详情。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// 调用方最终看到的失败：业务异常或框架错误，二者互斥。
#[derive(Clone, Debug, thiserror::Error)]
pub enum CallError {
    #[error("application error: {0}")]
    Application(AppError),
    #[error(transparent)]
    Framework(RpcError),
}

impl CallError {
    /// 若为框架错误则返回其引用。
    pub fn as_framework(&self) -> Option<&RpcError> {
        match self {
            CallError::Framework(err) => Some(err),
            CallError::Application(_) => None,
        }
    }

    pub fn as_application(&self) -> Option<&AppError> {
        match self {
            CallError::Application(err) => Some(err),
            CallError::Framework(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.as_framework().is_some_and(RpcError::is_timeout)
    }
}

impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        CallError::Framework(err)
    }
}

impl From<AppError> for CallError {
    fn from(err: AppError) -> Self {
        CallError::Application(err)
    }
}

/// 框架统一的返回值别名。
pub type Result<T, E = RpcError> = std::result::Result<T, E>;
