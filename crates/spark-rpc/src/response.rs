use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, CallError, RpcError},
    future::ResponseFuture,
};

/// 一次调用的终态：业务返回值、业务异常、框架错误三者恰有其一。
#[derive(Clone, Debug)]
pub enum Outcome {
    Value(serde_json::Value),
    AppError(AppError),
    Framework(RpcError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    /// 终态的观测标签。
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Value(_) => "value",
            Outcome::AppError(_) => "app_error",
            Outcome::Framework(_) => "framework_error",
        }
    }

    /// 转换为调用方视角的结果。
    pub fn into_result(self) -> Result<serde_json::Value, CallError> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::AppError(err) => Err(CallError::Application(err)),
            Outcome::Framework(err) => Err(CallError::Framework(err)),
        }
    }

    /// 转换为过滤器链的返回形态：框架错误走 `Err`，业务终态走 `Reply`。
    pub fn into_reply(self) -> Result<Reply, RpcError> {
        match self {
            Outcome::Value(value) => Ok(Reply::Value(value)),
            Outcome::AppError(err) => Ok(Reply::AppError(err)),
            Outcome::Framework(err) => Err(err),
        }
    }
}

/// 过滤器链中每个调用器的返回值。
///
/// 同步调用时过滤器在回溯阶段看到真实终态（`Value`/`AppError`）；
/// 异步调用时看到 `Pending`，真实终态随后经 `Filter::on_async_response` 通知。
#[derive(Clone, Debug)]
pub enum Reply {
    Value(serde_json::Value),
    AppError(AppError),
    Pending(ResponseFuture),
}

impl Reply {
    pub fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending(_))
    }
}

/// 服务端写回的线上响应体。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireResponse {
    Value { value: serde_json::Value },
    AppError { error: AppError },
    ProviderError { code: String, message: String },
}

impl WireResponse {
    /// 客户端侧还原终态；服务端框架错误映射为 `RpcErrorKind::Provider`。
    pub fn into_outcome(self) -> Outcome {
        match self {
            WireResponse::Value { value } => Outcome::Value(value),
            WireResponse::AppError { error } => Outcome::AppError(error),
            WireResponse::ProviderError { code, message } => {
                Outcome::Framework(RpcError::provider(code, message))
            }
        }
    }

    /// 服务端侧由过滤器链的结果构造响应体。
    pub fn from_reply(result: Result<Reply, RpcError>) -> Self {
        match result {
            Ok(Reply::Value(value)) => WireResponse::Value { value },
            Ok(Reply::AppError(error)) => WireResponse::AppError { error },
            Ok(Reply::Pending(_)) => WireResponse::ProviderError {
                code: "provider.async_unsupported".to_owned(),
                message: "provider chain returned a pending reply".to_owned(),
            },
            Err(err) => {
                let code = match err.kind() {
                    crate::error::RpcErrorKind::Provider { code } => code.clone(),
                    _ => err.code().to_owned(),
                };
                WireResponse::ProviderError {
                    code,
                    message: err.message().to_owned(),
                }
            }
        }
    }
}
