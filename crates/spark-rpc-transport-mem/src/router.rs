use std::{
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde::{Serialize, de::DeserializeOwned};
use spark_rpc::{AppError, Invoker, Reply, Request, RpcError};

use crate::codes;

type Handler = Arc<dyn Fn(&Request) -> Result<Reply, RpcError> + Send + Sync>;

/// 服务端方法表：按方法名把请求分发给处理函数，是服务端过滤器链的末端调用器。
///
/// # 契约说明（What）
/// - 未登记的方法返回 `provider.method_not_found` 框架错误；
/// - 处理函数 panic 被捕获并转换为 `provider.handler_panicked`，不会拖垮传输 I/O 线程；
/// - 处理函数返回的 [`AppError`] 原样作为业务异常回传。
#[derive(Clone, Default)]
pub struct MethodRouter {
    methods: HashMap<String, Handler>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个直接读取完整请求的处理函数。
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> Result<serde_json::Value, AppError> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |request: &Request| {
            Ok(match handler(request) {
                Ok(value) => Reply::Value(value),
                Err(err) => Reply::AppError(err),
            })
        });
        self.methods.insert(name.into(), handler);
        self
    }

    /// 登记一个单参数的类型化处理函数；参数缺省时按 `null` 解码。
    pub fn typed<A, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, AppError> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |request: &Request| {
            let arg: A = match request.args().first() {
                Some(arg) => arg.decode()?,
                None => serde_json::from_value(serde_json::Value::Null).map_err(|err| {
                    RpcError::serialization("missing argument cannot be decoded").with_cause(err)
                })?,
            };
            match handler(arg) {
                Ok(value) => serde_json::to_value(value)
                    .map(Reply::Value)
                    .map_err(|err| RpcError::serialization("failed to encode handler result").with_cause(err)),
                Err(err) => Ok(Reply::AppError(err)),
            }
        });
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRouter")
            .field("methods", &self.method_names())
            .finish()
    }
}

impl Invoker for MethodRouter {
    fn invoke(&self, request: Request) -> Result<Reply, RpcError> {
        let Some(handler) = self.methods.get(request.method()) else {
            return Err(RpcError::provider(
                codes::METHOD_NOT_FOUND,
                format!("method `{}` not found on `{}`", request.method(), request.service()),
            ));
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler(&request))) {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    service = %request.service(),
                    method = %request.method(),
                    "provider handler panicked"
                );
                Err(RpcError::provider(
                    codes::HANDLER_PANICKED,
                    format!("handler for `{}` panicked", request.method()),
                ))
            }
        }
    }
}
