use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use spark_rpc::{
    Filter, FilterActivation, FilterDescriptor, Invoker, Outcome, Reply, Request, RequestHead,
    RpcError,
};

/// 请求附件中的追踪标识键。
pub const TRACE_ID_ATTACHMENT: &str = "rpc.trace_id";

/// 为每次调用打开一个 `tracing` span，并输出结构化的终态事件。
///
/// # 教案式说明
/// - **意图（Why）**：一次调用跨越调用线程、I/O 线程与定时器线程，只有统一的追踪标识才能把
///   这些日志串起来；标识写入附件后随请求到达服务端。
/// - **逻辑（How）**：请求未携带 `rpc.trace_id` 时生成一个；span 覆盖向内调用的全过程；
///   同步终态在回溯时记录，异步终态经 `on_async_response` 在完成线程上记录。
/// - **契约（What）**：只读写 `rpc.trace_id` 附件，不改变调用结果；两侧均可装配。
#[derive(Debug)]
pub struct TracingFilter {
    order: i32,
    seq: AtomicU64,
}

impl TracingFilter {
    pub fn new() -> Self {
        Self::with_order(crate::order::TRACING)
    }

    pub fn with_order(order: i32) -> Self {
        Self {
            order,
            seq: AtomicU64::new(0),
        }
    }

    fn next_trace_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}{:08x}", nanos, seq as u32)
    }
}

impl Default for TracingFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for TracingFilter {
    fn descriptor(&self) -> FilterDescriptor {
        FilterDescriptor::new("tracing", self.order).with_activation(FilterActivation::Both)
    }

    fn invoke(&self, next: &dyn Invoker, mut request: Request) -> Result<Reply, RpcError> {
        let trace_id = match request.attachment(TRACE_ID_ATTACHMENT) {
            Some(existing) => existing.to_owned(),
            None => {
                let generated = self.next_trace_id();
                request.set_attachment(TRACE_ID_ATTACHMENT, generated.clone());
                generated
            }
        };
        let span = tracing::info_span!(
            "rpc.invoke",
            service = %request.service(),
            method = %request.method(),
            invoke_type = request.invoke_type().as_str(),
            trace_id = %trace_id,
        );
        let _entered = span.enter();
        let started = Instant::now();
        let result = next.invoke(request);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(Reply::Value(_)) => tracing::debug!(elapsed_ms, "invocation succeeded"),
            Ok(Reply::AppError(err)) => tracing::info!(
                elapsed_ms,
                error_type = %err.type_name,
                "invocation raised application error"
            ),
            Ok(Reply::Pending(_)) => tracing::debug!(elapsed_ms, "invocation dispatched"),
            Err(err) => tracing::warn!(
                elapsed_ms,
                code = err.code(),
                category = ?err.category(),
                "invocation failed: {}",
                err.message()
            ),
        }
        result
    }

    fn on_async_response(&self, head: &RequestHead, outcome: &Outcome) {
        let trace_id = head
            .attachments
            .get(TRACE_ID_ATTACHMENT)
            .map(String::as_str)
            .unwrap_or("-");
        match outcome {
            Outcome::Framework(err) => tracing::warn!(
                service = %head.service,
                method = %head.method,
                trace_id,
                code = err.code(),
                "async invocation failed: {}",
                err.message()
            ),
            other => tracing::debug!(
                service = %head.service,
                method = %head.method,
                trace_id,
                outcome = other.label(),
                "async invocation completed"
            ),
        }
    }
}
