//! 核心错误契约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 生命周期钩子失败后，Actor 进入 FAILED 并需要“长期保留、可被反复查询”的失败原因，
//!   因此错误值必须可克隆、可跨线程传递；
//! - 统一的 `<领域>.<语义>` 错误码让日志、状态快照与测试都能按码断言，而不是匹配文案。
//!
//! ## 契约（What）
//! - [`CoreError`]：稳定错误码 + 人类可读消息 + 可选底层原因 + 可选分类；
//! - [`ErrorCategory`]：供上层决定重试、关闭或放弃的粗粒度分类；
//! - [`codes`]：本工作区使用的全部核心错误码。

use std::{borrow::Cow, error::Error, fmt, sync::Arc, time::Duration};

/// 工作区统一的结果别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// 框架级错误值。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 作为所有 crate 之间传播失败的唯一载体，避免各层自定义错误类型导致的转换地狱；
///
/// ## 逻辑（How）
/// - `cause` 以 `Arc` 持有，使 `CoreError` 可以廉价克隆，FAILED 状态查询不会转移所有权；
/// - `Display` 输出 `[code] message`，便于日志检索。
///
/// ## 契约（What）
/// - `code` 必须来自 [`codes`] 或各 crate 中登记的 `OperationKind`；
/// - `message` 不应包含敏感信息。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl CoreError {
    /// 以错误码与消息构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附加底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 附加错误分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读消息。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 错误分类；未显式设置时视为 [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        self.category.clone().unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("category", &self.category)
            .field("cause", &self.cause.as_ref().map(|cause| cause.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

/// 错误分类，驱动上层的自动化处置策略。
///
/// - `Retryable`：稍后重试可能成功，`after` 为建议等待时长；
/// - `ProtocolViolation`：对端字节流无法识别，连接应关闭且不重试；
/// - 其余分支语义与名称一致。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable { after: Duration },
    NonRetryable,
    ProtocolViolation,
    ResourceExhausted,
    Cancelled,
    Timeout,
}

/// 稳定错误码表。
pub mod codes {
    /// 启动/停止钩子主动报告失败。
    pub const LIFECYCLE_HOOK_FAILED: &str = "spark.lifecycle.hook_failed";
    /// 启动/停止钩子发生 panic。
    pub const LIFECYCLE_HOOK_PANICKED: &str = "spark.lifecycle.hook_panicked";
    /// 钩子完成句柄在未回报结果的情况下被丢弃。
    pub const LIFECYCLE_COMPLETION_DROPPED: &str = "spark.lifecycle.completion_dropped";
    /// 阻塞任务池已关闭。
    pub const BLOCKING_POOL_CLOSED: &str = "spark.dispatch.blocking_pool_closed";
    /// 阻塞任务执行期间 panic。
    pub const BLOCKING_TASK_PANICKED: &str = "spark.dispatch.blocking_task_panicked";
    /// 当前线程不在 Tokio 运行时内。
    pub const RUNTIME_UNAVAILABLE: &str = "spark.dispatch.runtime_unavailable";
    /// 缓冲区耗尽仍无法识别对端协议。
    pub const PROTOCOL_UNIDENTIFIED: &str = "spark.protocol.unidentified";
    /// 协议识别超时。
    pub const PROTOCOL_DETECTION_TIMEOUT: &str = "spark.protocol.detection_timeout";
    /// 协议尚未确定时尝试编码出站消息。
    pub const PROTOCOL_NOT_DETECTED: &str = "spark.protocol.not_detected";
    /// 帧类型与编解码器不匹配。
    pub const PROTOCOL_FRAME_MISMATCH: &str = "spark.protocol.frame_mismatch";
    /// 绑定地址无法解析。
    pub const TRANSPORT_INVALID_URI: &str = "spark.transport.invalid_uri";
    /// 对端关闭连接。
    pub const TRANSPORT_CLOSED: &str = "spark.transport.closed";
}
