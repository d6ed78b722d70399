//! 进程级日志安装入口。
//!
//! - 组装 `EnvFilter + fmt` 两层并设为全局 Subscriber；过滤规则取自 `RUST_LOG`，缺省为 `info`；
//! - 重复安装或外部已设置 Subscriber 时返回 [`LoggingError`]，不会 panic。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Debug, Error)]
pub enum LoggingError {
    /// 全局 Subscriber 已存在（可能由本函数或宿主设置）。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to install tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局日志 Subscriber。
pub fn install() -> Result<(), LoggingError> {
    if dispatcher::has_been_set() {
        return Err(LoggingError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
