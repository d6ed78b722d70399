#![deny(unsafe_code)]
//! # spark-transport-tcp
//!
//! ## 设计动机（Why）
//! - 为 Broker 连接核心提供真实的 TCP 介质：监听服务负责接入与暂停，
//!   连接负责读闸门、编解码与有界写缓冲；
//!
//! ## 核心契约（What）
//! - [`TcpServer`]：实现 [`spark_transport::TransportServer`]，逐个接入并等待确认，支持暂停/恢复；
//! - [`TcpTransport`]：实现 [`spark_transport::Transport`]，读写各由一个 Tokio 任务驱动；
//! - [`TcpServerFactory`]：按 `tcp://` scheme 创建监听服务。
//!
//! ## 实现策略（How）
//! - 套接字选项（缓冲区大小、backlog）通过 `socket2` 在绑定前设置；
//! - I/O 错误统一映射为带稳定错误码的 [`CoreError`](spark_core::CoreError)。
//!
//! ## 风险与考量（Trade-offs）
//! - 回调投递到执行上下文后才执行，事件处理存在一次任务切换的延迟。

mod backpressure;
mod error;
#[cfg(feature = "runtime-tokio")]
mod listener;
#[cfg(feature = "runtime-tokio")]
mod transport;

pub use backpressure::{DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER};
pub use error::codes;
#[cfg(feature = "runtime-tokio")]
pub use listener::{TcpServer, TcpServerFactory};
#[cfg(feature = "runtime-tokio")]
pub use transport::TcpTransport;

/// 监听服务与其接入连接共享的选项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpOptions {
    /// `listen` 的 backlog 长度。
    pub backlog: i32,
    /// 是否关闭 Nagle 算法。
    pub nodelay: bool,
    /// 写缓冲区高水位（字节）。
    pub write_high_water: usize,
    /// 写缓冲区低水位（字节）。
    pub write_low_water: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            nodelay: true,
            write_high_water: DEFAULT_HIGH_WATER,
            write_low_water: DEFAULT_LOW_WATER,
        }
    }
}
