#![deny(unsafe_code)]
//! # spark-transport
//!
//! ## 设计动机（Why）
//! - Broker 的连接核心只需要“原始字节流 + 可替换的编解码器 + 可暂停的监听服务”三项能力，
//!   具体介质（TCP、内存管道）由实现 crate 提供；
//!
//! ## 核心契约（What）
//! - [`Transport`] / [`TransportListener`]：单条连接的读写、背压与事件回调；
//! - [`TransportServer`] / [`AcceptListener`] / [`AcceptAck`]：监听、暂停与逐个确认的接入流程；
//! - [`ProtocolCodec`] / [`Decoded`]：字节到帧的双向转换，支持运行期切换到另一个编解码器；
//! - [`BindUri`] / [`TransportSocketAddr`]：`scheme://host:port` 绑定地址与结构化套接字地址。
//!
//! ## 实现策略（How）
//! - 所有回调都在调用方设置的 [`ExecutionContext`](spark_core::ExecutionContext) 上执行，
//!   实现 crate 只负责把 I/O 事件投递过去；
//! - [`drain_decoded`] 统一了“解码直到需要更多字节或发生协议切换”的循环，供各实现复用。
//!
//! ## 风险与考量（Trade-offs）
//! - 帧以 `Box<dyn Any>` 承载，协议之间的类型约定由编解码器与处理器双方自行保证。

mod addr;
mod codec;
mod frame;
mod server;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use addr::{BindUri, TransportSocketAddr};
pub use codec::{Decoded, ProtocolCodec, PushbackBuffer, ReadEvent, drain_decoded};
pub use frame::Frame;
pub use server::{
    AcceptAck, AcceptListener, BufferSizes, ServerFactory, StartCallback, TransportServer,
};
pub use transport::{StatsRecorder, Transport, TransportListener, TransportStats};
