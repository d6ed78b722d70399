#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
//! # spark-broker
//!
//! ## 设计动机（Why）
//! - 消息 Broker 的连接处理核心：监听端口、限制并发连接、识别每条连接讲的协议，并为出站写入提供背压；
//! - 具体协议（STOMP、AMQP……）与具体传输（TCP、内存管道）都以 trait 注入，本 crate 只负责编排。
//!
//! ## 核心契约（What）
//! - [`broker`]：[`Broker`] Actor 持有全部连接器与连接，发布无锁读取的 [`BrokerSnapshot`]；
//! - [`connector`]：[`AcceptingConnector`] 负责绑定、准入控制（连接上限下暂停/恢复接受）与协议装配；
//! - [`connection`]：[`BrokerConnection`] 把传输事件串行地交给可替换的 [`ProtocolHandler`]；
//! - [`protocol`]：协议能力、注册表与 `any` 自动识别；
//! - [`sink`]：`offer / full / refill` 背压链；
//! - [`tuner`]：按堆预算与近期峰值连接数推算套接字缓冲区大小；
//! - [`config`] / [`error`] / [`status`] / [`registry`] / [`logging`]：配置、错误、状态快照、
//!   进程级注册表与日志安装。
//!
//! ## 实现策略（How）
//! - Broker、连接器、连接都是 [`spark_core::Actor`]：各自拥有一个执行上下文，彼此只通过投递任务交互；
//! - 所有权单向：Broker → 连接器 / 连接；反向通知一律经弱引用投递。
//!
//! ## 风险与考量（Trade-offs）
//! - 快照是最终一致的：读到的连接数可能落后于 Broker 上下文中尚未处理的任务。

pub mod broker;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod status;
pub mod tuner;

pub use broker::{Broker, BrokerBuilder, BrokerSnapshot};
pub use config::{AcceptingConnectorConfig, BrokerConfig, ConnectorConfig, DetectConfig, ProtocolConfig};
pub use connection::BrokerConnection;
pub use connector::{AcceptingConnector, ConnectionOwner, ConnectorServices, LocalConnections};
pub use error::BrokerError;
pub use protocol::{HandlerContext, Protocol, ProtocolHandler, ProtocolRegistry};
pub use registry::BrokerRegistry;
pub use sink::{Sink, SinkExt};
pub use status::{BrokerStatus, ConnectionStatus, ConnectorStatus};
