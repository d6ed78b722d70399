//! 协议能力、协议处理器与协议注册表。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 具体协议（STOMP、AMQP……）由外部提供，本 crate 只需要三样东西：协议标识、可识别的魔数签名，
//!   以及为每条连接创建编解码器与处理器的工厂；
//! - 协议行为以注入的策略对象（[`ProtocolHandler`]）提供，连接本身不因协议而派生子类型。
//!
//! ## 契约（What）
//! - [`Protocol`]：协议能力；签名为空的协议不参与自动识别；
//! - [`ProtocolHandler`]：在连接的执行上下文上接收连接事件；
//! - [`HandlerContext`]：回调期间可用的连接操作，包括替换处理器与请求关闭；
//! - [`ProtocolRegistry`]：按注册顺序保存协议，查找失败返回 [`BrokerError::UnknownProtocol`]。

mod negotiator;

pub use negotiator::{DetectionBuffer, NegotiatingCodec, NegotiatingHandler};

use crate::{connection::BrokerConnection, error::BrokerError, sink::TransportSink};
use spark_core::CoreError;
use spark_transport::{Frame, ProtocolCodec, Transport, TransportSocketAddr};
use std::{fmt, sync::Arc};

/// 表示“自动识别”的协议标识。
pub const ANY_PROTOCOL: &str = "any";

/// 创建编解码器时可见的连接器信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: String,
    pub local_addr: Option<TransportSocketAddr>,
}

/// 外部提供的协议能力。
pub trait Protocol: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// 连接最初几个字节的魔数；`None` 表示不可自动识别。
    fn signature(&self) -> Option<&[u8]> {
        None
    }

    fn signature_len(&self) -> usize {
        self.signature().map_or(0, <[u8]>::len)
    }

    /// `prefix` 是否以本协议的签名开头；前缀短于签名时不匹配。
    fn matches(&self, prefix: &[u8]) -> bool {
        self.signature()
            .is_some_and(|signature| prefix.len() >= signature.len() && prefix.starts_with(signature))
    }

    fn create_handler(&self) -> Box<dyn ProtocolHandler>;

    fn create_codec(&self, connector: &ConnectorInfo) -> Box<dyn ProtocolCodec>;
}

/// 连接的协议处理策略。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 全部回调都在所属连接的执行上下文上串行调用，期间持有连接状态；
/// - 回调中不得同步等待本连接的其他任务；需要延后执行时使用
///   [`BrokerConnection::schedule_once`]；
/// - `on_connected` 的默认实现打开读闸门：传输启动后默认不读，处理器就绪后才开始读。
pub trait ProtocolHandler: Send + 'static {
    fn protocol(&self) -> &str;

    fn on_connected(&mut self, cx: &mut HandlerContext<'_>) {
        cx.transport().resume_read();
    }

    fn on_frame(&mut self, cx: &mut HandlerContext<'_>, frame: Frame);

    fn on_protocol_detected(&mut self, cx: &mut HandlerContext<'_>, protocol: &str) {
        let _ = (cx, protocol);
    }

    /// 传输写缓冲区回落到低水位以下。
    fn on_refill(&mut self, cx: &mut HandlerContext<'_>) {
        let _ = cx;
    }

    fn on_failure(&mut self, cx: &mut HandlerContext<'_>, error: &CoreError) {
        let _ = (cx, error);
    }

    fn on_disconnected(&mut self, cx: &mut HandlerContext<'_>) {
        let _ = cx;
    }

    /// 协议层会话标识，出现在连接状态快照中。
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// 处理器回调期间可用的连接操作。
pub struct HandlerContext<'a> {
    connection: &'a BrokerConnection,
    transport: &'a Arc<dyn Transport>,
    replacement: Option<Box<dyn ProtocolHandler>>,
    stop_requested: bool,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(connection: &'a BrokerConnection, transport: &'a Arc<dyn Transport>) -> Self {
        Self {
            connection,
            transport,
            replacement: None,
            stop_requested: false,
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        self.connection
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.transport
    }

    /// 以本连接的传输为终点的出站节点。
    pub fn sink(&self) -> TransportSink {
        TransportSink::new(Arc::clone(self.transport))
    }

    /// 当前回调返回后改用 `handler`，新处理器随即收到 `on_connected`。
    pub fn replace_handler(&mut self, handler: Box<dyn ProtocolHandler>) {
        self.replacement = Some(handler);
    }

    /// 当前回调返回后异步停止连接。
    pub fn stop_connection(&mut self) {
        self.stop_requested = true;
    }

    pub(crate) fn into_parts(self) -> (Option<Box<dyn ProtocolHandler>>, bool) {
        (self.replacement, self.stop_requested)
    }
}

impl fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("connection", &self.connection.id())
            .field("replacement", &self.replacement.as_ref().map(|h| h.protocol().to_owned()))
            .field("stop_requested", &self.stop_requested)
            .finish()
    }
}

/// 按注册顺序保存的协议目录。
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记协议；标识重复或使用保留标识 `any` 时拒绝。
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) -> Result<(), BrokerError> {
        let id = protocol.id();
        if id == ANY_PROTOCOL {
            return Err(BrokerError::InvalidConfig(format!(
                "protocol id `{ANY_PROTOCOL}` is reserved for detection"
            )));
        }
        if self.protocols.iter().any(|existing| existing.id() == id) {
            return Err(BrokerError::DuplicateProtocol(id.to_owned()));
        }
        self.protocols.push(protocol);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Protocol>, BrokerError> {
        self.protocols
            .iter()
            .find(|protocol| protocol.id() == id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownProtocol(id.to_owned()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.protocols.iter().map(|protocol| protocol.id()).collect()
    }

    /// 可自动识别的候选协议，保持注册顺序。
    ///
    /// `filter` 只做限制：重复项被忽略，未知或不可识别的标识输出告警后忽略。
    pub fn detectable(&self, filter: Option<&[String]>) -> Vec<Arc<dyn Protocol>> {
        if let Some(filter) = filter {
            for id in filter {
                match self.get(id) {
                    Ok(protocol) if protocol.signature_len() == 0 => {
                        tracing::warn!(protocol = %id, "protocol has no signature; excluded from detection");
                    }
                    Ok(_) => {}
                    Err(_) => {
                        tracing::warn!(protocol = %id, "unknown protocol in detection filter; ignored");
                    }
                }
            }
        }
        self.protocols
            .iter()
            .filter(|protocol| protocol.signature_len() > 0)
            .filter(|protocol| {
                filter.is_none_or(|allowed| allowed.iter().any(|id| id == protocol.id()))
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
