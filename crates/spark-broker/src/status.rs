//! 连接、连接器与 Broker 的只读状态快照。
//!
//! 快照总是在被观察对象自己的执行上下文中生成，再交给调用方；生成之后不再随对象变化。

use spark_core::ServiceState;
use spark_transport::{TransportSocketAddr, TransportStats};
use std::time::SystemTime;

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionStatus {
    pub id: u64,
    pub state: ServiceState,
    /// 进入当前状态的时刻。
    pub since: SystemTime,
    /// 当前处理器的协议标识；识别完成前为 `any`。
    pub protocol: String,
    pub connector: String,
    pub remote_addr: Option<TransportSocketAddr>,
    pub local_addr: Option<TransportSocketAddr>,
    pub session_id: Option<String>,
    pub stats: TransportStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectorStatus {
    pub id: String,
    pub state: ServiceState,
    pub since: SystemTime,
    pub protocol: String,
    pub local_addr: Option<TransportSocketAddr>,
    /// 本次启动以来接受的连接总数。
    pub accepted: u64,
    /// 当前存活的连接数。
    pub connected: u64,
    pub connection_limit: Option<u32>,
    /// 监听是否因连接上限而暂停接受。
    pub suspended: bool,
    /// 存活连接与已关闭连接的传输计数合计。
    pub stats: TransportStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BrokerStatus {
    pub id: String,
    pub state: ServiceState,
    pub since: SystemTime,
    pub connectors: Vec<String>,
    pub connections: usize,
    /// 最近一次调优得到的套接字缓冲区大小（字节）。
    pub buffer_size: usize,
    /// 滑动窗口内观察到的连接数峰值。
    pub window_peak: u64,
}
