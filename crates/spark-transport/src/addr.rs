use spark_core::error::{CoreError, codes};
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

/// 结构化的套接字地址。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 状态快照与日志需要稳定、可比较、`Copy` 的地址表示，不希望把 `std::net` 类型散落到协议层；
///
/// ## 契约（What）
/// - `V4`/`V6` 分别承载 IPv4 与 IPv6；`Display` 输出 `a.b.c.d:port` 或 `[v6]:port`；
/// - 与 [`SocketAddr`] 双向无损转换。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportSocketAddr {
    V4 { addr: [u8; 4], port: u16 },
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    pub fn port(&self) -> u16 {
        match self {
            TransportSocketAddr::V4 { port, .. } | TransportSocketAddr::V6 { port, .. } => *port,
        }
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSocketAddr::V4 { addr, port } => write!(
                f,
                "{}.{}.{}.{}:{}",
                addr[0], addr[1], addr[2], addr[3], port
            ),
            TransportSocketAddr::V6 { addr, port } => {
                write!(f, "[{}]:{}", Ipv6Addr::from(*addr), port)
            }
        }
    }
}

impl From<SocketAddr> for TransportSocketAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<TransportSocketAddr> for SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        match addr {
            TransportSocketAddr::V4 { addr, port } => SocketAddr::from((addr, port)),
            TransportSocketAddr::V6 { addr, port } => {
                SocketAddr::from((Ipv6Addr::from(addr), port))
            }
        }
    }
}

/// `scheme://host:port` 形式的监听地址。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接器配置以 URI 描述监听目标，scheme 决定由哪个 [`ServerFactory`](crate::ServerFactory) 绑定；
///
/// ## 逻辑（How）
/// - `FromStr`：拆出 scheme，再解析 `host:port`；IPv6 主机必须用方括号包裹；
/// - [`resolve`](Self::resolve)：调用系统解析器把主机名解析为套接字地址。该调用可能阻塞，
///   应放在阻塞任务池中执行。
///
/// ## 契约（What）
/// - 端口 `0` 表示由操作系统分配临时端口；
/// - 解析失败返回 [`codes::TRANSPORT_INVALID_URI`]。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindUri {
    scheme: String,
    host: String,
    port: u16,
}

impl BindUri {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 主机为 IP 字面量时直接得到套接字地址，无需走系统解析器。
    pub fn literal(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// 解析为第一个可用的套接字地址（可能阻塞）。
    pub fn resolve(&self) -> spark_core::Result<SocketAddr> {
        let mut candidates = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| {
                CoreError::new(
                    codes::TRANSPORT_INVALID_URI,
                    format!("cannot resolve {self}: {err}"),
                )
                .with_cause(err)
            })?;
        candidates.next().ok_or_else(|| {
            CoreError::new(
                codes::TRANSPORT_INVALID_URI,
                format!("{self} resolved to no addresses"),
            )
        })
    }
}

impl fmt::Display for BindUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

impl FromStr for BindUri {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid =
            |reason: &str| CoreError::new(codes::TRANSPORT_INVALID_URI, format!("`{value}`: {reason}"));

        let (scheme, rest) = value
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://host:port"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid scheme"));
        }
        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 host"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            rest.rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port must be an integer between 0 and 65535"))?;
        Ok(Self::new(scheme.to_ascii_lowercase(), host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_host_and_ephemeral_port() {
        let uri: BindUri = "tcp://0.0.0.0:0".parse().expect("valid uri");
        assert_eq!(uri.scheme(), "tcp");
        assert_eq!(uri.host(), "0.0.0.0");
        assert_eq!(uri.port(), 0);
        assert_eq!(uri.to_string(), "tcp://0.0.0.0:0");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let uri: BindUri = "TCP://[::1]:61613".parse().expect("valid uri");
        assert_eq!(uri.scheme(), "tcp");
        assert_eq!(uri.host(), "::1");
        assert_eq!(uri.port(), 61613);
        assert_eq!(uri.to_string(), "tcp://[::1]:61613");
    }

    #[test]
    fn rejects_malformed_uris() {
        for raw in ["0.0.0.0:1", "tcp://host", "tcp://:80", "tcp://h:99999", "://h:1", "tcp://[::1:5"] {
            let err = raw.parse::<BindUri>().expect_err(raw);
            assert_eq!(err.code(), codes::TRANSPORT_INVALID_URI, "{raw}");
        }
    }

    #[test]
    fn resolves_loopback_literal() {
        let uri = BindUri::new("tcp", "127.0.0.1", 0);
        let addr = uri.resolve().expect("literal resolves");
        assert_eq!(addr, "127.0.0.1:0".parse::<SocketAddr>().expect("socket addr"));
        assert_eq!(uri.literal(), Some(addr));
        assert_eq!(BindUri::new("tcp", "localhost", 0).literal(), None);
    }

    #[test]
    fn socket_addr_round_trips_for_display() {
        let v6: SocketAddr = "[::1]:8080".parse().expect("v6");
        let addr = TransportSocketAddr::from(v6);
        assert_eq!(addr.to_string(), "[::1]:8080");
        assert_eq!(addr.port(), 8080);
        assert_eq!(SocketAddr::from(addr), v6);
    }
}
