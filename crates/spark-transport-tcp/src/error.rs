//! TCP 操作失败到 [`CoreError`] 的映射。
//!
//! - 每类操作一个稳定错误码，见 [`codes`]；
//! - 读写阶段的对端重置/断管归入 [`spark_core::error::codes::TRANSPORT_CLOSED`]，
//!   上层据此把它当作正常断开而非故障。

use spark_core::error::{CoreError, ErrorCategory, codes as core_codes};
use std::{io, time::Duration};

/// TCP 传输的稳定错误码。
pub mod codes {
    pub const BIND_FAILED: &str = "spark.transport.tcp.bind_failed";
    pub const ACCEPT_FAILED: &str = "spark.transport.tcp.accept_failed";
    pub const SOCKET_OPTION_FAILED: &str = "spark.transport.tcp.socket_option_failed";
    pub const READ_FAILED: &str = "spark.transport.tcp.read_failed";
    pub const WRITE_FAILED: &str = "spark.transport.tcp.write_failed";
    pub const NOT_ATTACHED: &str = "spark.transport.tcp.not_attached";
}

/// 出错的 TCP 操作。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TcpOperation {
    Bind,
    Accept,
    SocketOption,
    Read,
    Write,
}

impl TcpOperation {
    fn code(self) -> &'static str {
        match self {
            TcpOperation::Bind => codes::BIND_FAILED,
            TcpOperation::Accept => codes::ACCEPT_FAILED,
            TcpOperation::SocketOption => codes::SOCKET_OPTION_FAILED,
            TcpOperation::Read => codes::READ_FAILED,
            TcpOperation::Write => codes::WRITE_FAILED,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            TcpOperation::Bind => "bind listener",
            TcpOperation::Accept => "accept connection",
            TcpOperation::SocketOption => "set socket option",
            TcpOperation::Read => "read from peer",
            TcpOperation::Write => "write to peer",
        }
    }

    /// 已建立连接上的读写。
    fn on_stream(self) -> bool {
        matches!(self, TcpOperation::Read | TcpOperation::Write)
    }
}

pub(crate) fn map_io_error(op: TcpOperation, error: io::Error) -> CoreError {
    if op.on_stream() && peer_gone(error.kind()) {
        return CoreError::new(
            core_codes::TRANSPORT_CLOSED,
            format!("peer closed the connection during {}: {error}", op.verb()),
        )
        .with_category(ErrorCategory::NonRetryable)
        .with_cause(error);
    }
    let category = categorize(op, error.kind());
    CoreError::new(op.code(), format!("failed to {}: {error}", op.verb()))
        .with_category(category)
        .with_cause(error)
}

/// 读到 EOF。
pub(crate) fn closed_error() -> CoreError {
    CoreError::new(core_codes::TRANSPORT_CLOSED, "peer closed the connection")
        .with_category(ErrorCategory::NonRetryable)
}

/// 监听在挂接执行上下文之前被启动。
pub(crate) fn not_attached() -> CoreError {
    CoreError::new(
        codes::NOT_ATTACHED,
        "listener started before an execution context was attached",
    )
    .with_category(ErrorCategory::NonRetryable)
}

fn peer_gone(kind: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    matches!(
        kind,
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | UnexpectedEof
    )
}

fn categorize(op: TcpOperation, kind: io::ErrorKind) -> ErrorCategory {
    use io::ErrorKind::*;
    match (op, kind) {
        (_, TimedOut) => ErrorCategory::Timeout,
        (_, WouldBlock | Interrupted) => ErrorCategory::Retryable {
            after: Duration::from_millis(5),
        },
        // 端口被占用或地址暂不可用：换个时机重绑可能成功。
        (TcpOperation::Bind, AddrInUse | AddrNotAvailable) => ErrorCategory::Retryable {
            after: Duration::from_millis(500),
        },
        // 握手完成前对端已放弃：只影响这一次接入。
        (TcpOperation::Accept, ConnectionAborted | ConnectionReset) => ErrorCategory::Retryable {
            after: Duration::from_millis(50),
        },
        (TcpOperation::Accept, OutOfMemory) => ErrorCategory::ResourceExhausted,
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_conflict_is_retryable() {
        let error = map_io_error(TcpOperation::Bind, io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(error.code(), codes::BIND_FAILED);
        assert!(matches!(error.category(), ErrorCategory::Retryable { .. }));
        assert!(error.message().starts_with("failed to bind listener"));
    }

    #[test]
    fn peer_reset_on_stream_reads_as_closed() {
        let read = map_io_error(
            TcpOperation::Read,
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        assert_eq!(read.code(), core_codes::TRANSPORT_CLOSED);
        let write = map_io_error(TcpOperation::Write, io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(write.code(), core_codes::TRANSPORT_CLOSED);
    }

    #[test]
    fn reset_during_accept_keeps_accept_code() {
        let error = map_io_error(
            TcpOperation::Accept,
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        assert_eq!(error.code(), codes::ACCEPT_FAILED);
        assert!(matches!(error.category(), ErrorCategory::Retryable { .. }));
    }

    #[test]
    fn permission_denied_is_final() {
        let error = map_io_error(
            TcpOperation::SocketOption,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(error.code(), codes::SOCKET_OPTION_FAILED);
        assert_eq!(error.category(), ErrorCategory::NonRetryable);
    }
}
