use std::fmt;

/// 服务状态。
///
/// `Failed` 是吸收态：一旦进入便不再离开。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    /// 稳定的大写名称，用于状态快照与日志。
    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceState::Created => "CREATED",
            ServiceState::Starting => "STARTING",
            ServiceState::Started => "STARTED",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Failed => "FAILED",
        }
    }

    /// 是否有转换在途。
    pub const fn is_transitioning(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }

    pub const fn is_started(self) -> bool {
        matches!(self, ServiceState::Started)
    }

    /// 是否处于停止中、已停止或失败。
    pub const fn is_stopping_or_stopped(self) -> bool {
        matches!(
            self,
            ServiceState::Stopping | ServiceState::Stopped | ServiceState::Failed
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
