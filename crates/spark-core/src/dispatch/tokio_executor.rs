use super::{Executor, Task};
use crate::error::{CoreError, codes};
use std::time::Duration;
use tokio::runtime::Handle;

/// 基于 Tokio 运行时的执行器。
///
/// - `execute` 以 `spawn` 投递，任务在运行时工作线程上执行；
/// - `execute_after` 先 `sleep` 再执行；运行时关闭后，未到期的任务随之丢弃。
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// 绑定到指定运行时。
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// 绑定到当前线程所在的运行时。
    pub fn current() -> crate::Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| CoreError::new(codes::RUNTIME_UNAVAILABLE, err.to_string()))
    }

    /// 底层运行时句柄。
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task()
        });
    }
}
