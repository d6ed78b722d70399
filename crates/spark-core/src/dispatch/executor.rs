use std::{sync::Arc, time::Duration};

/// 可投递到执行器的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 底层执行器抽象。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让 [`ExecutionContext`](super::ExecutionContext) 与具体线程池解耦：生产环境挂在 Tokio 上，
///   测试中挂在虚拟时钟执行器上；
///
/// ## 契约（What）
/// - `execute`：尽快在某个工作线程上运行任务，不保证顺序；
/// - `execute_after`：在 `delay` 之后运行任务；执行器关闭时任务可能被丢弃；
/// - 实现必须是 `Send + Sync`，可被多个上下文共享。
pub trait Executor: Send + Sync + 'static {
    /// 立即调度任务。
    fn execute(&self, task: Task);

    /// 延迟调度任务。
    fn execute_after(&self, delay: Duration, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task)
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        (**self).execute_after(delay, task)
    }
}
