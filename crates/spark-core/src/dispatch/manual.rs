use super::{Executor, Task};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

#[derive(Default)]
struct ManualState {
    now: Duration,
    sequence: u64,
    ready: VecDeque<Task>,
    timers: Vec<Timer>,
}

struct Timer {
    due: Duration,
    sequence: u64,
    task: Task,
}

/// 虚拟时钟执行器，供确定性测试使用。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 生命周期、协议识别超时与周期采样都依赖延迟任务；真实时钟会让测试变慢且不稳定；
///
/// ## 逻辑（How）
/// - `execute` 把任务放入就绪队列，`execute_after` 登记到期时间；
/// - `run_until_idle` 在调用线程上执行就绪任务直到队列为空；
/// - `advance` 按到期先后推进虚拟时钟，同一时刻的定时器按登记顺序触发。
///
/// ## 契约（What）
/// - 执行任务时不持有内部锁，任务可以继续投递新任务；
/// - 时钟只在 `advance` 中前进。
#[derive(Clone, Default)]
pub struct ManualExecutor {
    state: Arc<Mutex<ManualState>>,
}

impl ManualExecutor {
    /// 创建时钟位于零点的执行器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 执行所有就绪任务，返回执行的任务数。
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        loop {
            let next = self.state.lock().ready.pop_front();
            match next {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// 推进虚拟时钟并执行沿途到期的定时任务，返回执行的任务数。
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = self.state.lock().now + by;
        let mut executed = self.run_until_idle();
        loop {
            let due = {
                let mut state = self.state.lock();
                let earliest = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due <= deadline)
                    .min_by_key(|(_, timer)| (timer.due, timer.sequence))
                    .map(|(index, _)| index);
                earliest.map(|index| {
                    let timer = state.timers.swap_remove(index);
                    state.now = state.now.max(timer.due);
                    timer.task
                })
            };
            match due {
                Some(task) => {
                    task();
                    executed += 1 + self.run_until_idle();
                }
                None => break,
            }
        }
        self.state.lock().now = deadline;
        executed
    }

    /// 当前虚拟时间。
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// 尚未触发的定时任务数。
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// 尚未执行的就绪任务数。
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.state.lock().ready.push_back(task);
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        let sequence = state.sequence;
        state.sequence += 1;
        state.timers.push(Timer {
            due,
            sequence,
            task,
        });
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualExecutor")
            .field("now", &state.now)
            .field("ready", &state.ready.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}
