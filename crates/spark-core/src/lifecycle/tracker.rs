use super::Completion;
use crate::dispatch::ExecutionContext;
use parking_lot::Mutex;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    outstanding: BTreeMap<u64, String>,
    sealed: bool,
    finished: bool,
    on_complete: Option<Completion>,
}

struct TrackerInner {
    name: Cow<'static, str>,
    state: Mutex<TrackerState>,
}

impl TrackerInner {
    fn finish(&self, id: u64) {
        let completion = {
            let mut state = self.state.lock();
            state.outstanding.remove(&id);
            Self::take_if_done(&mut state)
        };
        if let Some(completion) = completion {
            completion.run();
        }
    }

    fn take_if_done(state: &mut TrackerState) -> Option<Completion> {
        if state.sealed && !state.finished && state.outstanding.is_empty() {
            state.finished = true;
            state.on_complete.take()
        } else {
            None
        }
    }
}

/// 汇聚多个异步完成回调的跟踪器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Broker 停止时需要等待全部连接器与连接停止后才能宣告完成；
/// - 停止卡住时，运维需要知道“到底在等谁”，因此跟踪器按标签记录未完成项并周期性输出告警。
///
/// ## 逻辑（How）
/// - `task(label)` 登记一项并返回对应的 [`Completion`]；
/// - `seal(done)` 声明不再登记新项，此后最后一项完成时执行 `done`（若已全部完成则立即执行）；
/// - `watch` 在上下文上按间隔检查，未完成时以 `warn` 列出等待项。
///
/// ## 契约（What）
/// - `done` 至多执行一次；
/// - `seal` 之后再调用 `task` 仍会被跟踪，但不会推迟已经执行的 `done`。
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

impl TaskTracker {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                name: name.into(),
                state: Mutex::new(TrackerState::default()),
            }),
        }
    }

    /// 登记一项待完成任务。
    pub fn task(&self, label: impl Into<String>) -> Completion {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.outstanding.insert(id, label.into());
            id
        };
        let inner = Arc::clone(&self.inner);
        Completion::new(move || inner.finish(id))
    }

    /// 封口：所有已登记任务完成后执行 `done`。
    pub fn seal(&self, done: Completion) {
        let completion = {
            let mut state = self.inner.state.lock();
            state.sealed = true;
            state.on_complete = Some(done);
            TrackerInner::take_if_done(&mut state)
        };
        if let Some(completion) = completion {
            completion.run();
        }
    }

    /// 尚未完成的任务标签，按登记顺序排列。
    pub fn outstanding(&self) -> Vec<String> {
        self.inner.state.lock().outstanding.values().cloned().collect()
    }

    /// 是否已封口且全部完成。
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    /// 每隔 `interval` 检查一次，仍有未完成项时输出告警；跟踪器完成或被释放后停止。
    pub fn watch(&self, ctx: &ExecutionContext, interval: Duration) {
        Self::watch_tick(ctx.clone(), Arc::downgrade(&self.inner), interval);
    }

    fn watch_tick(ctx: ExecutionContext, inner: Weak<TrackerInner>, interval: Duration) {
        let next = ctx.clone();
        ctx.submit_after(interval, move || {
            let Some(tracker) = inner.upgrade() else {
                return;
            };
            let waiting: Vec<String> = {
                let state = tracker.state.lock();
                if state.finished {
                    return;
                }
                state.outstanding.values().cloned().collect()
            };
            tracing::warn!(
                tracker = %tracker.name,
                waiting_on = ?waiting,
                "still waiting on tracked tasks"
            );
            drop(tracker);
            Self::watch_tick(next, inner, interval);
        });
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("name", &self.inner.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn counting() -> (Completion, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&hits);
        (
            Completion::new(move || {
                probe.fetch_add(1, Ordering::SeqCst);
            }),
            hits,
        )
    }

    #[test]
    fn seal_without_tasks_completes_immediately() {
        let tracker = TaskTracker::new("empty");
        let (done, hits) = counting();
        tracker.seal(done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(tracker.is_finished());
    }

    #[test]
    fn completes_after_last_task_in_any_order() {
        let tracker = TaskTracker::new("stop");
        let a = tracker.task("connector a");
        let b = tracker.task("connection 7");
        let (done, hits) = counting();
        tracker.seal(done);
        b.run();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.outstanding(), vec!["connector a".to_owned()]);
        a.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[traced_test]
    #[test]
    fn watch_logs_outstanding_tasks_until_finished() {
        let executor = ManualExecutor::new();
        let ctx = ExecutionContext::new("tracker", Arc::new(executor.clone()));
        let tracker = TaskTracker::new("broker stop");
        let pending = tracker.task("connection 42");
        tracker.seal(Completion::noop());
        tracker.watch(&ctx, Duration::from_secs(1));

        executor.advance(Duration::from_secs(1));
        assert!(logs_contain("still waiting on tracked tasks"));
        assert!(logs_contain("connection 42"));

        pending.run();
        executor.advance(Duration::from_secs(5));
        assert_eq!(executor.pending_timers(), 0);
    }
}
