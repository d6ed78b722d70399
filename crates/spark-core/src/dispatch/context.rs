use super::{Executor, Task};
use crate::lifecycle::GenerationToken;
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    borrow::Cow,
    cell::Cell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// 单次排空最多执行的任务数，超过后让出工作线程。
const DRAIN_BATCH: usize = 256;

thread_local! {
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

enum Entry {
    Run(Task),
    /// 重定向标记：排空循环遇到它时停止，并在新的执行器上继续。
    Handoff,
}

struct Inner {
    label: RwLock<Cow<'static, str>>,
    queue: Mutex<VecDeque<Entry>>,
    triggered: AtomicBool,
    target: RwLock<Arc<dyn Executor>>,
}

/// 串行化执行上下文：为 Actor 提供“单逻辑线程”语义。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Actor 的全部状态只在自身上下文的任务中读写，从而无需细粒度锁；
/// - 底层执行器可以是任意线程池，多个上下文在其上并发，彼此之间没有全局锁。
///
/// ## 逻辑（How）
/// - `submit` 将任务压入 FIFO 队列，再以 CAS 抢占 `triggered` 位；抢到的一方把“排空循环”投递到目标执行器；
/// - 排空循环逐个弹出任务并在 `catch_unwind` 中执行，单个任务 panic 只记录日志，不影响后续任务；
/// - 队列为空时先清除 `triggered`，再复查队列，避免与并发 `submit` 之间丢失唤醒；
/// - `set_target` 替换执行器并入队一个重定向标记：标记之前的任务在旧执行器上排空，之后的任务在新执行器上运行。
///
/// ## 契约（What）
/// - 同一上下文上的任务按提交顺序逐个执行，永不并发；
/// - `submit_after` 与 `schedule_recurring` 最终都回到本上下文执行；
/// - `schedule_recurring` 在代际令牌失效后既不执行也不再续约。
///
/// ## 注意事项（Trade-offs）
/// - 排空循环每执行 `DRAIN_BATCH` 个任务就重新投递自身，以免长队列独占工作线程；
/// - 在任务内部同步等待本上下文的其他任务会造成死锁，应改用回调。
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl ExecutionContext {
    /// 在指定执行器上创建新的上下文。
    pub fn new(label: impl Into<Cow<'static, str>>, target: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: RwLock::new(label.into()),
                queue: Mutex::new(VecDeque::new()),
                triggered: AtomicBool::new(false),
                target: RwLock::new(target),
            }),
        }
    }

    /// 上下文标签，用于日志。
    pub fn label(&self) -> String {
        self.inner.label.read().to_string()
    }

    /// 更新上下文标签。
    pub fn set_label(&self, label: impl Into<Cow<'static, str>>) {
        *self.inner.label.write() = label.into();
    }

    /// 当前的目标执行器。
    pub fn target(&self) -> Arc<dyn Executor> {
        self.inner.target.read().clone()
    }

    /// 追加一个任务。
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.enqueue(Entry::Run(Box::new(task)));
    }

    /// 在 `delay` 之后把任务追加到本上下文。
    pub fn submit_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let ctx = self.clone();
        self.target()
            .execute_after(delay, Box::new(move || ctx.submit(task)));
    }

    /// 以固定周期重复执行 `tick`，直到 `token` 失效。
    ///
    /// - 每次运行结束后才预约下一次，因此周期从上一次执行完成时起算；
    /// - 令牌失效后到期的那一次既不执行 `tick`，也不再续约。
    pub fn schedule_recurring<F>(&self, period: Duration, token: GenerationToken, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let ctx = self.clone();
        self.submit_after(period, move || {
            if !token.is_current() {
                return;
            }
            tick();
            ctx.schedule_recurring(period, token, tick);
        });
    }

    /// 重定向到新的执行器。已排队的任务在旧执行器上排空，此后提交的任务在新执行器上执行。
    pub fn set_target(&self, target: Arc<dyn Executor>) {
        *self.inner.target.write() = target;
        self.enqueue(Entry::Handoff);
    }

    /// 当前线程是否正在执行本上下文的任务。
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current.get() == self.key())
    }

    /// 尚未执行的任务数（含重定向标记）。
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// 两个句柄是否指向同一上下文。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn enqueue(&self, entry: Entry) {
        self.inner.queue.lock().push_back(entry);
        if self
            .inner
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.dispatch_drain();
        }
    }

    fn dispatch_drain(&self) {
        let ctx = self.clone();
        self.target().execute(Box::new(move || ctx.drain()));
    }

    fn drain(&self) {
        let _current = CurrentGuard::enter(self.key());
        let mut executed = 0usize;
        loop {
            let entry = self.inner.queue.lock().pop_front();
            match entry {
                Some(Entry::Run(task)) => {
                    self.run_isolated(task);
                    executed += 1;
                    if executed >= DRAIN_BATCH {
                        self.dispatch_drain();
                        return;
                    }
                }
                Some(Entry::Handoff) => {
                    self.dispatch_drain();
                    return;
                }
                None => {
                    self.inner.triggered.store(false, Ordering::SeqCst);
                    if self.inner.queue.lock().is_empty() {
                        return;
                    }
                    if self
                        .inner
                        .triggered
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    fn run_isolated(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            tracing::error!(
                context = %self.label(),
                panic = %panic_message(payload.as_ref()),
                "task panicked; continuing with the next task"
            );
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("label", &self.label())
            .field("pending", &self.pending())
            .finish()
    }
}

struct CurrentGuard {
    previous: usize,
}

impl CurrentGuard {
    fn enter(key: usize) -> Self {
        let previous = CURRENT.with(|current| current.replace(key));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        CURRENT.with(|current| current.set(previous));
    }
}

/// 把 panic 负载转成可记录的文本。
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualExecutor;
    use crate::lifecycle::GenerationCounter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn context_on(executor: &ManualExecutor) -> ExecutionContext {
        ExecutionContext::new("test", Arc::new(executor.clone()))
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = ManualExecutor::new();
        let ctx = context_on(&executor);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            ctx.submit(move || seen.lock().push(i));
        }
        executor.run_until_idle();
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(ctx.pending(), 0);
    }

    /// 任务 panic 只影响自身，后续任务照常执行并记录日志。
    #[traced_test]
    #[test]
    fn panicking_task_does_not_stop_the_queue() {
        let executor = ManualExecutor::new();
        let ctx = context_on(&executor);
        let ran = Arc::new(AtomicUsize::new(0));
        ctx.submit(|| panic!("first task fails"));
        let counter = Arc::clone(&ran);
        ctx.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        executor.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(logs_contain("task panicked"));
        assert!(logs_contain("first task fails"));
    }

    #[test]
    fn is_current_only_inside_own_tasks() {
        let executor = ManualExecutor::new();
        let ctx = context_on(&executor);
        let other = context_on(&executor);
        let observed = Arc::new(Mutex::new(None));
        let probe = ctx.clone();
        let slot = Arc::clone(&observed);
        let other_probe = other.clone();
        ctx.submit(move || {
            *slot.lock() = Some((probe.is_current(), other_probe.is_current()));
        });
        assert!(!ctx.is_current());
        executor.run_until_idle();
        assert_eq!(*observed.lock(), Some((true, false)));
    }

    #[test]
    fn submit_after_waits_for_the_delay() {
        let executor = ManualExecutor::new();
        let ctx = context_on(&executor);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        ctx.submit_after(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        executor.advance(Duration::from_millis(49));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        executor.advance(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// 代际推进后，周期任务在下一次到期时静默退出且不再续约。
    #[test]
    fn recurring_work_stops_when_generation_moves() {
        let executor = ManualExecutor::new();
        let ctx = context_on(&executor);
        let generation = GenerationCounter::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        ctx.schedule_recurring(Duration::from_millis(100), generation.token(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        executor.advance(Duration::from_millis(350));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        generation.advance();
        executor.advance(Duration::from_millis(1000));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(executor.pending_timers(), 0);
    }

    #[test]
    fn retarget_moves_later_tasks_to_new_executor() {
        let first = ManualExecutor::new();
        let second = ManualExecutor::new();
        let ctx = context_on(&first);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        ctx.submit(move || log.lock().push("before"));
        ctx.set_target(Arc::new(second.clone()));
        let log = Arc::clone(&seen);
        ctx.submit(move || log.lock().push("after"));

        first.run_until_idle();
        assert_eq!(*seen.lock(), vec!["before"]);
        second.run_until_idle();
        assert_eq!(*seen.lock(), vec!["before", "after"]);
    }
}
