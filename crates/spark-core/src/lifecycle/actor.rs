use super::{
    Completion, CompletionFuture, GenerationToken, ServiceLifecycle, ServiceState,
    machine::{Admission, Request},
};
use crate::{
    dispatch::{ExecutionContext, panic_message},
    error::{CoreError, codes},
};
use parking_lot::Mutex;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

/// Actor 的启动/停止钩子，由具体服务（连接、连接器、Broker）实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以注入策略代替继承：服务只描述“启动时做什么、停止时做什么”，排队、代际与失败保留由 [`Actor`] 统一处理；
///
/// ## 契约（What）
/// - 钩子在 Actor 的执行上下文上调用，调用期间持有服务状态的锁；
/// - 钩子必须在稍后（或立即）通过 `done` 报告结果；`done` 未报告即被丢弃视为失败；
/// - 钩子 panic 会被捕获并使 Actor 进入 FAILED；
/// - **注意**：钩子内部不得同步调用 `actor.with_state`（会自锁），需要访问状态时直接使用 `&mut self`，
///   需要延后访问时使用 `actor.submit`。
pub trait ServiceHooks: Send + Sized + 'static {
    fn start(&mut self, actor: &Actor<Self>, done: HookDone);
    fn stop(&mut self, actor: &Actor<Self>, done: HookDone);
}

trait Resolve: Send + Sync {
    fn resolve(&self, result: Result<(), CoreError>);
}

struct Resolver<S: ServiceHooks> {
    resolved: AtomicBool,
    actor: WeakActor<S>,
}

impl<S: ServiceHooks> Resolve for Resolver<S> {
    fn resolve(&self, result: Result<(), CoreError>) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(actor) = self.actor.upgrade() {
            let target = actor.clone();
            actor.inner.ctx.submit(move || target.settle(result));
        }
    }
}

/// 钩子的完成句柄。
///
/// - `succeed` / `fail` / `complete` 消费句柄并回报结果，结果总是作为新任务回到 Actor 的上下文；
/// - 句柄未回报即被丢弃时，以 [`codes::LIFECYCLE_COMPLETION_DROPPED`]（或 panic 展开期间的
///   [`codes::LIFECYCLE_HOOK_PANICKED`]）回报失败，避免 Actor 永远停在 STARTING/STOPPING。
pub struct HookDone {
    resolver: Option<Arc<dyn Resolve>>,
}

impl HookDone {
    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, error: CoreError) {
        self.complete(Err(error));
    }

    pub fn complete(mut self, result: Result<(), CoreError>) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(result);
        }
    }
}

impl Drop for HookDone {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            let error = if thread::panicking() {
                CoreError::new(codes::LIFECYCLE_HOOK_PANICKED, "lifecycle hook panicked")
            } else {
                CoreError::new(
                    codes::LIFECYCLE_COMPLETION_DROPPED,
                    "lifecycle hook dropped its completion without reporting",
                )
            };
            resolver.resolve(Err(error));
        }
    }
}

impl fmt::Debug for HookDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDone")
            .field("pending", &self.resolver.is_some())
            .finish()
    }
}

struct ActorInner<S> {
    ctx: ExecutionContext,
    lifecycle: Mutex<ServiceLifecycle>,
    state: Mutex<S>,
}

/// 可组合的 Actor：执行上下文 + 生命周期状态机 + 服务状态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 扁平化“服务 → 连接 → Broker 连接”式的继承链：任何需要串行执行与启动/停止协调的对象都由本类型组合而成；
///
/// ## 逻辑（How）
/// - `start`/`stop` 只是把请求投递到上下文；在上下文中由 [`ServiceLifecycle`] 裁决：
///   运行钩子、立即完成、排队或在 FAILED 下告警；
/// - 钩子完成后，挂起请求逐个重新提交到上下文（不内联执行），随后执行发起方回调；
/// - 服务状态 `S` 以互斥锁包裹，只在上下文任务内访问，锁因而不会发生竞争。
///
/// ## 契约（What）
/// - 同一 Actor 至多一个钩子在途；
/// - 跨 Actor 交互只能通过 `submit` 投递任务，不能直接读写他方状态；
/// - 周期任务与一次性定时任务都绑定代际令牌，Actor 重启后旧定时器自动失效。
pub struct Actor<S> {
    inner: Arc<ActorInner<S>>,
}

impl<S> Clone for Actor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// 不持有所有权的 Actor 引用。
pub struct WeakActor<S> {
    inner: Weak<ActorInner<S>>,
}

impl<S> Clone for WeakActor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<S> WeakActor<S> {
    pub fn upgrade(&self) -> Option<Actor<S>> {
        self.inner.upgrade().map(|inner| Actor { inner })
    }
}

impl<S> fmt::Debug for WeakActor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakActor")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl<S: ServiceHooks> Actor<S> {
    /// 以给定上下文与初始状态创建处于 CREATED 的 Actor。
    pub fn new(ctx: ExecutionContext, state: S) -> Self {
        Self {
            inner: Arc::new(ActorInner {
                ctx,
                lifecycle: Mutex::new(ServiceLifecycle::new()),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    pub fn downgrade(&self) -> WeakActor<S> {
        WeakActor {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn service_state(&self) -> ServiceState {
        self.inner.lifecycle.lock().state()
    }

    /// 进入当前状态的时刻。
    pub fn state_since(&self) -> SystemTime {
        self.inner.lifecycle.lock().since()
    }

    /// FAILED 状态下保留的失败原因。
    pub fn failure(&self) -> Option<CoreError> {
        self.inner.lifecycle.lock().failure().cloned()
    }

    /// 捕获当前代际的令牌。
    pub fn generation_token(&self) -> GenerationToken {
        self.inner.lifecycle.lock().generation().token()
    }

    /// 请求启动。
    pub fn start(&self, done: Completion) {
        self.request(Request::Start, done);
    }

    /// 请求停止。
    pub fn stop(&self, done: Completion) {
        self.request(Request::Stop, done);
    }

    /// 请求启动，并返回在回调执行时就绪的 Future。
    pub fn start_async(&self) -> CompletionFuture {
        let (done, waiter) = Completion::future();
        self.start(done);
        waiter
    }

    /// 请求停止，并返回在回调执行时就绪的 Future。
    pub fn stop_async(&self) -> CompletionFuture {
        let (done, waiter) = Completion::future();
        self.stop(done);
        waiter
    }

    /// 在当前线程上访问服务状态。
    ///
    /// 只应在本 Actor 的上下文任务中调用；从钩子内部调用会自锁。
    pub fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(&mut state)
    }

    /// 向本 Actor 的上下文投递一个访问服务状态的任务。
    pub fn submit(&self, task: impl FnOnce(&Actor<S>, &mut S) + Send + 'static) {
        let actor = self.clone();
        self.inner.ctx.submit(move || {
            let handle = actor.clone();
            actor.with_state(|state| task(&handle, state));
        });
    }

    /// 在 `delay` 后执行一次任务；期间若 Actor 重启/停止（代际变化）或已被释放，则静默放弃。
    pub fn schedule_once(
        &self,
        delay: Duration,
        task: impl FnOnce(&Actor<S>, &mut S) + Send + 'static,
    ) {
        let weak = self.downgrade();
        let token = self.generation_token();
        self.inner.ctx.submit_after(delay, move || {
            if !token.is_current() {
                return;
            }
            if let Some(actor) = weak.upgrade() {
                let handle = actor.clone();
                actor.with_state(|state| task(&handle, state));
            }
        });
    }

    /// 以固定周期执行任务，直到代际变化或 Actor 被释放。
    pub fn schedule_recurring(
        &self,
        period: Duration,
        task: impl FnMut(&Actor<S>, &mut S) + Send + 'static,
    ) {
        Self::schedule_tick(
            self.inner.ctx.clone(),
            self.downgrade(),
            period,
            self.generation_token(),
            task,
        );
    }

    fn schedule_tick<F>(
        ctx: ExecutionContext,
        weak: WeakActor<S>,
        period: Duration,
        token: GenerationToken,
        mut task: F,
    ) where
        F: FnMut(&Actor<S>, &mut S) + Send + 'static,
    {
        let next_ctx = ctx.clone();
        ctx.submit_after(period, move || {
            if !token.is_current() {
                return;
            }
            let Some(actor) = weak.upgrade() else {
                return;
            };
            let handle = actor.clone();
            actor.with_state(|state| task(&handle, state));
            Self::schedule_tick(next_ctx, weak, period, token, task);
        });
    }

    fn request(&self, request: Request, done: Completion) {
        let actor = self.clone();
        self.inner.ctx.submit(move || actor.handle(request, done));
    }

    fn handle(&self, request: Request, done: Completion) {
        let admission = self.inner.lifecycle.lock().request(request, done);
        match admission {
            Admission::Run(request) => self.run_hook(request),
            Admission::Complete(done) => done.run(),
            Admission::Queued => {}
            Admission::Failed(done) => {
                tracing::warn!(
                    actor = %self.inner.ctx.label(),
                    ?request,
                    "ignoring lifecycle request: service has failed"
                );
                done.run();
            }
        }
    }

    fn run_hook(&self, request: Request) {
        let resolver: Arc<dyn Resolve> = Arc::new(Resolver {
            resolved: AtomicBool::new(false),
            actor: self.downgrade(),
        });
        let done = HookDone {
            resolver: Some(Arc::clone(&resolver)),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut state = self.inner.state.lock();
            match request {
                Request::Start => state.start(self, done),
                Request::Stop => state.stop(self, done),
            }
        }));
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                actor = %self.inner.ctx.label(),
                ?request,
                panic = %message,
                "lifecycle hook panicked"
            );
            resolver.resolve(Err(CoreError::new(
                codes::LIFECYCLE_HOOK_PANICKED,
                message,
            )));
        }
    }

    fn settle(&self, result: Result<(), CoreError>) {
        let settled = self.inner.lifecycle.lock().settle(result);
        if settled.state == ServiceState::Failed
            && let Some(error) = self.failure()
        {
            tracing::warn!(
                actor = %self.inner.ctx.label(),
                code = error.code(),
                error = %error,
                "service entered FAILED"
            );
        }
        for action in settled.pending {
            self.request(action.request, action.done);
        }
        if let Some(caller) = settled.caller {
            caller.run();
        }
    }
}

impl<S> fmt::Debug for Actor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("context", &self.inner.ctx.label())
            .field("state", &self.inner.lifecycle.lock().state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ManualExecutor;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Probe {
        starts: usize,
        stops: usize,
        defer_start: bool,
        held: Option<HookDone>,
        fail_start: Option<CoreError>,
        panic_on_stop: bool,
        ticks: usize,
    }

    impl ServiceHooks for Probe {
        fn start(&mut self, _actor: &Actor<Self>, done: HookDone) {
            self.starts += 1;
            if let Some(error) = self.fail_start.take() {
                done.fail(error);
            } else if self.defer_start {
                self.held = Some(done);
            } else {
                done.succeed();
            }
        }

        fn stop(&mut self, _actor: &Actor<Self>, done: HookDone) {
            self.stops += 1;
            if self.panic_on_stop {
                panic!("stop hook exploded");
            }
            done.succeed();
        }
    }

    fn actor_with(probe: Probe) -> (Actor<Probe>, ManualExecutor) {
        let executor = ManualExecutor::new();
        let ctx = ExecutionContext::new("probe", Arc::new(executor.clone()));
        (Actor::new(ctx, probe), executor)
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Completion {
        let log = Arc::clone(log);
        Completion::new(move || log.lock().push(name))
    }

    /// 第一次启动尚在 STARTING 时再次启动：钩子只运行一次，第二个回调在第一个之后触发。
    #[test]
    fn concurrent_start_runs_hook_once() {
        let (actor, executor) = actor_with(Probe {
            defer_start: true,
            ..Probe::default()
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        actor.start(recorder(&log, "first"));
        actor.start(recorder(&log, "second"));
        executor.run_until_idle();

        assert_eq!(actor.service_state(), ServiceState::Starting);
        assert!(log.lock().is_empty());

        let held = actor.with_state(|probe| probe.held.take());
        held.expect("start hook kept its completion").succeed();
        executor.run_until_idle();

        assert_eq!(actor.service_state(), ServiceState::Started);
        assert_eq!(actor.with_state(|probe| probe.starts), 1);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn stop_on_created_is_a_no_op() {
        let (actor, executor) = actor_with(Probe::default());
        let since = actor.state_since();
        let log = Arc::new(Mutex::new(Vec::new()));
        actor.stop(recorder(&log, "stopped"));
        executor.run_until_idle();
        assert_eq!(*log.lock(), vec!["stopped"]);
        assert_eq!(actor.service_state(), ServiceState::Created);
        assert_eq!(actor.state_since(), since);
        assert_eq!(actor.with_state(|probe| probe.stops), 0);
    }

    #[traced_test]
    #[test]
    fn failed_start_is_retained_and_later_requests_warn() {
        let (actor, executor) = actor_with(Probe {
            fail_start: Some(CoreError::new(codes::LIFECYCLE_HOOK_FAILED, "port in use")),
            ..Probe::default()
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        actor.start(recorder(&log, "start"));
        executor.run_until_idle();
        assert_eq!(actor.service_state(), ServiceState::Failed);
        assert_eq!(
            actor.failure().map(|e| e.code()),
            Some(codes::LIFECYCLE_HOOK_FAILED)
        );

        actor.stop(recorder(&log, "stop"));
        executor.run_until_idle();
        assert_eq!(*log.lock(), vec!["start", "stop"]);
        assert_eq!(actor.service_state(), ServiceState::Failed);
        assert!(logs_contain("service has failed"));
    }

    /// 钩子 panic：进入 FAILED，排队中的请求仍被逐个放行，调用方不会被挂起。
    #[test]
    fn panicking_hook_fails_actor_and_drains_pending() {
        let (actor, executor) = actor_with(Probe {
            panic_on_stop: true,
            ..Probe::default()
        });
        actor.start(Completion::noop());
        executor.run_until_idle();

        let log = Arc::new(Mutex::new(Vec::new()));
        actor.stop(recorder(&log, "stop"));
        actor.start(recorder(&log, "restart"));
        executor.run_until_idle();

        assert_eq!(actor.service_state(), ServiceState::Failed);
        assert_eq!(
            actor.failure().map(|e| e.code()),
            Some(codes::LIFECYCLE_HOOK_PANICKED)
        );
        assert_eq!(*log.lock(), vec!["stop", "restart"]);
    }

    #[test]
    fn dropped_completion_fails_the_transition() {
        struct Forgetful;
        impl ServiceHooks for Forgetful {
            fn start(&mut self, _actor: &Actor<Self>, done: HookDone) {
                drop(done);
            }
            fn stop(&mut self, _actor: &Actor<Self>, done: HookDone) {
                done.succeed();
            }
        }
        let executor = ManualExecutor::new();
        let actor = Actor::new(
            ExecutionContext::new("forgetful", Arc::new(executor.clone())),
            Forgetful,
        );
        actor.start(Completion::noop());
        executor.run_until_idle();
        assert_eq!(
            actor.failure().map(|e| e.code()),
            Some(codes::LIFECYCLE_COMPLETION_DROPPED)
        );
    }

    /// 重启后旧的周期任务失效，只有新一轮启动后登记的任务继续运行。
    #[test]
    fn recurring_work_is_bound_to_generation() {
        let (actor, executor) = actor_with(Probe::default());
        actor.start(Completion::noop());
        executor.run_until_idle();
        actor.schedule_recurring(Duration::from_millis(100), |_, probe| probe.ticks += 1);
        executor.advance(Duration::from_millis(250));
        assert_eq!(actor.with_state(|probe| probe.ticks), 2);

        actor.stop(Completion::noop());
        executor.run_until_idle();
        executor.advance(Duration::from_millis(500));
        assert_eq!(actor.with_state(|probe| probe.ticks), 2);
        assert_eq!(executor.pending_timers(), 0);
    }

    #[test]
    fn schedule_once_skips_after_restart() {
        let (actor, executor) = actor_with(Probe::default());
        actor.start(Completion::noop());
        executor.run_until_idle();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        actor.schedule_once(Duration::from_millis(10), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        actor.stop(Completion::noop());
        actor.start(Completion::noop());
        executor.run_until_idle();
        executor.advance(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_async_resolves_after_started() {
        let (actor, executor) = actor_with(Probe::default());
        let waiter = actor.start_async();
        executor.run_until_idle();
        futures::executor::block_on(waiter);
        assert_eq!(actor.service_state(), ServiceState::Started);
    }
}
