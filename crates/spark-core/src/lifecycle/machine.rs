use super::{Completion, GenerationCounter, ServiceState};
use crate::error::CoreError;
use std::{collections::VecDeque, time::SystemTime};

/// 生命周期请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Start,
    Stop,
}

/// 转换在途期间到达、等待重新评估的请求。
#[derive(Debug)]
pub struct PendingAction {
    pub request: Request,
    pub done: Completion,
}

/// [`ServiceLifecycle::request`] 的裁决结果。
#[derive(Debug)]
pub enum Admission {
    /// 已进入 STARTING/STOPPING，调用方须执行对应钩子；请求方的回调由状态机保管到转换结束。
    Run(Request),
    /// 无需转换，立即执行回调。
    Complete(Completion),
    /// 已排队，等待在途转换结束后重新提交。
    Queued,
    /// 处于 FAILED，请记录告警后立即执行回调。
    Failed(Completion),
}

/// 转换结束后的收尾清单。
#[derive(Debug)]
pub struct Settled {
    /// 需要按顺序重新提交到执行上下文的挂起请求。
    pub pending: Vec<PendingAction>,
    /// 发起本次转换的调用方回调，应在重新提交挂起请求之后执行。
    pub caller: Option<Completion>,
    /// 转换结束后的状态。
    pub state: ServiceState,
}

/// 服务生命周期状态机。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“何时运行钩子、何时排队、何时直接完成”的判定从执行细节中剥离，成为可穷举测试的纯数据结构；
///
/// ## 逻辑（How）
/// | 当前状态 | start | stop |
/// |---|---|---|
/// | CREATED / STOPPED | 进入 STARTING，运行启动钩子 | 立即完成 |
/// | STARTING / STOPPING | 排队 | 排队 |
/// | STARTED | 立即完成 | 进入 STOPPING，运行停止钩子 |
/// | FAILED | 告警后立即完成 | 告警后立即完成 |
///
/// - 进入 STARTING/STOPPING 时推进代际计数；
/// - [`settle`](Self::settle) 根据钩子结果落到 STARTED/STOPPED 或 FAILED，并交还全部挂起请求。
///
/// ## 契约（What）
/// - 任意时刻至多一个转换在途；
/// - FAILED 之后状态永不改变，失败原因可通过 [`failure`](Self::failure) 查询；
/// - 挂起请求按到达顺序交还，不在状态机内部执行。
#[derive(Debug)]
pub struct ServiceLifecycle {
    state: ServiceState,
    since: SystemTime,
    failure: Option<CoreError>,
    generation: GenerationCounter,
    pending: VecDeque<PendingAction>,
    in_flight: Option<Completion>,
}

impl Default for ServiceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLifecycle {
    pub fn new() -> Self {
        Self {
            state: ServiceState::Created,
            since: SystemTime::now(),
            failure: None,
            generation: GenerationCounter::new(),
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// 进入当前状态的时刻。
    pub fn since(&self) -> SystemTime {
        self.since
    }

    /// FAILED 状态下保留的失败原因。
    pub fn failure(&self) -> Option<&CoreError> {
        self.failure.as_ref()
    }

    pub fn generation(&self) -> &GenerationCounter {
        &self.generation
    }

    /// 排队中的请求数。
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 对一次启动/停止请求作出裁决。
    pub fn request(&mut self, request: Request, done: Completion) -> Admission {
        use ServiceState::*;
        match (self.state, request) {
            (Created | Stopped, Request::Start) => {
                self.enter(Starting);
                self.in_flight = Some(done);
                Admission::Run(Request::Start)
            }
            (Started, Request::Stop) => {
                self.enter(Stopping);
                self.in_flight = Some(done);
                Admission::Run(Request::Stop)
            }
            (Created | Stopped, Request::Stop) | (Started, Request::Start) => {
                Admission::Complete(done)
            }
            (Starting | Stopping, _) => {
                self.pending.push_back(PendingAction { request, done });
                Admission::Queued
            }
            (Failed, _) => Admission::Failed(done),
        }
    }

    /// 结束在途转换。
    ///
    /// 没有转换在途时视为过期回报，状态不变且返回空清单。
    pub fn settle(&mut self, result: Result<(), CoreError>) -> Settled {
        if !self.state.is_transitioning() {
            return Settled {
                pending: Vec::new(),
                caller: None,
                state: self.state,
            };
        }
        match result {
            Ok(()) => {
                let next = if self.state == ServiceState::Starting {
                    ServiceState::Started
                } else {
                    ServiceState::Stopped
                };
                self.enter(next);
            }
            Err(err) => {
                self.failure = Some(err);
                self.enter(ServiceState::Failed);
            }
        }
        Settled {
            pending: self.pending.drain(..).collect(),
            caller: self.in_flight.take(),
            state: self.state,
        }
    }

    fn enter(&mut self, state: ServiceState) {
        if state.is_transitioning() {
            self.generation.advance();
        }
        self.state = state;
        self.since = SystemTime::now();
    }
}
