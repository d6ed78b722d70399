//! 服务生命周期：状态机、代际计数、完成回调与 Actor 组合体。
//!
//! ## 意图（Why）
//! - Broker、Connector、Connection 共享同一套启动/停止语义：同一时刻至多一个转换在途，
//!   其余请求排队，失败进入吸收态 FAILED 并保留原因；
//! - 以组合代替继承：[`Actor`] = 执行上下文 + [`ServiceLifecycle`] + 注入的 [`ServiceHooks`] 状态。
//!
//! ## 契约（What）
//! - [`ServiceLifecycle`] 是不依赖执行器的纯状态机，可单独测试；
//! - [`Actor`] 负责在执行上下文上驱动状态机并调用钩子；
//! - [`TaskTracker`] 汇聚多个完成回调，并在等待过久时输出日志。

mod actor;
mod completion;
mod generation;
mod machine;
mod state;
mod tracker;

pub use actor::{Actor, HookDone, ServiceHooks, WeakActor};
pub use completion::{Completion, CompletionFuture};
pub use generation::{GenerationCounter, GenerationToken};
pub use machine::{Admission, PendingAction, Request, ServiceLifecycle, Settled};
pub use state::ServiceState;
pub use tracker::TaskTracker;
