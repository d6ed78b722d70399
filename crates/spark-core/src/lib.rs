#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
//! # spark-core
//!
//! ## 设计动机（Why）
//! - Broker 的每个长生命周期对象（Broker、Connector、Connection）都需要“单逻辑线程”的执行语义与
//!   可排队的启动/停止流程；本 crate 将这两项能力抽离为与传输、协议无关的基础设施。
//! - 所有跨 crate 的失败都以 [`CoreError`] 表达，保证错误码稳定、可在 FAILED 状态中长期保留。
//!
//! ## 核心契约（What）
//! - [`dispatch`]：`Executor` 抽象、串行化的 [`ExecutionContext`]、Tokio 执行器与有界阻塞任务池；
//! - [`lifecycle`]：`CREATED → STARTING → STARTED → STOPPING → STOPPED`（外加吸收态 `FAILED`）状态机、
//!   代际计数器、挂起请求队列，以及把三者组合在一起的 [`Actor`]；
//! - [`error`]：[`CoreError`]、[`ErrorCategory`] 与稳定错误码表。
//!
//! ## 实现策略（How）
//! - 执行上下文使用“无锁触发位 + 有锁队列”的排空循环，任务之间以 `catch_unwind` 隔离；
//! - 状态机本身是纯数据结构，`Actor` 负责把它放到执行上下文上驱动。
//!
//! ## 风险与考量（Trade-offs）
//! - Actor 的状态由互斥锁包裹，仅为满足 `Sync`；所有访问都应发生在所属上下文的任务中，
//!   否则锁竞争会破坏“单逻辑线程”的假设。

pub mod dispatch;
pub mod error;
pub mod lifecycle;

pub use dispatch::{ExecutionContext, Executor, Task};
pub use error::{CoreError, ErrorCategory, Result};
pub use lifecycle::{Actor, Completion, HookDone, ServiceHooks, ServiceState};

/// 常用类型的聚合出口。
pub mod prelude {
    pub use crate::dispatch::{ExecutionContext, Executor, Task};
    pub use crate::error::{CoreError, ErrorCategory, Result, codes};
    pub use crate::lifecycle::{
        Actor, Completion, GenerationCounter, GenerationToken, HookDone, ServiceHooks,
        ServiceState, TaskTracker,
    };
}
