//! 调度层：执行器抽象与串行化执行上下文。
//!
//! ## 意图（Why）
//! - 每个 Actor 都需要“单逻辑线程”的执行语义，而底层线程池可以是任意实现；
//! - 阻塞操作（DNS 解析、证书加载等）必须离开工作线程，结果再回到发起方的上下文。
//!
//! ## 契约（What）
//! - [`Executor`]：最小的“立即执行 / 延迟执行”能力；
//! - [`ExecutionContext`]：在任意 `Executor` 之上提供 FIFO 串行语义，可重定向到新的执行器；
//! - [`TokioExecutor`] 与 [`BlockingPool`]：基于 Tokio 的默认实现（`runtime-tokio` 特性）；
//! - [`ManualExecutor`]：虚拟时钟执行器，仅用于测试（`test-util` 特性）。

mod context;
mod executor;

#[cfg(feature = "runtime-tokio")]
mod blocking;
#[cfg(any(test, feature = "test-util"))]
mod manual;
#[cfg(feature = "runtime-tokio")]
mod tokio_executor;

pub use context::ExecutionContext;
pub(crate) use context::panic_message;
pub use executor::{Executor, Task};

#[cfg(feature = "runtime-tokio")]
pub use blocking::BlockingPool;
#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualExecutor;
#[cfg(feature = "runtime-tokio")]
pub use tokio_executor::TokioExecutor;
