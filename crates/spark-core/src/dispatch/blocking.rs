use super::ExecutionContext;
use crate::{
    dispatch::panic_message,
    error::{CoreError, ErrorCategory, codes},
};
use std::sync::Arc;
use tokio::{runtime::Handle, sync::Semaphore};

/// 有界阻塞任务池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 执行上下文的任务绝不能阻塞工作线程；DNS 解析、证书库加载等天然阻塞的操作必须离开工作线程；
/// - 并发度需要上限，避免突发连接把阻塞线程数推高到运行时默认上限。
///
/// ## 逻辑（How）
/// - 以 `Semaphore` 限制同时运行的阻塞任务数，许可随任务结束释放；
/// - 任务通过 `spawn_blocking` 执行，panic 被转换为 [`codes::BLOCKING_TASK_PANICKED`]；
/// - [`run_on`](Self::run_on) 把结果作为新任务提交回发起方的 [`ExecutionContext`]。
///
/// ## 契约（What）
/// - `run`：返回可 `await` 的结果；
/// - `run_on`：`on_done` 一定在 `ctx` 上执行，且只执行一次。
#[derive(Clone, Debug)]
pub struct BlockingPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BlockingPool {
    /// 创建最多同时运行 `limit` 个阻塞任务的池，`limit` 至少为 1。
    pub fn new(handle: Handle, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// 并发上限。
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 在池中执行阻塞任务。
    pub async fn run<T, F>(&self, work: F) -> crate::Result<T>
    where
        F: FnOnce() -> crate::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| {
                CoreError::new(codes::BLOCKING_POOL_CLOSED, "blocking pool is closed")
                    .with_category(ErrorCategory::ResourceExhausted)
            })?;
        let joined = self
            .handle
            .spawn_blocking(move || {
                let _permit = permit;
                work()
            })
            .await;
        match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                Err(CoreError::new(
                    codes::BLOCKING_TASK_PANICKED,
                    panic_message(payload.as_ref()),
                ))
            }
            Err(err) => Err(CoreError::new(codes::BLOCKING_POOL_CLOSED, err.to_string())
                .with_category(ErrorCategory::Cancelled)),
        }
    }

    /// 在池中执行阻塞任务，并把结果回送到 `ctx`。
    pub fn run_on<T, F, D>(&self, ctx: &ExecutionContext, work: F, on_done: D)
    where
        F: FnOnce() -> crate::Result<T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(crate::Result<T>) + Send + 'static,
    {
        let pool = self.clone();
        let ctx = ctx.clone();
        self.handle.spawn(async move {
            let result = pool.run(work).await;
            ctx.submit(move || on_done(result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TokioExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread")]
    async fn result_is_marshalled_back_onto_the_context() {
        let executor = TokioExecutor::current().expect("runtime");
        let ctx = ExecutionContext::new("blocking", Arc::new(executor));
        let pool = BlockingPool::new(Handle::current(), 2);
        let (tx, rx) = oneshot::channel();
        let probe = ctx.clone();
        pool.run_on(
            &ctx,
            || Ok(21 * 2),
            move |result: crate::Result<i32>| {
                let _ = tx.send((result.map_err(|e| e.code()), probe.is_current()));
            },
        );
        let (value, on_context) = rx.await.expect("completion delivered");
        assert_eq!(value, Ok(42));
        assert!(on_context);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panics_become_errors() {
        let pool = BlockingPool::new(Handle::current(), 1);
        let result: crate::Result<()> = pool.run(|| panic!("disk on fire")).await;
        let err = result.expect_err("panic is reported");
        assert_eq!(err.code(), codes::BLOCKING_TASK_PANICKED);
        assert!(err.message().contains("disk on fire"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_is_bounded_by_limit() {
        let pool = BlockingPool::new(Handle::current(), 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for job in jobs {
            job.await.expect("join").expect("job ok");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
