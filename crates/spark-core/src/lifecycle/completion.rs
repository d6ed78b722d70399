use futures::channel::oneshot;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// 一次性完成回调。
///
/// - `run` 消费自身并执行回调，天然保证“至多一次”；
/// - 未执行就被丢弃的回调不会运行。
pub struct Completion {
    callback: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Completion {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// 空回调。
    pub fn noop() -> Self {
        Self { callback: None }
    }

    /// 创建一对“回调 + Future”：回调执行（或被丢弃）时 Future 就绪。
    pub fn future() -> (Self, CompletionFuture) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move || {
            let _ = tx.send(());
        });
        (completion, CompletionFuture { rx })
    }

    /// 执行回调。
    pub fn run(mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("noop", &self.callback.is_none())
            .finish()
    }
}

/// [`Completion::future`] 返回的等待端。
#[derive(Debug)]
pub struct CompletionFuture {
    rx: oneshot::Receiver<()>,
}

impl Future for CompletionFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn future_resolves_when_completion_runs() {
        let (completion, waiter) = Completion::future();
        completion.run();
        block_on(waiter);
    }

    #[test]
    fn future_resolves_when_completion_is_dropped() {
        let (completion, waiter) = Completion::future();
        drop(completion);
        block_on(waiter);
    }
}
