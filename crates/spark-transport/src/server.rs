use crate::{BindUri, Transport, TransportSocketAddr};
use spark_core::{Completion, CoreError, ExecutionContext};
use std::{fmt, net::SocketAddr, sync::Arc};

/// 监听服务启动结果的回调。
pub type StartCallback = Box<dyn FnOnce(spark_core::Result<()>) + Send + 'static>;

/// 接入事件的接收方，通常由连接器 Actor 实现。回调在服务的执行上下文上运行。
pub trait AcceptListener: Send + Sync + 'static {
    /// 接入一条新连接；`ack` 释放之前服务不会再从内核队列取下一条连接。
    fn on_accept(&self, transport: Arc<dyn Transport>, ack: AcceptAck);

    /// 单次接入失败；监听继续。
    fn on_accept_failure(&self, error: CoreError);
}

/// 一次接入的确认句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接入控制必须在下一条连接被取出之前生效：连接器在回调中判断是否达到上限并暂停监听，
///   然后才释放确认，服务据此保证“暂停先于下一次 accept”；
///
/// ## 契约（What）
/// - `release` 或丢弃句柄都会释放确认，且只释放一次。
pub struct AcceptAck {
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl AcceptAck {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// 不关联任何动作的确认。
    pub fn detached() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for AcceptAck {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for AcceptAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptAck")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// 监听套接字当前生效的缓冲区大小，`None` 表示沿用系统默认值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferSizes {
    pub receive: Option<usize>,
    pub send: Option<usize>,
}

/// 监听服务。
///
/// # 契约（What）
/// - `start` 绑定并开始接入，结果通过 `done` 在执行上下文上回报；
/// - `suspend` 之后不再从内核队列取出新连接，已建立的连接不受影响；`resume` 恢复接入；
/// - 缓冲区大小对之后接入的连接生效，监听套接字本身也会同步更新。
pub trait TransportServer: Send + Sync + 'static {
    fn set_execution_context(&self, ctx: ExecutionContext);

    fn start(&self, acceptor: Arc<dyn AcceptListener>, done: StartCallback);

    fn stop(&self, done: Completion);

    fn suspend(&self);

    fn resume(&self);

    fn is_suspended(&self) -> bool;

    fn local_addr(&self) -> Option<TransportSocketAddr>;

    fn set_receive_buffer_size(&self, bytes: usize);

    fn set_send_buffer_size(&self, bytes: usize);

    fn buffer_sizes(&self) -> BufferSizes;
}

/// 按 scheme 创建监听服务。
pub trait ServerFactory: Send + Sync + 'static {
    fn supports(&self, scheme: &str) -> bool;

    /// 为 `uri` 创建尚未启动的监听服务；`addr` 是已经解析好的套接字地址。
    fn bind(&self, uri: &BindUri, addr: SocketAddr)
    -> spark_core::Result<Arc<dyn TransportServer>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ack_releases_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        AcceptAck::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .release();
        let counter = Arc::clone(&released);
        drop(AcceptAck::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
