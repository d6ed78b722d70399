use crate::{
    TcpOptions, TcpTransport,
    error::{TcpOperation, map_io_error, not_attached},
};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use spark_core::{Completion, CoreError, ExecutionContext, dispatch::TokioExecutor};
use spark_transport::{
    AcceptAck, AcceptListener, BindUri, BufferSizes, ServerFactory, StartCallback,
    TransportServer, TransportSocketAddr,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::{oneshot, watch},
};

/// 接入失败后的退避，避免文件描述符耗尽时空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcceptControl {
    Running,
    Suspended,
    Stopped,
}

struct ServerInner {
    handle: Handle,
    addr: SocketAddr,
    options: TcpOptions,
    ctx: RwLock<Option<ExecutionContext>>,
    control: watch::Sender<AcceptControl>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local: Mutex<Option<TransportSocketAddr>>,
    sizes: Mutex<BufferSizes>,
}

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在不暴露 Tokio 具体类型的前提下，提供“监听 → 逐个接入 → 可暂停”的能力，
///   连接器据此实现接入上限；
///
/// ## 逻辑 (How)
/// - `start`：以 socket2 创建监听套接字，先设置缓冲区大小再 `bind`/`listen`，
///   转交 Tokio 后启动接入任务；
/// - 接入任务受一个 `watch` 控制位驱动：`Suspended` 时不调用 `accept`，
///   正在等待的 `accept` 也会被取消（`accept` 是取消安全的）；
/// - 每接入一条连接就投递 `on_accept` 并等待 [`AcceptAck`] 释放，之后才检查控制位并进入下一次
///   `accept`。连接器在回调中暂停监听后再释放确认，因此暂停一定先于下一次取连接。
///
/// ## 契约 (What)
/// - **前置条件**：`start` 之前必须设置执行上下文；
/// - **后置条件**：`on_accept`/`on_accept_failure` 都在执行上下文上运行；
/// - **错误语义**：绑定失败通过 `done(Err)` 回报，单次接入失败只投递
///   `on_accept_failure`，监听继续。
///
/// ## 注意事项 (Trade-offs)
/// - 暂停期间新连接留在内核 backlog 中，backlog 满后由内核拒绝；
/// - 缓冲区大小在监听套接字上设置后由内核继承给新连接，接入时仍会显式设置一次，
///   以覆盖运行期调整。
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(handle: Handle, addr: SocketAddr, options: TcpOptions) -> Self {
        let (control, _) = watch::channel(AcceptControl::Stopped);
        Self {
            inner: Arc::new(ServerInner {
                handle,
                addr,
                options,
                ctx: RwLock::new(None),
                control,
                listener: Mutex::new(None),
                local: Mutex::new(None),
                sizes: Mutex::new(BufferSizes::default()),
            }),
        }
    }

    fn bind_listener(&self) -> Result<TcpListener, CoreError> {
        let addr = self.inner.addr;
        let sizes = *self.inner.sizes.lock();
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(TcpOperation::Bind, err))?;
        socket
            .set_reuse_address(true)
            .map_err(|err| map_io_error(TcpOperation::SocketOption, err))?;
        apply_sizes(&SockRef::from(&socket), sizes)?;
        socket
            .bind(&addr.into())
            .map_err(|err| map_io_error(TcpOperation::Bind, err))?;
        socket
            .listen(self.inner.options.backlog)
            .map_err(|err| map_io_error(TcpOperation::Bind, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(TcpOperation::SocketOption, err))?;
        let _runtime = self.inner.handle.enter();
        TcpListener::from_std(socket.into())
            .map_err(|err| map_io_error(TcpOperation::Bind, err))
    }
}

fn apply_sizes(socket: &SockRef<'_>, sizes: BufferSizes) -> Result<(), CoreError> {
    if let Some(bytes) = sizes.receive {
        socket
            .set_recv_buffer_size(bytes)
            .map_err(|err| map_io_error(TcpOperation::SocketOption, err))?;
    }
    if let Some(bytes) = sizes.send {
        socket
            .set_send_buffer_size(bytes)
            .map_err(|err| map_io_error(TcpOperation::SocketOption, err))?;
    }
    Ok(())
}

impl ServerInner {
    fn context(&self) -> Option<ExecutionContext> {
        self.ctx.read().clone()
    }

    fn accepted(&self, stream: TcpStream) -> Result<TcpTransport, CoreError> {
        apply_sizes(&SockRef::from(&stream), *self.sizes.lock())?;
        TcpTransport::from_stream(stream, self.handle.clone(), &self.options)
    }

    fn update_listener_size(&self, apply: impl FnOnce(&SockRef<'_>) -> std::io::Result<()>) {
        if let Some(listener) = self.listener.lock().as_ref()
            && let Err(err) = apply(&SockRef::from(listener.as_ref()))
        {
            let error = map_io_error(TcpOperation::SocketOption, err);
            tracing::warn!(
                addr = %self.addr,
                error = %error,
                "failed to update listener buffer size"
            );
        }
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: Arc<TcpListener>,
    acceptor: Arc<dyn AcceptListener>,
) {
    let mut control = inner.control.subscribe();
    loop {
        let state = *control.borrow_and_update();
        match state {
            AcceptControl::Stopped => return,
            AcceptControl::Suspended => {
                if control.changed().await.is_err() {
                    return;
                }
                continue;
            }
            AcceptControl::Running => {}
        }
        let accepted = tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        let Some(ctx) = inner.context() else {
            return;
        };
        match accepted.map_err(|err| map_io_error(TcpOperation::Accept, err)) {
            Ok((stream, _)) => match inner.accepted(stream) {
                Ok(transport) => {
                    let (released, on_release) = oneshot::channel::<()>();
                    let ack = AcceptAck::new(move || {
                        let _ = released.send(());
                    });
                    let acceptor = Arc::clone(&acceptor);
                    ctx.submit(move || acceptor.on_accept(Arc::new(transport), ack));
                    // 任务被丢弃时发送端随之释放，同样视为确认。
                    let _ = on_release.await;
                }
                Err(error) => {
                    let acceptor = Arc::clone(&acceptor);
                    ctx.submit(move || acceptor.on_accept_failure(error));
                }
            },
            Err(error) => {
                let acceptor = Arc::clone(&acceptor);
                ctx.submit(move || acceptor.on_accept_failure(error));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

impl TransportServer for TcpServer {
    fn set_execution_context(&self, ctx: ExecutionContext) {
        *self.inner.ctx.write() = Some(ctx);
    }

    fn start(&self, acceptor: Arc<dyn AcceptListener>, done: StartCallback) {
        let Some(ctx) = self.inner.context() else {
            done(Err(not_attached()));
            return;
        };
        let result = self.bind_listener().and_then(|listener| {
            let local = listener
                .local_addr()
                .map_err(|err| map_io_error(TcpOperation::Bind, err))?;
            Ok((Arc::new(listener), local))
        });
        match result {
            Ok((listener, local)) => {
                *self.inner.local.lock() = Some(local.into());
                *self.inner.listener.lock() = Some(Arc::clone(&listener));
                self.inner.control.send_replace(AcceptControl::Running);
                self.inner.handle.spawn(accept_loop(
                    Arc::clone(&self.inner),
                    listener,
                    acceptor,
                ));
                tracing::debug!(addr = %local, "tcp listener bound");
                ctx.submit(move || done(Ok(())));
            }
            Err(error) => ctx.submit(move || done(Err(error))),
        }
    }

    fn stop(&self, done: Completion) {
        self.inner.control.send_replace(AcceptControl::Stopped);
        self.inner.listener.lock().take();
        match self.inner.context() {
            Some(ctx) => ctx.submit(move || done.run()),
            None => done.run(),
        }
    }

    fn suspend(&self) {
        self.inner.control.send_if_modified(|state| {
            if *state == AcceptControl::Running {
                *state = AcceptControl::Suspended;
                true
            } else {
                false
            }
        });
    }

    fn resume(&self) {
        self.inner.control.send_if_modified(|state| {
            if *state == AcceptControl::Suspended {
                *state = AcceptControl::Running;
                true
            } else {
                false
            }
        });
    }

    fn is_suspended(&self) -> bool {
        *self.inner.control.borrow() == AcceptControl::Suspended
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        *self.inner.local.lock()
    }

    fn set_receive_buffer_size(&self, bytes: usize) {
        self.inner.sizes.lock().receive = Some(bytes);
        self.inner
            .update_listener_size(|socket| socket.set_recv_buffer_size(bytes));
    }

    fn set_send_buffer_size(&self, bytes: usize) {
        self.inner.sizes.lock().send = Some(bytes);
        self.inner
            .update_listener_size(|socket| socket.set_send_buffer_size(bytes));
    }

    fn buffer_sizes(&self) -> BufferSizes {
        *self.inner.sizes.lock()
    }
}

/// 为 `tcp://` 地址创建 [`TcpServer`]。
///
/// 采用构建器风格调整默认选项：
///
/// ```no_run
/// # use spark_transport_tcp::TcpServerFactory;
/// # fn demo(handle: tokio::runtime::Handle) {
/// let factory = TcpServerFactory::new(handle).with_backlog(512).with_nodelay(false);
/// # let _ = factory;
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct TcpServerFactory {
    handle: Handle,
    options: TcpOptions,
}

impl TcpServerFactory {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            options: TcpOptions::default(),
        }
    }

    /// 绑定到当前线程所在的运行时。
    pub fn current() -> spark_core::Result<Self> {
        TokioExecutor::current().map(|executor| Self::new(executor.handle().clone()))
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.options.backlog = backlog;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.options.nodelay = nodelay;
        self
    }

    /// 设置写缓冲区的高低水位。
    pub fn with_write_watermarks(mut self, high: usize, low: usize) -> Self {
        self.options.write_high_water = high;
        self.options.write_low_water = low;
        self
    }

    pub fn options(&self) -> &TcpOptions {
        &self.options
    }
}

impl ServerFactory for TcpServerFactory {
    fn supports(&self, scheme: &str) -> bool {
        scheme == "tcp"
    }

    fn bind(
        &self,
        _uri: &BindUri,
        addr: SocketAddr,
    ) -> spark_core::Result<Arc<dyn TransportServer>> {
        Ok(Arc::new(TcpServer::new(
            self.handle.clone(),
            addr,
            self.options.clone(),
        )))
    }
}
