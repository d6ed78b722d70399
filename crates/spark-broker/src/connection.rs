//! 单条 Broker 连接：执行上下文 + 生命周期 + 传输 + 可替换的协议处理器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每条连接都是独立调度的 Actor：同一连接上的事件严格串行，不同连接之间互不阻塞；
//!
//! ## 逻辑（How）
//! - 启动钩子把连接的执行上下文交给传输并启动它；传输启动完成后先报告钩子成功，
//!   再投递 `on_connected`，保证处理器看到的状态已是 STARTED；
//! - 传输事件经 [`TransportListener`] 投递回连接的上下文，再转交当前处理器；
//!   处理器在回调中请求替换时，回调返回后立即换上新处理器并补发 `on_connected`；
//! - 传输失败只影响本连接：记录日志、通知处理器，若尚未停止则异步停止；
//! - 停止钩子先停止传输，再通知处理器，最后把最终计数交给停止观察者（连接器）。
//!
//! ## 契约（What）
//! - 连接不持有连接器的强引用；停止观察者由连接器以弱引用实现；
//! - 状态快照通过 [`BrokerConnection::status`] 在连接上下文中生成后回调给调用方。

use crate::{
    protocol::{HandlerContext, ProtocolHandler},
    status::ConnectionStatus,
};
use spark_core::{
    Actor, Completion, CoreError, ExecutionContext, Executor, HookDone, ServiceHooks,
    ServiceState, error::codes,
    lifecycle::{CompletionFuture, WeakActor},
};
use spark_transport::{Frame, Transport, TransportListener, TransportStats};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// 连接停止后收到连接标识与最终传输计数的观察者。
pub type StopObserver = Arc<dyn Fn(u64, TransportStats) + Send + Sync + 'static>;

enum HandlerEvent {
    Connected,
    Frame(Frame),
    ProtocolDetected(String),
    Refill,
    Failure(CoreError),
    Disconnected,
}

/// 连接的服务状态，只在连接的执行上下文中访问。
pub struct ConnectionState {
    id: u64,
    connector: String,
    transport: Arc<dyn Transport>,
    handler: Option<Box<dyn ProtocolHandler>>,
    protocol: String,
    on_stopped: Option<StopObserver>,
}

impl ConnectionState {
    fn deliver(&mut self, actor: &Actor<ConnectionState>, event: HandlerEvent) {
        let connection = BrokerConnection {
            id: self.id,
            actor: actor.clone(),
        };
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let Some(mut handler) = self.handler.take() else {
                return;
            };
            let reconnect = !matches!(event, HandlerEvent::Disconnected);
            let mut cx = HandlerContext::new(&connection, &self.transport);
            match event {
                HandlerEvent::Connected => handler.on_connected(&mut cx),
                HandlerEvent::Frame(frame) => handler.on_frame(&mut cx, frame),
                HandlerEvent::ProtocolDetected(protocol) => {
                    handler.on_protocol_detected(&mut cx, &protocol)
                }
                HandlerEvent::Refill => handler.on_refill(&mut cx),
                HandlerEvent::Failure(error) => handler.on_failure(&mut cx, &error),
                HandlerEvent::Disconnected => handler.on_disconnected(&mut cx),
            }
            let (replacement, stop) = cx.into_parts();
            match replacement {
                Some(replacement) => {
                    tracing::debug!(
                        connection = self.id,
                        from = handler.protocol(),
                        to = replacement.protocol(),
                        "protocol handler replaced"
                    );
                    self.protocol = replacement.protocol().to_owned();
                    self.handler = Some(replacement);
                    if reconnect {
                        next = Some(HandlerEvent::Connected);
                    }
                }
                None => self.handler = Some(handler),
            }
            if stop && !actor.service_state().is_stopping_or_stopped() {
                actor.stop(Completion::noop());
            }
        }
    }

    fn transport_failed(&mut self, actor: &Actor<ConnectionState>, error: CoreError) {
        if error.code() == codes::TRANSPORT_CLOSED {
            tracing::debug!(connection = self.id, "peer closed the connection");
        } else {
            tracing::warn!(
                connection = self.id,
                connector = %self.connector,
                code = error.code(),
                error = %error,
                "connection transport failed"
            );
        }
        self.deliver(actor, HandlerEvent::Failure(error));
        if !actor.service_state().is_stopping_or_stopped() {
            actor.stop(Completion::noop());
        }
    }

    fn transport_stopped(&mut self, actor: &Actor<ConnectionState>, done: HookDone) {
        self.deliver(actor, HandlerEvent::Disconnected);
        let stats = self.transport.stats();
        tracing::debug!(
            connection = self.id,
            connector = %self.connector,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "connection closed"
        );
        if let Some(observer) = &self.on_stopped {
            observer(self.id, stats);
        }
        done.succeed();
    }

    fn status(&self, actor: &Actor<ConnectionState>) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id,
            state: actor.service_state(),
            since: actor.state_since(),
            protocol: self.protocol.clone(),
            connector: self.connector.clone(),
            remote_addr: self.transport.remote_addr(),
            local_addr: self.transport.local_addr(),
            session_id: self.handler.as_ref().and_then(|handler| handler.session_id()),
            stats: self.transport.stats(),
        }
    }
}

impl ServiceHooks for ConnectionState {
    fn start(&mut self, actor: &Actor<Self>, done: HookDone) {
        self.transport.set_execution_context(actor.context().clone());
        let listener = Arc::new(ConnectionEvents {
            connection: actor.downgrade(),
        });
        let handle = actor.clone();
        let id = self.id;
        self.transport.start(
            listener,
            Completion::new(move || {
                done.succeed();
                tracing::debug!(connection = id, "connection established");
                handle.submit(|actor, state| state.deliver(actor, HandlerEvent::Connected));
            }),
        );
    }

    fn stop(&mut self, actor: &Actor<Self>, done: HookDone) {
        let handle = actor.clone();
        self.transport.stop(Completion::new(move || {
            handle.submit(move |actor, state| state.transport_stopped(actor, done));
        }));
    }
}

/// 把传输事件投递回连接上下文的监听器；连接被释放后事件静默丢弃。
struct ConnectionEvents {
    connection: WeakActor<ConnectionState>,
}

impl ConnectionEvents {
    fn deliver(&self, event: HandlerEvent) {
        if let Some(actor) = self.connection.upgrade() {
            actor.submit(move |actor, state| state.deliver(actor, event));
        }
    }
}

impl TransportListener for ConnectionEvents {
    fn on_frame(&self, frame: Frame) {
        self.deliver(HandlerEvent::Frame(frame));
    }

    fn on_protocol_detected(&self, protocol: &str) {
        self.deliver(HandlerEvent::ProtocolDetected(protocol.to_owned()));
    }

    fn on_refill(&self) {
        self.deliver(HandlerEvent::Refill);
    }

    fn on_failure(&self, error: CoreError) {
        if let Some(actor) = self.connection.upgrade() {
            actor.submit(move |actor, state| state.transport_failed(actor, error));
        }
    }
}

/// 连接句柄，可廉价克隆。
#[derive(Clone)]
pub struct BrokerConnection {
    id: u64,
    actor: Actor<ConnectionState>,
}

impl BrokerConnection {
    /// 创建处于 CREATED 的连接；`ctx` 应为该连接独占的新上下文。
    pub fn new(
        id: u64,
        connector: impl Into<String>,
        ctx: ExecutionContext,
        transport: Arc<dyn Transport>,
        handler: Box<dyn ProtocolHandler>,
    ) -> Self {
        let protocol = handler.protocol().to_owned();
        Self {
            id,
            actor: Actor::new(
                ctx,
                ConnectionState {
                    id,
                    connector: connector.into(),
                    transport,
                    handler: Some(handler),
                    protocol,
                    on_stopped: None,
                },
            ),
        }
    }

    /// 设置停止观察者。必须在 `start` 之前调用。
    pub fn with_stop_observer(self, observer: StopObserver) -> Self {
        self.actor
            .with_state(|state| state.on_stopped = Some(observer));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &ExecutionContext {
        self.actor.context()
    }

    pub fn service_state(&self) -> ServiceState {
        self.actor.service_state()
    }

    pub fn state_since(&self) -> SystemTime {
        self.actor.state_since()
    }

    pub fn failure(&self) -> Option<CoreError> {
        self.actor.failure()
    }

    pub fn start(&self, done: Completion) {
        self.actor.start(done);
    }

    pub fn stop(&self, done: Completion) {
        self.actor.stop(done);
    }

    pub fn start_async(&self) -> CompletionFuture {
        self.actor.start_async()
    }

    pub fn stop_async(&self) -> CompletionFuture {
        self.actor.stop_async()
    }

    /// 在 `delay` 后于连接上下文中执行 `task`；连接重启、停止或被释放后自动失效。
    ///
    /// `task` 执行期间持有连接状态，只应调用 `id`/`service_state`/`stop` 这类不触碰状态的方法。
    pub fn schedule_once(
        &self,
        delay: Duration,
        task: impl FnOnce(&BrokerConnection) + Send + 'static,
    ) {
        let id = self.id;
        self.actor.schedule_once(delay, move |actor, _| {
            task(&BrokerConnection {
                id,
                actor: actor.clone(),
            })
        });
    }

    /// 把连接（连同其传输的回调）改到 `executor` 上执行。已排队的任务仍在原执行器上排空。
    pub fn retarget(&self, executor: Arc<dyn Executor>, done: Completion) {
        self.actor.submit(move |actor, state| {
            actor.context().set_target(executor);
            tracing::debug!(connection = state.id, "connection retargeted");
            actor.context().submit(move || done.run());
        });
    }

    /// 在连接上下文中生成状态快照并回调 `reply`。
    pub fn status(&self, reply: impl FnOnce(ConnectionStatus) + Send + 'static) {
        self.actor
            .submit(move |actor, state| reply(state.status(actor)));
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("id", &self.id)
            .field("state", &self.actor.service_state())
            .finish()
    }
}
