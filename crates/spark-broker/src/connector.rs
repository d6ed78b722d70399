//! 监听型连接器：绑定地址、接受连接、执行连接上限并为每条连接装配协议。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接器是“监听服务 → 连接”的唯一入口：准入控制、协议选择与缓冲区调优都在这里落地；
//! - 连接器自身也是 Actor，接入事件在连接器上下文中串行处理，计数无需额外同步。
//!
//! ## 逻辑（How）
//! - 启动：解析协议模式（固定协议或 `any` 自动识别）→ 解析绑定地址（字面量直接使用，
//!   主机名交给阻塞池解析）→ 工厂绑定 → 启动监听；监听启动结果回到连接器上下文后才报告钩子；
//! - 接入：装配编解码器与处理器 → 创建连接并交给 [`ConnectionOwner`] → 启动连接；
//!   达到上限时先暂停监听、再释放 [`AcceptAck`]，保证暂停生效前不会再有连接被接入；
//! - 连接停止：观察者把最终计数送回连接器，计数减一；低于上限时恢复监听；
//! - 停止：先停监听，再请所有者停止本连接器接入的全部连接，两者都完成后报告钩子。
//!
//! ## 契约（What）
//! - `connected` 只统计本次启动以来接入且尚未停止的连接；
//! - 连接器不持有连接句柄，连接由 [`ConnectionOwner`] 保管。
//!
//! ## 风险与考量（Trade-offs）
//! - 连接上限是“软上限”：暂停接受之后内核 backlog 中的连接仍在排队，恢复后才被接入。

use crate::{
    config::AcceptingConnectorConfig,
    connection::{BrokerConnection, StopObserver},
    error::BrokerError,
    protocol::{
        ANY_PROTOCOL, ConnectorInfo, NegotiatingCodec, NegotiatingHandler, Protocol,
        ProtocolHandler, ProtocolRegistry,
    },
    status::ConnectorStatus,
};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use spark_core::{
    Actor, Completion, CoreError, ExecutionContext, Executor, HookDone, ServiceHooks,
    ServiceState,
    dispatch::BlockingPool,
    lifecycle::{CompletionFuture, TaskTracker, WeakActor},
};
use spark_transport::{
    AcceptAck, AcceptListener, BindUri, BufferSizes, ProtocolCodec, ServerFactory, Transport,
    TransportServer, TransportSocketAddr, TransportStats,
};
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

/// 停止期间输出未完成任务的间隔。
const STOP_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// 连接的保管者：分配连接标识、登记与注销连接、批量停止连接，并提供当前调优的缓冲区大小。
///
/// 所有方法都可能在连接器上下文中被调用，实现不得同步等待连接器。
pub trait ConnectionOwner: Send + Sync + 'static {
    fn next_connection_id(&self) -> u64;

    fn adopt(&self, connection: BrokerConnection);

    fn release(&self, connection_id: u64);

    /// 停止 `ids` 中仍登记在册的连接，全部完成后运行 `done`。
    fn stop_connections(&self, ids: Vec<u64>, done: Completion);

    /// 新绑定的监听应采用的套接字缓冲区大小；`None` 表示沿用系统默认值。
    fn tuned_buffer_size(&self) -> Option<usize>;
}

/// 不隶属 Broker 时使用的连接登记表。
#[derive(Clone, Default)]
pub struct LocalConnections {
    next_id: Arc<AtomicU64>,
    connections: Arc<DashMap<u64, BrokerConnection>>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<BrokerConnection> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// 登记中的连接标识，升序。
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConnectionOwner for LocalConnections {
    fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn adopt(&self, connection: BrokerConnection) {
        self.connections.insert(connection.id(), connection);
    }

    fn release(&self, connection_id: u64) {
        self.connections.remove(&connection_id);
    }

    fn stop_connections(&self, ids: Vec<u64>, done: Completion) {
        let tracker = TaskTracker::new("local connections");
        for id in ids {
            if let Some(connection) = self.get(id) {
                connection.stop(tracker.task(format!("connection {id}")));
            }
        }
        tracker.seal(done);
    }

    fn tuned_buffer_size(&self) -> Option<usize> {
        None
    }
}

/// 连接器运行所需的共享服务。
#[derive(Clone)]
pub struct ConnectorServices {
    pub protocols: Arc<ProtocolRegistry>,
    pub factories: Vec<Arc<dyn ServerFactory>>,
    /// 连接器与连接的执行上下文都建立在该执行器之上。
    pub executor: Arc<dyn Executor>,
    /// 主机名解析使用的阻塞池；缺省时在连接器上下文中同步解析。
    pub blocking: Option<BlockingPool>,
}

impl ConnectorServices {
    pub fn new(protocols: Arc<ProtocolRegistry>, executor: Arc<dyn Executor>) -> Self {
        Self {
            protocols,
            factories: Vec::new(),
            executor,
            blocking: None,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn with_blocking_pool(mut self, pool: BlockingPool) -> Self {
        self.blocking = Some(pool);
        self
    }

    fn factory_for(&self, scheme: &str) -> Result<Arc<dyn ServerFactory>, BrokerError> {
        self.factories
            .iter()
            .find(|factory| factory.supports(scheme))
            .cloned()
            .ok_or_else(|| BrokerError::UnsupportedScheme(scheme.to_owned()))
    }
}

/// 本次启动解析出的协议模式。
#[derive(Clone)]
enum ProtocolMode {
    Fixed(Arc<dyn Protocol>),
    Detect {
        candidates: Arc<[Arc<dyn Protocol>]>,
        timeout: Duration,
    },
}

impl ProtocolMode {
    fn assemble(&self, info: ConnectorInfo) -> (Box<dyn ProtocolCodec>, Box<dyn ProtocolHandler>) {
        match self {
            ProtocolMode::Fixed(protocol) => {
                (protocol.create_codec(&info), protocol.create_handler())
            }
            ProtocolMode::Detect {
                candidates,
                timeout,
            } => {
                let codec: Box<dyn ProtocolCodec> =
                    Box::new(NegotiatingCodec::new(Arc::clone(candidates), info));
                let handler: Box<dyn ProtocolHandler> =
                    Box::new(NegotiatingHandler::new(Arc::clone(candidates), *timeout));
                (codec, handler)
            }
        }
    }
}

/// 连接器的服务状态。
pub struct ConnectorState {
    config: AcceptingConnectorConfig,
    services: ConnectorServices,
    owner: Arc<dyn ConnectionOwner>,
    local: Arc<ArcSwapOption<TransportSocketAddr>>,
    mode: Option<ProtocolMode>,
    server: Option<Arc<dyn TransportServer>>,
    accepted: u64,
    connected: u64,
    suspended_at_limit: bool,
    live: HashMap<u64, Arc<dyn Transport>>,
    retired: TransportStats,
    applied: BufferSizes,
}

impl ConnectorState {
    fn reset(&mut self) {
        self.mode = None;
        self.server = None;
        self.accepted = 0;
        self.connected = 0;
        self.suspended_at_limit = false;
        self.live.clear();
        self.retired = TransportStats::default();
        self.applied = BufferSizes::default();
    }

    fn resolve_mode(&self) -> Result<ProtocolMode, BrokerError> {
        if self.config.protocol != ANY_PROTOCOL {
            return self
                .services
                .protocols
                .get(&self.config.protocol)
                .map(ProtocolMode::Fixed);
        }
        let filter = self
            .config
            .detect_config()
            .and_then(|detect| detect.protocols.as_deref());
        let candidates = self.services.protocols.detectable(filter);
        if candidates.is_empty() {
            return Err(BrokerError::NoDetectableProtocols {
                connector: self.config.id.clone(),
            });
        }
        Ok(ProtocolMode::Detect {
            candidates: candidates.into(),
            timeout: self.config.detect_timeout(),
        })
    }

    fn prepare(&self) -> Result<(ProtocolMode, BindUri, Arc<dyn ServerFactory>), CoreError> {
        let mode = self.resolve_mode()?;
        let uri: BindUri = self.config.bind.parse()?;
        let factory = self.services.factory_for(uri.scheme())?;
        Ok((mode, uri, factory))
    }

    fn bind(
        &mut self,
        actor: &Actor<ConnectorState>,
        uri: BindUri,
        addr: SocketAddr,
        factory: Arc<dyn ServerFactory>,
        done: HookDone,
    ) {
        let server = match factory.bind(&uri, addr) {
            Ok(server) => server,
            Err(error) => return done.fail(error),
        };
        server.set_execution_context(actor.context().clone());
        if let Some(size) = self.owner.tuned_buffer_size() {
            self.apply_buffer_size(server.as_ref(), size);
        }
        self.server = Some(Arc::clone(&server));
        let acceptor = Arc::new(Acceptor {
            connector: actor.downgrade(),
        });
        let handle = actor.clone();
        server.start(
            acceptor,
            Box::new(move |result: spark_core::Result<()>| {
                handle.submit(move |actor, state| state.listening(actor, &uri, result, done));
            }),
        );
    }

    fn listening(
        &mut self,
        actor: &Actor<ConnectorState>,
        uri: &BindUri,
        result: spark_core::Result<()>,
        done: HookDone,
    ) {
        if let Err(error) = result {
            self.server = None;
            return done.fail(error);
        }
        let local = self.server.as_ref().and_then(|server| server.local_addr());
        self.local.store(local.map(Arc::new));
        tracing::info!(
            connector = %self.config.id,
            bind = %uri,
            local = ?local,
            protocol = %self.config.protocol,
            actor = %actor.context().label(),
            "accepting connections"
        );
        done.succeed();
    }

    fn accept(
        &mut self,
        actor: &Actor<ConnectorState>,
        transport: Arc<dyn Transport>,
        ack: AcceptAck,
    ) {
        let Some(mode) = self.mode.as_ref() else {
            transport.stop(Completion::noop());
            return ack.release();
        };
        if actor.service_state().is_stopping_or_stopped() {
            tracing::debug!(connector = %self.config.id, "connector is stopping; dropping accepted transport");
            transport.stop(Completion::noop());
            return ack.release();
        }

        let (codec, handler) = mode.assemble(ConnectorInfo {
            id: self.config.id.clone(),
            local_addr: transport.local_addr(),
        });
        transport.set_codec(codec);
        self.accepted += 1;
        self.connected += 1;

        let id = self.owner.next_connection_id();
        let remote = transport
            .remote_addr()
            .map_or_else(|| "unknown".to_owned(), |addr| addr.to_string());
        let ctx = ExecutionContext::new(
            format!("connection {id} to {remote}"),
            Arc::clone(&self.services.executor),
        );
        let connection = BrokerConnection::new(
            id,
            self.config.id.clone(),
            ctx,
            Arc::clone(&transport),
            handler,
        )
        .with_stop_observer(stop_observer(actor.downgrade()));

        if self.accepted == 1 {
            tracing::info!(connector = %self.config.id, %remote, "first connection accepted");
        }
        tracing::debug!(connector = %self.config.id, connection = id, %remote, "adding new connection");
        self.live.insert(id, transport);
        self.owner.adopt(connection.clone());

        let probe = connection.clone();
        let weak = actor.downgrade();
        connection.start(Completion::new(move || {
            let Some(error) = probe.failure() else {
                return;
            };
            tracing::warn!(
                connection = probe.id(),
                code = error.code(),
                error = %error,
                "connection failed to start"
            );
            if let Some(connector) = weak.upgrade() {
                let id = probe.id();
                connector.submit(move |actor, state| {
                    state.connection_stopped(actor, id, TransportStats::default())
                });
            }
        }));

        if self.at_connection_limit() {
            tracing::info!(
                connector = %self.config.id,
                connected = self.connected,
                limit = ?self.config.connection_limit,
                "connection limit reached; suspending accept"
            );
            if let Some(server) = &self.server {
                server.suspend();
            }
            self.suspended_at_limit = true;
        }
        ack.release();
    }

    fn at_connection_limit(&self) -> bool {
        self.config
            .connection_limit
            .is_some_and(|limit| self.connected >= u64::from(limit))
    }

    fn connection_stopped(&mut self, _actor: &Actor<ConnectorState>, id: u64, stats: TransportStats) {
        // 上一轮启动遗留的通知与重复通知都在这里被过滤。
        if self.live.remove(&id).is_none() {
            return;
        }
        self.connected = self.connected.saturating_sub(1);
        self.retired.merge(&stats);
        self.owner.release(id);
        if self.suspended_at_limit && !self.at_connection_limit() {
            self.suspended_at_limit = false;
            if let Some(server) = &self.server {
                server.resume();
            }
            tracing::info!(
                connector = %self.config.id,
                connected = self.connected,
                "below connection limit; resuming accept"
            );
        }
    }

    fn apply_buffer_size(&mut self, server: &dyn TransportServer, size: usize) {
        let mut changed = false;
        if self.config.receive_buffer_auto_tune && self.applied.receive != Some(size) {
            server.set_receive_buffer_size(size);
            self.applied.receive = Some(size);
            changed = true;
        }
        if self.config.send_buffer_auto_tune && self.applied.send != Some(size) {
            server.set_send_buffer_size(size);
            self.applied.send = Some(size);
            changed = true;
        }
        if changed {
            tracing::debug!(connector = %self.config.id, size, "socket buffer sizes updated");
        }
    }

    fn status(&self, actor: &Actor<ConnectorState>) -> ConnectorStatus {
        let mut stats = self.retired;
        for transport in self.live.values() {
            stats.merge(&transport.stats());
        }
        ConnectorStatus {
            id: self.config.id.clone(),
            state: actor.service_state(),
            since: actor.state_since(),
            protocol: self.config.protocol.clone(),
            local_addr: self.local.load_full().map(|addr| *addr),
            accepted: self.accepted,
            connected: self.connected,
            connection_limit: self.config.connection_limit,
            suspended: self
                .server
                .as_ref()
                .is_some_and(|server| server.is_suspended()),
            stats,
        }
    }
}

fn stop_observer(connector: WeakActor<ConnectorState>) -> StopObserver {
    Arc::new(move |id: u64, stats: TransportStats| {
        if let Some(actor) = connector.upgrade() {
            actor.submit(move |actor, state| state.connection_stopped(actor, id, stats));
        }
    })
}

impl ServiceHooks for ConnectorState {
    fn start(&mut self, actor: &Actor<Self>, done: HookDone) {
        self.reset();
        let (mode, uri, factory) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(error) => return done.fail(error),
        };
        self.mode = Some(mode);
        if let Some(addr) = uri.literal() {
            return self.bind(actor, uri, addr, factory, done);
        }
        match self.services.blocking.clone() {
            Some(pool) => {
                let handle = actor.clone();
                let target = uri.clone();
                pool.run_on(
                    actor.context(),
                    move || target.resolve(),
                    move |resolved| {
                        handle.submit(move |actor, state| match resolved {
                            Ok(addr) => state.bind(actor, uri, addr, factory, done),
                            Err(error) => done.fail(error),
                        });
                    },
                );
            }
            None => match uri.resolve() {
                Ok(addr) => self.bind(actor, uri, addr, factory, done),
                Err(error) => done.fail(error),
            },
        }
    }

    fn stop(&mut self, actor: &Actor<Self>, done: HookDone) {
        let connector = self.config.id.clone();
        let tracker = TaskTracker::new(format!("connector {connector} stop"));
        if let Some(server) = self.server.take() {
            server.stop(tracker.task("listener"));
        }
        self.local.store(None);
        let ids: Vec<u64> = self.live.keys().copied().collect();
        self.owner
            .stop_connections(ids, tracker.task("connections"));
        tracker.watch(actor.context(), STOP_WATCH_INTERVAL);
        tracker.seal(Completion::new(move || {
            tracing::info!(%connector, "connector stopped");
            done.succeed();
        }));
    }
}

/// 把监听服务的接入事件投递回连接器上下文。
struct Acceptor {
    connector: WeakActor<ConnectorState>,
}

impl AcceptListener for Acceptor {
    fn on_accept(&self, transport: Arc<dyn Transport>, ack: AcceptAck) {
        match self.connector.upgrade() {
            Some(actor) => actor.submit(move |actor, state| state.accept(actor, transport, ack)),
            None => transport.stop(Completion::noop()),
        }
    }

    fn on_accept_failure(&self, error: CoreError) {
        if let Some(actor) = self.connector.upgrade() {
            actor.submit(move |_, state| {
                tracing::warn!(
                    connector = %state.config.id,
                    code = error.code(),
                    error = %error,
                    "failed to accept connection"
                );
            });
        }
    }
}

/// 监听型连接器句柄，可廉价克隆。
#[derive(Clone)]
pub struct AcceptingConnector {
    id: Arc<str>,
    actor: Actor<ConnectorState>,
    local: Arc<ArcSwapOption<TransportSocketAddr>>,
}

impl AcceptingConnector {
    pub fn new(
        config: AcceptingConnectorConfig,
        services: ConnectorServices,
        owner: Arc<dyn ConnectionOwner>,
    ) -> Self {
        let id: Arc<str> = Arc::from(config.id.as_str());
        let local = Arc::new(ArcSwapOption::empty());
        let ctx = ExecutionContext::new(format!("connector {id}"), Arc::clone(&services.executor));
        let actor = Actor::new(
            ctx,
            ConnectorState {
                config,
                services,
                owner,
                local: Arc::clone(&local),
                mode: None,
                server: None,
                accepted: 0,
                connected: 0,
                suspended_at_limit: false,
                live: HashMap::new(),
                retired: TransportStats::default(),
                applied: BufferSizes::default(),
            },
        );
        Self { id, actor, local }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &ExecutionContext {
        self.actor.context()
    }

    /// 监听实际绑定的地址；未在监听时为 `None`。
    pub fn local_addr(&self) -> Option<TransportSocketAddr> {
        self.local.load_full().map(|addr| *addr)
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

    /// 替换配置；运行中的连接器随即以新配置重启，未运行时只保存配置。
    ///
    /// 连接器标识不可更改，新配置中的 `id` 被忽略。
    pub fn update(&self, mut config: AcceptingConnectorConfig, done: Completion) {
        self.actor.submit(move |actor, state| {
            if config.id != state.config.id {
                tracing::warn!(
                    connector = %state.config.id,
                    requested = %config.id,
                    "connector id cannot change; keeping the current id"
                );
                config.id = state.config.id.clone();
            }
            state.config = config;
            if actor.service_state().is_started() {
                tracing::info!(connector = %state.config.id, "configuration updated; restarting");
                let handle = actor.clone();
                actor.stop(Completion::new(move || handle.start(done)));
            } else {
                actor.context().submit(move || done.run());
            }
        });
    }

    /// 把调优后的缓冲区大小应用到监听；只影响开启了自动调优的方向，大小未变时不做任何事。
    pub fn update_buffer_settings(&self, size: usize) {
        self.actor.submit(move |_, state| {
            if let Some(server) = state.server.clone() {
                state.apply_buffer_size(server.as_ref(), size);
            }
        });
    }

    /// 在连接器上下文中生成状态快照并回调 `reply`。
    pub fn status(&self, reply: impl FnOnce(ConnectorStatus) + Send + 'static) {
        self.actor
            .submit(move |actor, state| reply(state.status(actor)));
    }
}

impl fmt::Debug for AcceptingConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptingConnector")
            .field("id", &self.id)
            .field("state", &self.actor.service_state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DetectConfig, ProtocolConfig},
        error::codes as broker_codes,
        protocol::testing::LineProtocol,
    };
    use bytes::Bytes;
    use parking_lot::Mutex;
    use spark_core::{dispatch::ManualExecutor, error::codes};
    use spark_transport::mock::{MockServer, MockServerFactory, MockTransport};
    use tracing_test::traced_test;

    struct Fixture {
        executor: Arc<ManualExecutor>,
        factory: MockServerFactory,
        owner: LocalConnections,
        connector: AcceptingConnector,
    }

    fn protocols() -> Arc<ProtocolRegistry> {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(LineProtocol::new("amqp", Some(b"AMQP")))
            .expect("amqp");
        registry
            .register(LineProtocol::new("stomp", Some(b"CONNECT")))
            .expect("stomp");
        registry
            .register(LineProtocol::new("lines", None))
            .expect("lines");
        Arc::new(registry)
    }

    fn fixture(config: AcceptingConnectorConfig) -> Fixture {
        let executor = Arc::new(ManualExecutor::new());
        let factory = MockServerFactory::new();
        let services = ConnectorServices::new(protocols(), executor.clone())
            .with_factory(Arc::new(factory.clone()));
        let owner = LocalConnections::new();
        let connector = AcceptingConnector::new(config, services, Arc::new(owner.clone()));
        Fixture {
            executor,
            factory,
            owner,
            connector,
        }
    }

    fn started(config: AcceptingConnectorConfig) -> (Fixture, MockServer) {
        let fixture = fixture(config);
        fixture.connector.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.connector.service_state(), ServiceState::Started);
        let server = fixture.factory.last().expect("server bound");
        (fixture, server)
    }

    fn status(fixture: &Fixture) -> ConnectorStatus {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        fixture
            .connector
            .status(move |status| *sink.lock() = Some(status));
        fixture.executor.run_until_idle();
        let status = slot.lock().take();
        status.expect("status reply")
    }

    fn echoed(transport: &MockTransport) -> Vec<Bytes> {
        transport
            .take_written()
            .into_iter()
            .filter_map(|frame| frame.downcast::<Bytes>().ok())
            .collect()
    }

    #[test]
    #[traced_test]
    fn connection_limit_suspends_and_resumes_accept() {
        let (fixture, server) = started(
            AcceptingConnectorConfig::new("limited", "mock://127.0.0.1:0")
                .with_protocol("lines")
                .with_connection_limit(2),
        );
        for _ in 0..3 {
            server.connect();
        }
        fixture.executor.run_until_idle();
        let snapshot = status(&fixture);
        assert_eq!(snapshot.connected, 2);
        assert!(snapshot.suspended);
        assert_eq!(server.backlog_len(), 1);
        assert_eq!(fixture.owner.len(), 2);

        let first = fixture.owner.ids()[0];
        fixture
            .owner
            .get(first)
            .expect("live connection")
            .stop(Completion::noop());
        fixture.executor.run_until_idle();
        let snapshot = status(&fixture);
        assert_eq!(snapshot.accepted, 3);
        assert_eq!(snapshot.connected, 2);
        assert!(snapshot.suspended, "third connection fills the limit again");
        assert_eq!(server.backlog_len(), 0);
        assert!(logs_contain("connection limit reached; suspending accept"));
        assert!(logs_contain("below connection limit; resuming accept"));
    }

    #[test]
    fn fixed_protocol_serves_connections_and_aggregates_stats() {
        let (fixture, server) = started(
            AcceptingConnectorConfig::new("fixed", "mock://127.0.0.1:61613").with_protocol("lines"),
        );
        assert_eq!(
            fixture.connector.local_addr(),
            Some("127.0.0.1:61613".parse::<SocketAddr>().expect("addr").into())
        );
        let peer = server.connect();
        fixture.executor.run_until_idle();
        peer.receive(b"hello\n");
        fixture.executor.run_until_idle();
        assert_eq!(echoed(&peer), [Bytes::from_static(b"hello\n")]);

        peer.fail(CoreError::new(codes::TRANSPORT_CLOSED, "eof"));
        fixture.executor.run_until_idle();
        let snapshot = status(&fixture);
        assert_eq!(snapshot.connected, 0);
        assert_eq!(snapshot.accepted, 1);
        assert_eq!(snapshot.stats.bytes_read, 6);
        assert_eq!(snapshot.stats.frames_read, 1);
        assert!(fixture.owner.is_empty());
    }

    #[test]
    fn detection_switches_to_matching_protocol() {
        let (fixture, server) =
            started(AcceptingConnectorConfig::new("auto", "mock://127.0.0.1:0"));
        let peer = server.connect();
        fixture.executor.run_until_idle();
        peer.receive(b"CONNECT\nhello\n");
        fixture.executor.run_until_idle();
        assert_eq!(
            echoed(&peer),
            [
                Bytes::from_static(b"CONNECT\n"),
                Bytes::from_static(b"hello\n")
            ]
        );
        assert_eq!(peer.codec_protocol().as_deref(), Some("stomp"));
    }

    #[test]
    fn detection_timeout_closes_silent_connections() {
        let (fixture, server) = started(
            AcceptingConnectorConfig::new("auto", "mock://127.0.0.1:0").with_protocol_config(
                ProtocolConfig::Detect(DetectConfig {
                    protocols: None,
                    timeout_ms: 200,
                }),
            ),
        );
        let peer = server.connect();
        fixture.executor.run_until_idle();
        peer.receive(b"CON");
        fixture.executor.advance(Duration::from_millis(250));
        fixture.executor.run_until_idle();
        assert!(peer.is_stopped());
        assert_eq!(status(&fixture).connected, 0);
    }

    #[test]
    fn detection_timer_is_inert_once_protocol_is_detected() {
        let (fixture, server) = started(
            AcceptingConnectorConfig::new("auto", "mock://127.0.0.1:0").with_protocol_config(
                ProtocolConfig::Detect(DetectConfig {
                    protocols: None,
                    timeout_ms: 200,
                }),
            ),
        );
        let peer = server.connect();
        fixture.executor.run_until_idle();
        peer.receive(b"CONNECT\n");
        fixture.executor.run_until_idle();
        assert_eq!(peer.codec_protocol().as_deref(), Some("stomp"));

        fixture.executor.advance(Duration::from_millis(1000));
        fixture.executor.run_until_idle();
        assert!(!peer.is_stopped());
        assert_eq!(status(&fixture).connected, 1);
        assert_eq!(fixture.owner.len(), 1);
    }

    #[test]
    fn unidentified_bytes_close_the_connection() {
        let (fixture, server) =
            started(AcceptingConnectorConfig::new("auto", "mock://127.0.0.1:0"));
        let peer = server.connect();
        fixture.executor.run_until_idle();
        peer.receive(b"GET / HTTP/1.1\r\n");
        fixture.executor.run_until_idle();
        assert!(peer.is_stopped());
        assert!(fixture.owner.is_empty());
    }

    #[test]
    fn start_fails_without_detectable_protocols() {
        let fixture = fixture(
            AcceptingConnectorConfig::new("auto", "mock://127.0.0.1:0").with_protocol_config(
                ProtocolConfig::Detect(DetectConfig {
                    protocols: Some(vec!["lines".into()]),
                    ..DetectConfig::default()
                }),
            ),
        );
        fixture.connector.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.connector.service_state(), ServiceState::Failed);
        let failure = fixture.connector.failure().expect("failure");
        assert_eq!(failure.code(), broker_codes::NO_DETECTABLE_PROTOCOLS);
        assert!(fixture.factory.servers().is_empty());
    }

    #[test]
    fn start_fails_for_unsupported_scheme_and_bind_errors() {
        let unsupported = fixture(AcceptingConnectorConfig::new("tcp", "tcp://127.0.0.1:0"));
        unsupported.connector.start(Completion::noop());
        unsupported.executor.run_until_idle();
        assert_eq!(
            unsupported.connector.failure().map(|error| error.code()),
            Some(broker_codes::UNSUPPORTED_SCHEME)
        );

        let refused = fixture(AcceptingConnectorConfig::new("mock", "mock://127.0.0.1:0"));
        refused.factory.fail_binds(true);
        refused.connector.start(Completion::noop());
        refused.executor.run_until_idle();
        assert_eq!(refused.connector.service_state(), ServiceState::Failed);
        assert_eq!(
            refused.connector.failure().map(|error| error.code()),
            Some("spark.transport.mock.bind_failed")
        );
    }

    #[test]
    fn stop_closes_listener_and_every_connection() {
        let (fixture, server) = started(
            AcceptingConnectorConfig::new("fixed", "mock://127.0.0.1:0").with_protocol("lines"),
        );
        let peers = [server.connect(), server.connect()];
        fixture.executor.run_until_idle();
        assert_eq!(fixture.owner.len(), 2);

        fixture.connector.stop(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.connector.service_state(), ServiceState::Stopped);
        assert!(!server.is_started());
        assert!(peers.iter().all(MockTransport::is_stopped));
        assert!(fixture.owner.is_empty());
        assert_eq!(fixture.connector.local_addr(), None);
    }

    #[test]
    fn update_restarts_with_new_configuration() {
        let (fixture, _) = started(
            AcceptingConnectorConfig::new("fixed", "mock://127.0.0.1:0").with_protocol("lines"),
        );
        let done = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&done);
        fixture.connector.update(
            AcceptingConnectorConfig::new("fixed", "mock://127.0.0.1:0").with_protocol("amqp"),
            Completion::new(move || *flag.lock() = true),
        );
        fixture.executor.run_until_idle();
        assert!(*done.lock());
        assert_eq!(fixture.connector.service_state(), ServiceState::Started);
        assert_eq!(fixture.factory.servers().len(), 2);
        assert_eq!(status(&fixture).protocol, "amqp");
    }

    #[test]
    fn buffer_settings_respect_auto_tune_flags() {
        let mut config =
            AcceptingConnectorConfig::new("fixed", "mock://127.0.0.1:0").with_protocol("lines");
        config.send_buffer_auto_tune = false;
        let (fixture, server) = started(config);
        fixture.connector.update_buffer_settings(4096);
        fixture.executor.run_until_idle();
        assert_eq!(
            server.buffer_sizes(),
            BufferSizes {
                receive: Some(4096),
                send: None
            }
        );
    }
}
