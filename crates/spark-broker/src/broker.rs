//! Broker：连接器与连接的唯一所有者。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接器与连接的集合只由 Broker 自己的执行上下文修改，其他线程通过 copy-on-write 的
//!   [`BrokerSnapshot`] 无锁读取；
//! - 连接不回指 Broker：连接器经由 [`ConnectionOwner`] 把连接交给 Broker，Broker 持有句柄，
//!   连接器只记连接标识。
//!
//! ## 逻辑（How）
//! - 启动：登记到注册表（若配置）→ 按配置创建连接器 → 用 [`TaskTracker`] 并行启动全部连接器 →
//!   全部结束后开启采样定时器并发布快照；单个连接器启动失败只记录告警；
//! - 每次登记连接都会用当前连接数更新调优器，峰值突破平台时立即把新大小推给全部连接器；
//!   采样定时器每个周期滚动一次窗口；
//! - 停止：先停全部连接器（连接器会停掉自己接入的连接），再停仍在册的连接，最后注销。
//!
//! ## 契约（What）
//! - 连接标识单调递增，从 1 开始；
//! - 采样定时器绑定 Broker 的代际令牌，停止或重启后旧定时器自动失效。

use crate::{
    config::{AcceptingConnectorConfig, BrokerConfig, ConnectorConfig},
    connection::BrokerConnection,
    connector::{AcceptingConnector, ConnectionOwner, ConnectorServices},
    error::BrokerError,
    protocol::{Protocol, ProtocolRegistry},
    registry::BrokerRegistry,
    status::BrokerStatus,
    tuner::BufferTuner,
};
use arc_swap::ArcSwap;
use spark_core::{
    Actor, Completion, CoreError, ExecutionContext, Executor, HookDone, ServiceHooks,
    ServiceState,
    dispatch::{BlockingPool, TokioExecutor},
    lifecycle::{CompletionFuture, TaskTracker, WeakActor},
};
use spark_transport::ServerFactory;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

/// 启动/停止期间输出未完成任务的间隔。
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// 可从任意线程无锁读取的 Broker 视图。
#[derive(Clone, Debug, Default)]
pub struct BrokerSnapshot {
    pub connectors: Vec<AcceptingConnector>,
    pub connections: usize,
    /// 当前调优得到的套接字缓冲区大小（字节）。
    pub buffer_size: usize,
}

impl BrokerSnapshot {
    pub fn connector(&self, id: &str) -> Option<&AcceptingConnector> {
        self.connectors.iter().find(|connector| connector.id() == id)
    }

    pub fn connector_ids(&self) -> Vec<&str> {
        self.connectors.iter().map(AcceptingConnector::id).collect()
    }
}

struct BrokerShared {
    id: String,
    next_connection_id: AtomicU64,
    snapshot: ArcSwap<BrokerSnapshot>,
}

/// Broker 的服务状态。
pub struct BrokerState {
    config: BrokerConfig,
    services: ConnectorServices,
    registry: Option<BrokerRegistry>,
    shared: Arc<BrokerShared>,
    connectors: Vec<AcceptingConnector>,
    connections: BTreeMap<u64, BrokerConnection>,
    tuner: BufferTuner,
}

impl BrokerState {
    fn handle(&self, actor: &Actor<BrokerState>) -> Broker {
        Broker {
            actor: actor.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    fn publish(&self) {
        self.shared.snapshot.store(Arc::new(BrokerSnapshot {
            connectors: self.connectors.clone(),
            connections: self.connections.len(),
            buffer_size: self.tuner.buffer_size(),
        }));
    }

    fn fresh_tuner(config: &BrokerConfig) -> BufferTuner {
        BufferTuner::new(
            config.heap_budget_bytes,
            config.window_samples,
            config.sampling_period(),
        )
    }

    fn started(&mut self, actor: &Actor<BrokerState>, done: HookDone) {
        for connector in &self.connectors {
            if let Some(error) = connector.failure() {
                tracing::warn!(
                    broker = %self.config.id,
                    connector = connector.id(),
                    code = error.code(),
                    error = %error,
                    "connector failed to start"
                );
            }
        }
        actor.schedule_recurring(self.config.sampling_period(), |_, state| state.roll());
        self.publish();
        tracing::info!(
            broker = %self.config.id,
            connectors = self.connectors.len(),
            "broker started"
        );
        done.succeed();
    }

    fn roll(&mut self) {
        let connections = self.connections.len() as u64;
        if let Some(size) = self.tuner.roll(connections) {
            self.retuned(size);
        }
    }

    fn retuned(&mut self, size: usize) {
        tracing::debug!(
            broker = %self.config.id,
            size,
            peak = self.tuner.plateau(),
            "retuned socket buffers"
        );
        for connector in &self.connectors {
            connector.update_buffer_settings(size);
        }
        self.publish();
    }

    fn adopt(&mut self, connection: BrokerConnection) {
        self.connections.insert(connection.id(), connection);
        match self.tuner.observe(self.connections.len() as u64) {
            Some(size) => self.retuned(size),
            None => self.publish(),
        }
    }

    fn release(&mut self, id: u64) {
        if self.connections.remove(&id).is_some() {
            self.publish();
        }
    }

    fn stop_connections(&mut self, ids: Vec<u64>, done: Completion) {
        let tracker = TaskTracker::new(format!("broker {} connections", self.config.id));
        for id in ids {
            if let Some(connection) = self.connections.get(&id) {
                connection.stop(tracker.task(format!("connection {id}")));
            }
        }
        tracker.seal(done);
    }

    fn stop_remaining(&mut self, actor: &Actor<BrokerState>, done: HookDone) {
        let tracker = TaskTracker::new(format!("broker {} stop connections", self.config.id));
        for (id, connection) in &self.connections {
            connection.stop(tracker.task(format!("connection {id}")));
        }
        tracker.watch(actor.context(), WATCH_INTERVAL);
        let handle = actor.clone();
        tracker.seal(Completion::new(move || {
            handle.submit(move |_, state| state.stopped(done));
        }));
    }

    fn stopped(&mut self, done: HookDone) {
        if let Some(registry) = &self.registry {
            registry.unregister(&self.config.id);
        }
        self.connections.clear();
        self.connectors.clear();
        self.publish();
        tracing::info!(broker = %self.config.id, "broker stopped");
        done.succeed();
    }

    fn status(&self, actor: &Actor<BrokerState>) -> BrokerStatus {
        BrokerStatus {
            id: self.config.id.clone(),
            state: actor.service_state(),
            since: actor.state_since(),
            connectors: self
                .connectors
                .iter()
                .map(|connector| connector.id().to_owned())
                .collect(),
            connections: self.connections.len(),
            buffer_size: self.tuner.buffer_size(),
            window_peak: self.tuner.window().peak(),
        }
    }
}

impl ServiceHooks for BrokerState {
    fn start(&mut self, actor: &Actor<Self>, done: HookDone) {
        if let Some(registry) = &self.registry
            && let Err(error) = registry.register(self.handle(actor))
        {
            return done.fail(error.into());
        }
        self.tuner = Self::fresh_tuner(&self.config);
        self.connections.clear();
        let owner: Arc<dyn ConnectionOwner> = Arc::new(BrokerOwner {
            broker: actor.downgrade(),
            shared: Arc::clone(&self.shared),
        });
        self.connectors = self
            .config
            .connectors
            .iter()
            .map(|config| match config {
                ConnectorConfig::Accepting(config) => AcceptingConnector::new(
                    config.clone(),
                    self.services.clone(),
                    Arc::clone(&owner),
                ),
            })
            .collect();
        self.publish();

        let tracker = TaskTracker::new(format!("broker {} start", self.config.id));
        for connector in &self.connectors {
            connector.start(tracker.task(format!("connector {}", connector.id())));
        }
        tracker.watch(actor.context(), WATCH_INTERVAL);
        let handle = actor.clone();
        tracker.seal(Completion::new(move || {
            handle.submit(move |actor, state| state.started(actor, done));
        }));
    }

    fn stop(&mut self, actor: &Actor<Self>, done: HookDone) {
        let tracker = TaskTracker::new(format!("broker {} stop connectors", self.config.id));
        for connector in &self.connectors {
            connector.stop(tracker.task(format!("connector {}", connector.id())));
        }
        tracker.watch(actor.context(), WATCH_INTERVAL);
        let handle = actor.clone();
        tracker.seal(Completion::new(move || {
            handle.submit(move |actor, state| state.stop_remaining(actor, done));
        }));
    }
}

/// 连接器眼中的 Broker：全部操作都投递到 Broker 的上下文。
struct BrokerOwner {
    broker: WeakActor<BrokerState>,
    shared: Arc<BrokerShared>,
}

impl ConnectionOwner for BrokerOwner {
    fn next_connection_id(&self) -> u64 {
        self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn adopt(&self, connection: BrokerConnection) {
        match self.broker.upgrade() {
            Some(broker) => broker.submit(move |_, state| state.adopt(connection)),
            None => connection.stop(Completion::noop()),
        }
    }

    fn release(&self, connection_id: u64) {
        if let Some(broker) = self.broker.upgrade() {
            broker.submit(move |_, state| state.release(connection_id));
        }
    }

    fn stop_connections(&self, ids: Vec<u64>, done: Completion) {
        match self.broker.upgrade() {
            Some(broker) => broker.submit(move |_, state| state.stop_connections(ids, done)),
            None => done.run(),
        }
    }

    fn tuned_buffer_size(&self) -> Option<usize> {
        Some(self.shared.snapshot.load().buffer_size)
    }
}

/// Broker 句柄，可廉价克隆。
#[derive(Clone)]
pub struct Broker {
    actor: Actor<BrokerState>,
    shared: Arc<BrokerShared>,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
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

    pub fn ptr_eq(&self, other: &Broker) -> bool {
        self.actor.ptr_eq(&other.actor)
    }

    /// 最近发布的快照。
    pub fn snapshot(&self) -> Arc<BrokerSnapshot> {
        self.shared.snapshot.load_full()
    }

    pub fn connector(&self, id: &str) -> Option<AcceptingConnector> {
        self.shared.snapshot.load().connector(id).cloned()
    }

    /// 在 Broker 上下文中查找连接并回调 `reply`。
    pub fn connection(&self, id: u64, reply: impl FnOnce(Option<BrokerConnection>) + Send + 'static) {
        self.actor
            .submit(move |_, state| reply(state.connections.get(&id).cloned()));
    }

    /// 以新配置重启指定连接器。
    ///
    /// Broker 未处于 STARTED 或连接器不存在时立即返回错误，`done` 不会运行。
    pub fn update_connector(
        &self,
        config: AcceptingConnectorConfig,
        done: Completion,
    ) -> Result<(), BrokerError> {
        if !self.service_state().is_started() {
            return Err(BrokerError::BrokerNotStarted(self.shared.id.clone()));
        }
        let connector = self
            .connector(&config.id)
            .ok_or_else(|| BrokerError::UnknownConnector(config.id.clone()))?;
        connector.update(config, done);
        Ok(())
    }

    pub fn status(&self, reply: impl FnOnce(BrokerStatus) + Send + 'static) {
        self.actor
            .submit(move |actor, state| reply(state.status(actor)));
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.shared.id)
            .field("state", &self.actor.service_state())
            .finish()
    }
}

/// 组装 [`Broker`]：协议、监听工厂、执行器与注册表都由宿主注入。
pub struct BrokerBuilder {
    config: BrokerConfig,
    protocols: Vec<Arc<dyn Protocol>>,
    factories: Vec<Arc<dyn ServerFactory>>,
    executor: Option<Arc<dyn Executor>>,
    blocking: Option<BlockingPool>,
    registry: Option<BrokerRegistry>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            protocols: Vec::new(),
            factories: Vec::new(),
            executor: None,
            blocking: None,
            registry: None,
        }
    }

    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn server_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Broker、连接器与连接共用的执行器；缺省使用当前 Tokio 运行时。
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 主机名解析使用的阻塞池；缺省在当前 Tokio 运行时上按 `blocking_threads` 创建。
    pub fn blocking_pool(mut self, pool: BlockingPool) -> Self {
        self.blocking = Some(pool);
        self
    }

    pub fn registry(mut self, registry: BrokerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Broker, BrokerError> {
        self.config.validate()?;
        let mut protocols = ProtocolRegistry::new();
        for protocol in self.protocols {
            protocols.register(protocol)?;
        }
        let runtime = TokioExecutor::current().ok();
        let executor: Arc<dyn Executor> = match (self.executor, &runtime) {
            (Some(executor), _) => executor,
            (None, Some(runtime)) => Arc::new(runtime.clone()),
            (None, None) => {
                return Err(BrokerError::InvalidConfig(
                    "no executor configured and no Tokio runtime is running".into(),
                ));
            }
        };
        let blocking = self.blocking.or_else(|| {
            runtime.map(|runtime| {
                BlockingPool::new(runtime.handle().clone(), self.config.blocking_threads)
            })
        });

        let mut services = ConnectorServices::new(Arc::new(protocols), Arc::clone(&executor));
        services.factories = self.factories;
        services.blocking = blocking;

        let shared = Arc::new(BrokerShared {
            id: self.config.id.clone(),
            next_connection_id: AtomicU64::new(0),
            snapshot: ArcSwap::from_pointee(BrokerSnapshot {
                buffer_size: BrokerState::fresh_tuner(&self.config).buffer_size(),
                ..BrokerSnapshot::default()
            }),
        });
        let ctx = ExecutionContext::new(format!("broker {}", self.config.id), executor);
        let actor = Actor::new(
            ctx,
            BrokerState {
                tuner: BrokerState::fresh_tuner(&self.config),
                config: self.config,
                services,
                registry: self.registry,
                shared: Arc::clone(&shared),
                connectors: Vec::new(),
                connections: BTreeMap::new(),
            },
        );
        Ok(Broker { actor, shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::testing::LineProtocol, tuner::MAX_BUFFER_SIZE};
    use parking_lot::Mutex;
    use spark_core::dispatch::ManualExecutor;
    use spark_transport::{TransportServer, mock::MockServerFactory};

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        executor: Arc<ManualExecutor>,
        factory: MockServerFactory,
        registry: BrokerRegistry,
        broker: Broker,
    }

    fn fixture(config: BrokerConfig) -> Fixture {
        let executor = Arc::new(ManualExecutor::new());
        let factory = MockServerFactory::new();
        let registry = BrokerRegistry::new();
        let broker = Broker::builder(config)
            .protocol(LineProtocol::new("lines", None))
            .protocol(LineProtocol::new("stomp", Some(b"CONNECT")))
            .server_factory(Arc::new(factory.clone()))
            .executor(executor.clone())
            .registry(registry.clone())
            .build()
            .expect("build");
        Fixture {
            executor,
            factory,
            registry,
            broker,
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig::new("default")
            .with_connector(ConnectorConfig::Accepting(
                AcceptingConnectorConfig::new("lines", "mock://127.0.0.1:0").with_protocol("lines"),
            ))
            .with_connector(ConnectorConfig::Accepting(AcceptingConnectorConfig::new(
                "auto",
                "mock://127.0.0.1:0",
            )))
    }

    fn status(fixture: &Fixture) -> BrokerStatus {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        fixture.broker.status(move |status| *sink.lock() = Some(status));
        fixture.executor.run_until_idle();
        let status = slot.lock().take();
        status.expect("status reply")
    }

    #[test]
    fn start_publishes_snapshot_and_registers() {
        let fixture = fixture(config());
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.service_state(), ServiceState::Started);
        assert_eq!(fixture.broker.snapshot().connector_ids(), ["lines", "auto"]);
        assert_eq!(fixture.factory.servers().len(), 2);
        assert!(
            fixture
                .registry
                .get("default")
                .is_some_and(|broker| broker.ptr_eq(&fixture.broker))
        );

        fixture.broker.stop(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.service_state(), ServiceState::Stopped);
        assert!(fixture.registry.is_empty());
        assert!(fixture.factory.servers().iter().all(|server| !server.is_started()));
        assert!(fixture.broker.snapshot().connectors.is_empty());
    }

    #[test]
    fn connection_ids_increase_and_connections_are_tracked() {
        let fixture = fixture(config());
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        let server = fixture.factory.servers()[0].clone();
        let peers = [server.connect(), server.connect()];
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.snapshot().connections, 2);

        let found = Arc::new(Mutex::new(Vec::new()));
        for id in [1, 2, 3] {
            let sink = Arc::clone(&found);
            fixture
                .broker
                .connection(id, move |connection| sink.lock().push(connection.map(|c| c.id())));
        }
        fixture.executor.run_until_idle();
        assert_eq!(*found.lock(), [Some(1), Some(2), None]);

        fixture.broker.stop(Completion::noop());
        fixture.executor.run_until_idle();
        assert!(peers.iter().all(|peer| peer.is_stopped()));
        assert_eq!(fixture.broker.snapshot().connections, 0);
    }

    #[test]
    fn rising_peak_retunes_every_auto_tuned_connector() {
        let mut config = config();
        // 16 MiB / 8 / 2 = 1 MiB；300 条连接时每条约 3.4 KiB，向下对齐到 3 KiB。
        config.heap_budget_bytes = 16 * MIB;
        let fixture = fixture(config);
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.snapshot().buffer_size, MAX_BUFFER_SIZE);

        let server = fixture.factory.servers()[0].clone();
        let _peers: Vec<_> = (0..300).map(|_| server.connect()).collect();
        fixture.executor.run_until_idle();
        let size = fixture.broker.snapshot().buffer_size;
        assert_eq!(size, 3 * 1024);
        for server in fixture.factory.servers() {
            assert_eq!(server.buffer_sizes().receive, Some(size));
            assert_eq!(server.buffer_sizes().send, Some(size));
        }
        assert_eq!(status(&fixture).connections, 300);
    }

    #[test]
    fn window_decay_restores_larger_buffers() {
        let mut config = config();
        config.heap_budget_bytes = 16 * MIB;
        config.window_samples = 2;
        let fixture = fixture(config);
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();

        let server = fixture.factory.servers()[0].clone();
        let peers: Vec<_> = (0..300).map(|_| server.connect()).collect();
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.snapshot().buffer_size, 3 * 1024);

        fixture.broker.stop(Completion::noop());
        fixture.executor.run_until_idle();
        assert!(peers.iter().all(|peer| peer.is_stopped()));
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        // 重启后调优器从空窗口重新开始。
        assert_eq!(fixture.broker.snapshot().buffer_size, MAX_BUFFER_SIZE);

        let server = fixture.factory.last().expect("rebound server");
        let _peer = server.connect();
        fixture.executor.run_until_idle();
        fixture.executor.advance(Duration::from_millis(300));
        let status = status(&fixture);
        assert_eq!(status.window_peak, 1);
        assert_eq!(status.buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn update_connector_requires_started_broker_and_known_id() {
        let fixture = fixture(config());
        let update = AcceptingConnectorConfig::new("lines", "mock://127.0.0.1:0");
        assert_eq!(
            fixture
                .broker
                .update_connector(update.clone(), Completion::noop()),
            Err(BrokerError::BrokerNotStarted("default".into()))
        );

        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(
            fixture.broker.update_connector(
                AcceptingConnectorConfig::new("missing", "mock://127.0.0.1:0"),
                Completion::noop()
            ),
            Err(BrokerError::UnknownConnector("missing".into()))
        );
        fixture
            .broker
            .update_connector(update.with_protocol("stomp"), Completion::noop())
            .expect("known connector");
        fixture.executor.run_until_idle();
        assert_eq!(fixture.factory.servers().len(), 3);
    }

    #[test]
    fn failing_connector_does_not_fail_the_broker() {
        let config = config().with_connector(ConnectorConfig::Accepting(
            AcceptingConnectorConfig::new("nowhere", "udp://127.0.0.1:0"),
        ));
        let fixture = fixture(config);
        fixture.broker.start(Completion::noop());
        fixture.executor.run_until_idle();
        assert_eq!(fixture.broker.service_state(), ServiceState::Started);
        let connector = fixture.broker.connector("nowhere").expect("connector");
        assert_eq!(connector.service_state(), ServiceState::Failed);
    }

    #[test]
    fn duplicate_registration_fails_start() {
        let first = fixture(config());
        first.broker.start(Completion::noop());
        first.executor.run_until_idle();

        let second = Broker::builder(config())
            .executor(first.executor.clone())
            .registry(first.registry.clone())
            .build()
            .expect("build");
        second.start(Completion::noop());
        first.executor.run_until_idle();
        assert_eq!(second.service_state(), ServiceState::Failed);
        assert_eq!(
            second.failure().map(|error| error.code()),
            Some(crate::error::codes::DUPLICATE_BROKER)
        );
        assert_eq!(first.registry.ids(), ["default"]);
    }

    #[test]
    fn build_rejects_invalid_input() {
        let executor: Arc<dyn Executor> = Arc::new(ManualExecutor::new());
        let duplicate = Broker::builder(BrokerConfig::new("b"))
            .executor(Arc::clone(&executor))
            .protocol(LineProtocol::new("lines", None))
            .protocol(LineProtocol::new("lines", None))
            .build();
        assert_eq!(
            duplicate.map(|_| ()),
            Err(BrokerError::DuplicateProtocol("lines".into()))
        );
        let invalid = Broker::builder(BrokerConfig::new(""))
            .executor(executor)
            .build();
        assert!(matches!(invalid, Err(BrokerError::InvalidConfig(_))));
        let no_runtime = Broker::builder(BrokerConfig::new("b")).build();
        assert!(matches!(no_runtime, Err(BrokerError::InvalidConfig(_))));
    }
}
