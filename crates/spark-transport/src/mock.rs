//! 内存版传输与监听服务。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接器的接入控制、协议识别与背压链路都需要在确定性调度下验证，不能依赖真实套接字；
//!
//! ## 逻辑（How）
//! - [`MockTransport`] 以 `receive` 注入入站字节，经由真实的 [`drain_decoded`] 循环解码；
//!   `set_full` 模拟写缓冲区满/回落；
//! - [`MockServer`] 维护一个“内核 backlog”，遵循与 TCP 实现相同的规则：暂停时不取连接，
//!   上一条连接的 [`AcceptAck`] 未释放时也不取；
//! - 全部回调都投递到调用方设置的 [`ExecutionContext`]，配合 `ManualExecutor` 即可逐步推进。

use crate::{
    AcceptAck, AcceptListener, BindUri, BufferSizes, Frame, ProtocolCodec, ReadEvent,
    ServerFactory, StartCallback, StatsRecorder, Transport, TransportListener, TransportServer,
    TransportSocketAddr, TransportStats, drain_decoded,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use spark_core::{Completion, CoreError, ExecutionContext};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
};

/// 内存版监听服务的 scheme。
pub const MOCK_SCHEME: &str = "mock";

const BIND_FAILED: &str = "spark.transport.mock.bind_failed";

enum Event {
    Read(ReadEvent),
    Refill,
    Failure(CoreError),
}

#[derive(Default)]
struct MockTransportState {
    ctx: Option<ExecutionContext>,
    codec: Option<Box<dyn ProtocolCodec>>,
    listener: Option<Arc<dyn TransportListener>>,
    inbound: BytesMut,
    reading: bool,
    started: bool,
    stopped: bool,
    failed: bool,
    full: bool,
    written: Vec<Frame>,
}

struct MockTransportInner {
    state: Mutex<MockTransportState>,
    stats: StatsRecorder,
    local: TransportSocketAddr,
    remote: TransportSocketAddr,
}

/// 内存版传输。
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            inner: Arc::new(MockTransportInner {
                state: Mutex::new(MockTransportState::default()),
                stats: StatsRecorder::new(),
                local: local.into(),
                remote: remote.into(),
            }),
        }
    }

    /// 注入对端发来的字节；读取开启时立即解码。
    pub fn receive(&self, bytes: &[u8]) {
        self.inner.state.lock().inbound.extend_from_slice(bytes);
        self.inner.stats.record_read(bytes.len());
        self.pump_reads();
    }

    /// 模拟写缓冲区满；从满变为不满时触发 `on_refill`。
    pub fn set_full(&self, full: bool) {
        let refill = {
            let mut state = self.inner.state.lock();
            let refill = state.full && !full;
            state.full = full;
            refill
        };
        if refill {
            self.dispatch(vec![Event::Refill]);
        }
    }

    /// 模拟 I/O 失败。
    pub fn fail(&self, error: CoreError) {
        let report = {
            let mut state = self.inner.state.lock();
            let report = !state.failed && !state.stopped;
            state.failed = true;
            report
        };
        if report {
            self.dispatch(vec![Event::Failure(error)]);
        }
    }

    /// 取走已写出的帧。
    pub fn take_written(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.state.lock().written)
    }

    pub fn is_reading(&self) -> bool {
        self.inner.state.lock().reading
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// 尚未被解码消费的入站字节数。
    pub fn unread_len(&self) -> usize {
        self.inner.state.lock().inbound.len()
    }

    fn pump_reads(&self) {
        let events = {
            let mut state = self.inner.state.lock();
            if !state.reading || state.stopped || state.failed {
                return;
            }
            let Some(mut codec) = state.codec.take() else {
                return;
            };
            let mut decoded = Vec::new();
            let outcome = drain_decoded(&mut codec, &mut state.inbound, &mut decoded);
            state.codec = Some(codec);
            let mut events: Vec<Event> = decoded
                .into_iter()
                .inspect(|event| {
                    if matches!(event, ReadEvent::Frame(_)) {
                        self.inner.stats.record_frame_read();
                    }
                })
                .map(Event::Read)
                .collect();
            match outcome {
                Ok(true) => state.reading = false,
                Ok(false) => {}
                Err(error) => {
                    state.failed = true;
                    state.reading = false;
                    events.push(Event::Failure(error));
                }
            }
            events
        };
        self.dispatch(events);
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let (ctx, listener) = {
            let state = self.inner.state.lock();
            (state.ctx.clone(), state.listener.clone())
        };
        let (Some(ctx), Some(listener)) = (ctx, listener) else {
            return;
        };
        ctx.submit(move || {
            for event in events {
                match event {
                    Event::Read(ReadEvent::Frame(frame)) => listener.on_frame(frame),
                    Event::Read(ReadEvent::ProtocolDetected(protocol)) => {
                        listener.on_protocol_detected(&protocol)
                    }
                    Event::Refill => listener.on_refill(),
                    Event::Failure(error) => listener.on_failure(error),
                }
            }
        });
    }

    fn complete(&self, done: Completion) {
        let ctx = self.inner.state.lock().ctx.clone();
        match ctx {
            Some(ctx) => ctx.submit(move || done.run()),
            None => done.run(),
        }
    }
}

impl Transport for MockTransport {
    fn set_execution_context(&self, ctx: ExecutionContext) {
        self.inner.state.lock().ctx = Some(ctx);
    }

    fn set_codec(&self, codec: Box<dyn ProtocolCodec>) {
        self.inner.state.lock().codec = Some(codec);
    }

    fn codec_protocol(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .codec
            .as_ref()
            .map(|codec| codec.protocol().to_owned())
    }

    fn start(&self, listener: Arc<dyn TransportListener>, done: Completion) {
        {
            let mut state = self.inner.state.lock();
            state.listener = Some(listener);
            state.started = true;
        }
        self.complete(done);
    }

    fn stop(&self, done: Completion) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.reading = false;
        }
        self.complete(done);
    }

    fn offer(&self, frame: Frame) -> Result<(), Frame> {
        let mut state = self.inner.state.lock();
        if state.full || state.stopped {
            return Err(frame);
        }
        state.written.push(frame);
        self.inner.stats.record_frame_written();
        Ok(())
    }

    fn full(&self) -> bool {
        self.inner.state.lock().full
    }

    fn suspend_read(&self) {
        self.inner.state.lock().reading = false;
    }

    fn resume_read(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.reading = true;
        }
        self.pump_reads();
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.inner.local)
    }

    fn remote_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.inner.remote)
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}

#[derive(Default)]
struct MockServerState {
    ctx: Option<ExecutionContext>,
    acceptor: Option<Arc<dyn AcceptListener>>,
    started: bool,
    suspended: bool,
    awaiting_ack: bool,
    backlog: VecDeque<MockTransport>,
    accepted: usize,
    sizes: BufferSizes,
    next_peer_port: u16,
}

struct MockServerInner {
    state: Mutex<MockServerState>,
    addr: SocketAddr,
}

/// 内存版监听服务。
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<MockServerInner>,
}

impl MockServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(MockServerInner {
                state: Mutex::new(MockServerState {
                    next_peer_port: 50_000,
                    ..MockServerState::default()
                }),
                addr,
            }),
        }
    }

    /// 模拟一个对端连入：连接先进入 backlog，满足条件时才被接入。
    pub fn connect(&self) -> MockTransport {
        let transport = {
            let mut state = self.inner.state.lock();
            let port = state.next_peer_port;
            state.next_peer_port = state.next_peer_port.wrapping_add(1);
            let remote = SocketAddr::from(([127, 0, 0, 1], port));
            let transport = MockTransport::new(self.inner.addr, remote);
            state.backlog.push_back(transport.clone());
            transport
        };
        self.pump();
        transport
    }

    /// 已被接入的连接数。
    pub fn accepted(&self) -> usize {
        self.inner.state.lock().accepted
    }

    /// 仍留在 backlog 中的连接数。
    pub fn backlog_len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }

    /// 模拟单次接入失败。
    pub fn fail_accept(&self, error: CoreError) {
        let (ctx, acceptor) = {
            let state = self.inner.state.lock();
            (state.ctx.clone(), state.acceptor.clone())
        };
        if let (Some(ctx), Some(acceptor)) = (ctx, acceptor) {
            ctx.submit(move || acceptor.on_accept_failure(error));
        }
    }

    fn pump(&self) {
        let (ctx, acceptor, transport) = {
            let mut state = self.inner.state.lock();
            if !state.started || state.suspended || state.awaiting_ack {
                return;
            }
            let (Some(ctx), Some(acceptor)) = (state.ctx.clone(), state.acceptor.clone()) else {
                return;
            };
            let Some(transport) = state.backlog.pop_front() else {
                return;
            };
            state.awaiting_ack = true;
            state.accepted += 1;
            (ctx, acceptor, transport)
        };
        let server = self.clone();
        ctx.submit(move || {
            let ack = AcceptAck::new(move || {
                server.inner.state.lock().awaiting_ack = false;
                server.pump();
            });
            acceptor.on_accept(Arc::new(transport), ack);
        });
    }
}

impl TransportServer for MockServer {
    fn set_execution_context(&self, ctx: ExecutionContext) {
        self.inner.state.lock().ctx = Some(ctx);
    }

    fn start(&self, acceptor: Arc<dyn AcceptListener>, done: StartCallback) {
        let ctx = {
            let mut state = self.inner.state.lock();
            state.acceptor = Some(acceptor);
            state.started = true;
            state.ctx.clone()
        };
        match ctx {
            Some(ctx) => ctx.submit(move || done(Ok(()))),
            None => done(Ok(())),
        }
        self.pump();
    }

    fn stop(&self, done: Completion) {
        let ctx = {
            let mut state = self.inner.state.lock();
            state.started = false;
            state.acceptor = None;
            state.ctx.clone()
        };
        match ctx {
            Some(ctx) => ctx.submit(move || done.run()),
            None => done.run(),
        }
    }

    fn suspend(&self) {
        self.inner.state.lock().suspended = true;
    }

    fn resume(&self) {
        self.inner.state.lock().suspended = false;
        self.pump();
    }

    fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        Some(self.inner.addr.into())
    }

    fn set_receive_buffer_size(&self, bytes: usize) {
        self.inner.state.lock().sizes.receive = Some(bytes);
    }

    fn set_send_buffer_size(&self, bytes: usize) {
        self.inner.state.lock().sizes.send = Some(bytes);
    }

    fn buffer_sizes(&self) -> BufferSizes {
        self.inner.state.lock().sizes
    }
}

/// 为 `mock://` 地址创建 [`MockServer`]，并记录创建过的全部服务供测试检查。
#[derive(Clone, Default)]
pub struct MockServerFactory {
    servers: Arc<Mutex<Vec<MockServer>>>,
    fail_binds: Arc<Mutex<bool>>,
    next_port: Arc<AtomicU16>,
}

impl MockServerFactory {
    pub fn new() -> Self {
        Self {
            next_port: Arc::new(AtomicU16::new(40_000)),
            ..Self::default()
        }
    }

    /// 之后的 `bind` 是否返回失败。
    pub fn fail_binds(&self, fail: bool) {
        *self.fail_binds.lock() = fail;
    }

    pub fn servers(&self) -> Vec<MockServer> {
        self.servers.lock().clone()
    }

    /// 最近一次创建的服务。
    pub fn last(&self) -> Option<MockServer> {
        self.servers.lock().last().cloned()
    }
}

impl ServerFactory for MockServerFactory {
    fn supports(&self, scheme: &str) -> bool {
        scheme == MOCK_SCHEME
    }

    fn bind(
        &self,
        uri: &BindUri,
        addr: SocketAddr,
    ) -> spark_core::Result<Arc<dyn TransportServer>> {
        if *self.fail_binds.lock() {
            return Err(CoreError::new(BIND_FAILED, format!("cannot bind {uri}")));
        }
        let mut addr = addr;
        if addr.port() == 0 {
            addr.set_port(self.next_port.fetch_add(1, Ordering::Relaxed));
        }
        let server = MockServer::new(addr);
        self.servers.lock().push(server.clone());
        Ok(Arc::new(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decoded;
    use bytes::Bytes;
    use spark_core::dispatch::ManualExecutor;

    /// 每行一个帧的简单编解码器。
    struct Lines;

    impl ProtocolCodec for Lines {
        fn protocol(&self) -> &str {
            "lines"
        }

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, CoreError> {
            match src.iter().position(|b| *b == b'\n') {
                Some(index) => {
                    let line = src.split_to(index + 1);
                    Ok(Some(Decoded::Frame(Frame::new(line.freeze()))))
                }
                None => Ok(None),
            }
        }

        fn encode(&mut self, _frame: Frame, _dst: &mut BytesMut) -> Result<(), CoreError> {
            Ok(())
        }

        fn unread(&mut self, _bytes: Bytes) {}
    }

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<Bytes>>,
        refills: Mutex<usize>,
    }

    impl TransportListener for Collect {
        fn on_frame(&self, frame: Frame) {
            if let Ok(bytes) = frame.downcast::<Bytes>() {
                self.frames.lock().push(bytes);
            }
        }
        fn on_protocol_detected(&self, _protocol: &str) {}
        fn on_refill(&self) {
            *self.refills.lock() += 1;
        }
        fn on_failure(&self, _error: CoreError) {}
    }

    #[test]
    fn bytes_are_held_until_reads_resume() {
        let executor = ManualExecutor::new();
        let ctx = ExecutionContext::new("mock", Arc::new(executor.clone()));
        let transport = MockTransport::new(
            SocketAddr::from(([127, 0, 0, 1], 1)),
            SocketAddr::from(([127, 0, 0, 1], 2)),
        );
        let listener = Arc::new(Collect::default());
        transport.set_execution_context(ctx);
        transport.set_codec(Box::new(Lines));
        transport.start(listener.clone(), Completion::noop());
        transport.receive(b"one\ntw");
        executor.run_until_idle();
        assert!(listener.frames.lock().is_empty());

        transport.resume_read();
        transport.receive(b"o\n");
        executor.run_until_idle();
        assert_eq!(
            *listener.frames.lock(),
            vec![Bytes::from_static(b"one\n"), Bytes::from_static(b"two\n")]
        );
        assert_eq!(transport.stats().frames_read, 2);

        transport.set_full(true);
        assert!(transport.offer(Frame::new(1u8)).is_err());
        transport.set_full(false);
        executor.run_until_idle();
        assert_eq!(*listener.refills.lock(), 1);
    }
}
