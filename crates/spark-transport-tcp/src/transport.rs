use crate::{
    TcpOptions,
    backpressure::BackpressureState,
    error::{TcpOperation, closed_error, map_io_error},
};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use spark_core::{Completion, CoreError, ExecutionContext};
use spark_transport::{
    Frame, ProtocolCodec, ReadEvent, StatsRecorder, Transport, TransportListener,
    TransportSocketAddr, TransportStats, drain_decoded,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::{Notify, watch},
    task::JoinHandle,
};

const READ_CHUNK: usize = 8 * 1024;
/// 停止时等待写任务刷出剩余数据的上限。
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Event {
    Read(ReadEvent),
    Refill,
    Failure(CoreError),
}

struct WriteState {
    buffer: BytesMut,
    backpressure: BackpressureState,
}

struct TransportInner {
    handle: Handle,
    local: TransportSocketAddr,
    remote: TransportSocketAddr,
    stream: Mutex<Option<TcpStream>>,
    ctx: RwLock<Option<ExecutionContext>>,
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    codec: Mutex<Option<Box<dyn ProtocolCodec>>>,
    write: Mutex<WriteState>,
    write_ready: Notify,
    read_gate: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    failed: AtomicBool,
    stopped: AtomicBool,
    stats: StatsRecorder,
}

/// 基于 Tokio `TcpStream` 的连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为连接 Actor 提供“读闸门 + 可替换编解码器 + 有界写缓冲”的字节流，
///   Actor 自身从不在 I/O 上等待；
///
/// ## 逻辑 (How)
/// - `start` 把套接字拆成读写两半，分别交给读任务与写任务；
/// - 读任务只在读闸门打开时读取，每批字节经 [`drain_decoded`] 解码；发生协议切换时
///   先关闭闸门、上报事件，闸门重新打开后先解码缓冲区中剩余的字节再继续读；
/// - `offer` 在调用线程上直接编码进写缓冲区并唤醒写任务，写任务刷出后按水位回报 refill；
/// - 所有事件按发生顺序打包投递到当前执行上下文。
///
/// ## 契约 (What)
/// - 读到 EOF 视为失败（[`spark_core::error::codes::TRANSPORT_CLOSED`]），每条连接至多报告一次失败；
/// - `stop` 之后不再报告失败，`done` 在写任务刷完剩余数据并关闭写半部后执行。
///
/// ## 注意事项 (Trade-offs)
/// - 编解码器由读写两侧共享一把锁，解码与编码不会并行；对单连接而言这是可以接受的开销。
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

impl TcpTransport {
    /// 包装一个已建立的连接。
    pub fn from_stream(
        stream: TcpStream,
        handle: Handle,
        options: &TcpOptions,
    ) -> Result<Self, CoreError> {
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(TcpOperation::Accept, err))?;
        let remote = stream
            .peer_addr()
            .map_err(|err| map_io_error(TcpOperation::Accept, err))?;
        stream
            .set_nodelay(options.nodelay)
            .map_err(|err| map_io_error(TcpOperation::SocketOption, err))?;
        let (read_gate, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(TransportInner {
                handle,
                local: local.into(),
                remote: remote.into(),
                stream: Mutex::new(Some(stream)),
                ctx: RwLock::new(None),
                listener: RwLock::new(None),
                codec: Mutex::new(None),
                write: Mutex::new(WriteState {
                    buffer: BytesMut::new(),
                    backpressure: BackpressureState::new(
                        options.write_high_water,
                        options.write_low_water,
                    ),
                }),
                write_ready: Notify::new(),
                read_gate,
                shutdown,
                writer: Mutex::new(None),
                failed: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stats: StatsRecorder::new(),
            }),
        })
    }

    /// 读闸门当前是否打开。
    pub fn is_reading(&self) -> bool {
        *self.inner.read_gate.borrow()
    }
}

impl TransportInner {
    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let ctx = self.ctx.read().clone();
        let listener = self.listener.read().clone();
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

    fn report_failure(&self, error: CoreError) {
        if self.stopped.load(Ordering::Acquire) || self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            remote = %self.remote,
            code = error.code(),
            error = %error,
            "tcp transport failed"
        );
        self.read_gate.send_replace(false);
        self.dispatch(vec![Event::Failure(error)]);
    }

    /// 解码缓冲区中的字节；返回 `Ok(true)` 表示发生了协议切换且读闸门已关闭。
    fn decode(&self, buffer: &mut BytesMut) -> Result<bool, CoreError> {
        let mut decoded = Vec::new();
        let outcome = {
            let mut codec = self.codec.lock();
            let Some(codec) = codec.as_mut() else {
                return Ok(false);
            };
            drain_decoded(codec, buffer, &mut decoded)
        };
        if matches!(outcome, Ok(true)) {
            self.read_gate.send_replace(false);
        }
        let events = decoded
            .into_iter()
            .inspect(|event| {
                if matches!(event, ReadEvent::Frame(_)) {
                    self.stats.record_frame_read();
                }
            })
            .map(Event::Read)
            .collect();
        self.dispatch(events);
        outcome
    }

    fn complete(&self, done: Completion) {
        match self.ctx.read().clone() {
            Some(ctx) => ctx.submit(move || done.run()),
            None => done.run(),
        }
    }
}

/// 等待读闸门打开；连接关闭时返回 `false`。
async fn wait_open(gate: &mut watch::Receiver<bool>, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *shutdown.borrow_and_update() {
            return false;
        }
        if *gate.borrow_and_update() {
            return true;
        }
        tokio::select! {
            changed = gate.changed() => if changed.is_err() { return false; },
            changed = shutdown.changed() => if changed.is_err() { return false; },
        }
    }
}

async fn read_loop(inner: Arc<TransportInner>, mut reader: OwnedReadHalf) {
    let mut gate = inner.read_gate.subscribe();
    let mut shutdown = inner.shutdown.subscribe();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut leftover = false;
    loop {
        if !wait_open(&mut gate, &mut shutdown).await {
            return;
        }
        if leftover {
            match inner.decode(&mut buffer) {
                Ok(switched) => leftover = switched,
                Err(error) => return inner.report_failure(error),
            }
            if leftover {
                continue;
            }
        }
        buffer.reserve(READ_CHUNK);
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = gate.changed() => continue,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => return inner.report_failure(closed_error()),
                Ok(n) => {
                    inner.stats.record_read(n);
                    match inner.decode(&mut buffer) {
                        Ok(switched) => leftover = switched,
                        Err(error) => return inner.report_failure(error),
                    }
                }
                Err(err) => return inner.report_failure(map_io_error(TcpOperation::Read, err)),
            },
        }
    }
}

async fn write_loop(inner: Arc<TransportInner>, mut writer: OwnedWriteHalf) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let chunk = {
            let mut write = inner.write.lock();
            (!write.buffer.is_empty()).then(|| write.buffer.split().freeze())
        };
        match chunk {
            Some(bytes) => {
                if let Err(err) = writer.write_all(&bytes).await {
                    inner.report_failure(map_io_error(TcpOperation::Write, err));
                    return;
                }
                inner.stats.record_write(bytes.len());
                let refill = inner.write.lock().backpressure.on_flushed(bytes.len());
                if refill && !inner.stopped.load(Ordering::Acquire) {
                    inner.dispatch(vec![Event::Refill]);
                }
            }
            None => {
                if *shutdown.borrow_and_update() {
                    let _ = writer.shutdown().await;
                    return;
                }
                tokio::select! {
                    _ = inner.write_ready.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn set_execution_context(&self, ctx: ExecutionContext) {
        *self.inner.ctx.write() = Some(ctx);
    }

    fn set_codec(&self, codec: Box<dyn ProtocolCodec>) {
        *self.inner.codec.lock() = Some(codec);
    }

    fn codec_protocol(&self) -> Option<String> {
        self.inner
            .codec
            .lock()
            .as_ref()
            .map(|codec| codec.protocol().to_owned())
    }

    fn start(&self, listener: Arc<dyn TransportListener>, done: Completion) {
        *self.inner.listener.write() = Some(listener);
        if let Some(stream) = self.inner.stream.lock().take() {
            let (reader, writer) = stream.into_split();
            self.inner
                .handle
                .spawn(read_loop(Arc::clone(&self.inner), reader));
            let writer = self
                .inner
                .handle
                .spawn(write_loop(Arc::clone(&self.inner), writer));
            *self.inner.writer.lock() = Some(writer);
        }
        self.inner.complete(done);
    }

    fn stop(&self, done: Completion) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.read_gate.send_replace(false);
        self.inner.shutdown.send_replace(true);
        // 尚未启动的连接直接丢弃套接字。
        drop(self.inner.stream.lock().take());
        match self.inner.writer.lock().take() {
            Some(mut writer) => {
                let inner = Arc::clone(&self.inner);
                self.inner.handle.spawn(async move {
                    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                        writer.abort();
                    }
                    inner.complete(done);
                });
            }
            None => self.inner.complete(done),
        }
    }

    fn offer(&self, frame: Frame) -> Result<(), Frame> {
        if self.inner.stopped.load(Ordering::Acquire) || self.inner.failed.load(Ordering::Acquire)
        {
            return Err(frame);
        }
        let encoded = {
            let mut write = self.inner.write.lock();
            if write.backpressure.is_full() {
                return Err(frame);
            }
            let mut codec = self.inner.codec.lock();
            let Some(codec) = codec.as_mut() else {
                return Err(frame);
            };
            let before = write.buffer.len();
            let result = codec.encode(frame, &mut write.buffer);
            if result.is_ok() {
                let added = write.buffer.len() - before;
                write.backpressure.on_enqueue(added);
            }
            result
        };
        match encoded {
            Ok(()) => {
                self.inner.stats.record_frame_written();
                self.inner.write_ready.notify_one();
            }
            Err(error) => self.inner.report_failure(error),
        }
        Ok(())
    }

    fn full(&self) -> bool {
        self.inner.write.lock().backpressure.is_full()
    }

    fn suspend_read(&self) {
        self.inner.read_gate.send_if_modified(|open| {
            let changed = *open;
            *open = false;
            changed
        });
    }

    fn resume_read(&self) {
        if self.inner.stopped.load(Ordering::Acquire) || self.inner.failed.load(Ordering::Acquire)
        {
            return;
        }
        self.inner.read_gate.send_if_modified(|open| {
            let changed = !*open;
            *open = true;
            changed
        });
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
