use crate::{Frame, ProtocolCodec, TransportSocketAddr};
use spark_core::{Completion, CoreError, ExecutionContext};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// 传输层事件的接收方，通常由连接 Actor 实现。
///
/// 所有回调都在传输层当前的 [`ExecutionContext`] 上执行，且按事件发生顺序到达。
pub trait TransportListener: Send + Sync + 'static {
    /// 解码得到一个入站帧。
    fn on_frame(&self, frame: Frame);

    /// 编解码器识别出对端协议并已切换；此时读取处于暂停状态。
    fn on_protocol_detected(&self, protocol: &str);

    /// 写缓冲区回落到低水位，之前被拒绝的生产者可以重试。
    fn on_refill(&self);

    /// 不可恢复的 I/O 或解码失败；对端关闭（EOF）也以失败报告。每个传输至多报告一次。
    fn on_failure(&self, error: CoreError);
}

/// 一条字节流连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接 Actor 只关心“帧进、帧出、能否继续写、何时可以重试”，不关心介质细节；
///
/// ## 逻辑（How）
/// - 读取默认处于暂停状态：连接完成协议处理器的挂接后显式 `resume_read`；
/// - 编解码器切换（[`crate::Decoded::Switch`]）时传输层自动暂停读取并上报
///   `on_protocol_detected`，新的处理器就绪后再恢复；
/// - `offer` 把帧编码进写缓冲区；超过高水位后 `full` 返回 `true`，
///   回落到低水位时触发 `on_refill`。
///
/// ## 契约（What）
/// - `set_execution_context` 必须在 `start` 之前调用，之后也可以再次调用以重定向回调；
/// - `start` 完成后 `done` 在执行上下文上运行；`stop` 关闭套接字后同样如此；
/// - `offer` 在缓冲区已满或传输已停止时返回 `Err(frame)`，把帧交还调用方。
pub trait Transport: Send + Sync + 'static {
    fn set_execution_context(&self, ctx: ExecutionContext);

    /// 安装活动编解码器。
    fn set_codec(&self, codec: Box<dyn ProtocolCodec>);

    /// 当前活动编解码器的协议标识。
    fn codec_protocol(&self) -> Option<String>;

    fn start(&self, listener: Arc<dyn TransportListener>, done: Completion);

    fn stop(&self, done: Completion);

    fn offer(&self, frame: Frame) -> Result<(), Frame>;

    fn full(&self) -> bool;

    fn suspend_read(&self);

    fn resume_read(&self);

    fn local_addr(&self) -> Option<TransportSocketAddr>;

    fn remote_addr(&self) -> Option<TransportSocketAddr>;

    fn stats(&self) -> TransportStats;
}

/// 传输层计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub frames_written: u64,
    pub last_read_size: u64,
    pub last_write_size: u64,
}

impl TransportStats {
    /// 累加另一份快照的计数；`last_*` 取 `other` 的值。
    pub fn merge(&mut self, other: &TransportStats) {
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.frames_read += other.frames_read;
        self.frames_written += other.frames_written;
        self.last_read_size = other.last_read_size;
        self.last_write_size = other.last_write_size;
    }
}

/// 线程安全的计数器，读写任务各自更新、状态查询随时读取。
#[derive(Debug, Default)]
pub struct StatsRecorder {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    last_read_size: AtomicU64,
    last_write_size: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.last_read_size.store(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.last_write_size.store(bytes, Ordering::Relaxed);
    }

    pub fn record_frame_read(&self) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            last_read_size: self.last_read_size.load(Ordering::Relaxed),
            last_write_size: self.last_write_size.load(Ordering::Relaxed),
        }
    }
}
