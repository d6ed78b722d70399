/// 默认高水位：写缓冲区超过该字节数后拒绝新的出站帧。
pub const DEFAULT_HIGH_WATER: usize = 64 * 1024;
/// 默认低水位：饱和后回落到该字节数以下时通知生产者重试。
pub const DEFAULT_LOW_WATER: usize = 16 * 1024;

/// 管理 TCP 写路径的背压统计。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 出站帧先编码进内存缓冲区，再由写任务异步刷入套接字；缓冲区必须有界，
///   否则慢速对端会把内存拖垮；
/// - 高低水位之间的回滞区间避免在阈值附近反复触发“满/可写”通知。
///
/// ## 逻辑 (How)
/// - `on_enqueue` 累加待写字节，超过高水位后进入饱和状态；
/// - `on_flushed` 扣减已写出的字节，饱和状态下回落到低水位以下时退出饱和并返回 `true`，
///   调用方据此触发一次 refill 通知。
///
/// ## 契约 (What)
/// - **前置条件**：调用方在同一把锁内串行调用这些方法；
/// - **后置条件**：每次从饱和回落只返回一次 `true`。
#[derive(Debug)]
pub(crate) struct BackpressureState {
    pending: usize,
    high: usize,
    low: usize,
    saturated: bool,
}

impl BackpressureState {
    /// 创建水位状态；`low` 会被截断到不超过 `high`。
    pub(crate) fn new(high: usize, low: usize) -> Self {
        Self {
            pending: 0,
            high,
            low: low.min(high),
            saturated: false,
        }
    }

    /// 是否应拒绝新的出站帧。
    pub(crate) fn is_full(&self) -> bool {
        self.saturated
    }

    /// 记录新编码的字节。
    pub(crate) fn on_enqueue(&mut self, bytes: usize) {
        self.pending = self.pending.saturating_add(bytes);
        if self.pending >= self.high {
            self.saturated = true;
        }
    }

    /// 记录已写出的字节，返回是否需要通知 refill。
    pub(crate) fn on_flushed(&mut self, bytes: usize) -> bool {
        self.pending = self.pending.saturating_sub(bytes);
        if self.saturated && self.pending <= self.low {
            self.saturated = false;
            return true;
        }
        false
    }
}
