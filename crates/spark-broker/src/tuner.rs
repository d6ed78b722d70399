//! 自适应套接字缓冲区调优。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接数越多，每条连接可分得的缓冲区越小；以“近期峰值连接数”推算每条连接的发送/接收缓冲区，
//!   避免高并发时缓冲区总量吃光堆预算；
//!
//! ## 逻辑（How）
//! - 每个采样周期内记录见到的最大连接数（[`PeriodStat`]），周期结束时压入定长的 [`RollingWindow`]；
//! - 窗口折叠取最大值：调优要防的是“最近出现过的最高并发”，取最小值会低估峰值；
//! - 峰值超过已记录的平台值时立即重算；窗口滚动导致峰值回落时，在滚动时重算一次。
//!
//! ## 契约（What）
//! - [`compute_buffer_size`] 是纯函数：峰值为 0 时返回 64 KiB，否则
//!   `clamp(round_down_1KiB(heap / 8 / 2 / peak), 2 KiB, 64 KiB)`。

use std::{collections::VecDeque, time::Duration};

/// 峰值为 0 时使用的缓冲区大小，同时也是上限。
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;
/// 缓冲区下限。
pub const MIN_BUFFER_SIZE: usize = 2 * 1024;
/// 向下取整的对齐粒度。
pub const BUFFER_ALIGNMENT: usize = 1024;

/// 按堆预算与峰值连接数计算单方向缓冲区大小。
pub fn compute_buffer_size(heap_budget: u64, peak_connections: u64) -> usize {
    if peak_connections == 0 {
        return MAX_BUFFER_SIZE;
    }
    // 八分之一堆留给连接缓冲区，再在发送与接收之间平分。
    let per_connection = heap_budget / 8 / 2 / peak_connections;
    let aligned = per_connection & !(BUFFER_ALIGNMENT as u64 - 1);
    aligned.clamp(MIN_BUFFER_SIZE as u64, MAX_BUFFER_SIZE as u64) as usize
}

/// 单个采样周期内的峰值连接数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeriodStat {
    max_connections: u64,
}

impl PeriodStat {
    pub fn new(connections: u64) -> Self {
        Self {
            max_connections: connections,
        }
    }

    pub fn record(&mut self, connections: u64) {
        self.max_connections = self.max_connections.max(connections);
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections
    }

    /// 把多个周期折叠为一个，取各周期峰值的最大者。
    pub fn fold<'a>(stats: impl IntoIterator<Item = &'a PeriodStat>) -> PeriodStat {
        stats
            .into_iter()
            .fold(PeriodStat::default(), |acc, stat| PeriodStat {
                max_connections: acc.max_connections.max(stat.max_connections),
            })
    }
}

/// 定长循环窗口，保存最近 `capacity` 个采样周期。
#[derive(Clone, Debug)]
pub struct RollingWindow {
    samples: VecDeque<PeriodStat>,
    capacity: usize,
    period: Duration,
}

impl RollingWindow {
    /// `capacity` 至少为 1。
    pub fn new(capacity: usize, period: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            period,
        }
    }

    /// 压入一个周期；窗口已满时淘汰最旧的周期。
    pub fn push(&mut self, stat: PeriodStat) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(stat);
    }

    /// 窗口内的峰值连接数。
    pub fn peak(&self) -> u64 {
        PeriodStat::fold(&self.samples).max_connections()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 窗口覆盖的时长：`capacity × period`。
    pub fn duration(&self) -> Duration {
        self.period
            .saturating_mul(u32::try_from(self.capacity).unwrap_or(u32::MAX))
    }
}

/// 调优器：维护当前周期、滚动窗口与已生效的缓冲区大小。
#[derive(Clone, Debug)]
pub struct BufferTuner {
    heap_budget: u64,
    window: RollingWindow,
    current: PeriodStat,
    plateau: u64,
    size: usize,
}

impl BufferTuner {
    pub fn new(heap_budget: u64, window_samples: usize, period: Duration) -> Self {
        Self {
            heap_budget,
            window: RollingWindow::new(window_samples, period),
            current: PeriodStat::default(),
            plateau: 0,
            size: compute_buffer_size(heap_budget, 0),
        }
    }

    /// 记录一次连接数观测；峰值突破平台值且结果变化时返回新的缓冲区大小。
    pub fn observe(&mut self, connections: u64) -> Option<usize> {
        self.current.record(connections);
        if self.current.max_connections() <= self.plateau {
            return None;
        }
        self.plateau = self.current.max_connections();
        self.retune()
    }

    /// 结束当前周期并开启新周期（新周期以 `connections` 为起点）。
    ///
    /// 窗口峰值与平台值不一致时重新计算，结果变化则返回新大小。
    pub fn roll(&mut self, connections: u64) -> Option<usize> {
        self.window.push(self.current);
        self.current = PeriodStat::new(connections);
        let peak = self.window.peak().max(connections);
        if peak == self.plateau {
            return None;
        }
        self.plateau = peak;
        self.retune()
    }

    fn retune(&mut self) -> Option<usize> {
        let size = compute_buffer_size(self.heap_budget, self.plateau);
        if size == self.size {
            return None;
        }
        self.size = size;
        Some(size)
    }

    /// 当前生效的缓冲区大小。
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// 最近记录的峰值平台。
    pub fn plateau(&self) -> u64 {
        self.plateau
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn zero_peak_uses_default() {
        assert_eq!(compute_buffer_size(0, 0), 65_536);
        assert_eq!(compute_buffer_size(u64::MAX, 0), 65_536);
    }

    #[test]
    fn sizes_are_clamped_and_aligned() {
        // 512 MiB / 16 / 1000 = 33554 → 32768
        assert_eq!(compute_buffer_size(512 * MIB, 1000), 32 * 1024);
        assert_eq!(compute_buffer_size(512 * MIB, 1), 65_536);
        assert_eq!(compute_buffer_size(MIB, 10_000), 2048);
    }

    proptest! {
        #[test]
        fn formula_matches_definition(heap in 0u64..(1u64 << 40), peak in 1u64..100_000) {
            let expected = ((heap / 8 / 2 / peak) / 1024 * 1024).clamp(2048, 65_536) as usize;
            prop_assert_eq!(compute_buffer_size(heap, peak), expected);
        }
    }

    #[test]
    fn window_keeps_the_most_recent_samples() {
        let mut window = RollingWindow::new(3, Duration::from_millis(100));
        for peak in [9, 1, 2, 3] {
            window.push(PeriodStat::new(peak));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.peak(), 3);
        assert_eq!(window.duration(), Duration::from_millis(300));
    }

    #[test]
    fn tuner_retunes_on_rising_peak_and_after_decay() {
        let mut tuner = BufferTuner::new(512 * MIB, 2, Duration::from_millis(100));
        assert_eq!(tuner.buffer_size(), 65_536);
        assert_eq!(tuner.observe(1), None);
        assert_eq!(tuner.observe(1000), Some(32 * 1024));
        assert_eq!(tuner.observe(900), None);
        assert_eq!(tuner.plateau(), 1000);

        assert_eq!(tuner.roll(10), None);
        assert_eq!(tuner.roll(10), None);
        // 峰值 1000 的周期滑出窗口后回落到 10。
        assert_eq!(tuner.roll(10), Some(65_536));
        assert_eq!(tuner.plateau(), 10);
    }
}
