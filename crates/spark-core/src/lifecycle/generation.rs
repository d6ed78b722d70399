use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// 单调递增的代际计数器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Actor 每次进入 STARTING/STOPPING 都推进代际，使上一轮启动时预约的周期任务自动失效，
///   无需显式取消句柄。
///
/// ## 契约（What）
/// - `advance` 返回推进后的值；
/// - `token` 捕获当前值，之后任意一次 `advance` 都会让该令牌失效。
#[derive(Clone, Debug, Default)]
pub struct GenerationCounter {
    value: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进代际。
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 当前代际值。
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// 捕获当前代际的令牌。
    pub fn token(&self) -> GenerationToken {
        GenerationToken {
            counter: Arc::clone(&self.value),
            captured: self.current(),
        }
    }
}

/// 代际令牌：记录预约时刻的代际值。
#[derive(Clone, Debug)]
pub struct GenerationToken {
    counter: Arc<AtomicU64>,
    captured: u64,
}

impl GenerationToken {
    /// 代际自捕获以来是否未变化。
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::Acquire) == self.captured
    }

    /// 捕获时的代际值。
    pub fn generation(&self) -> u64 {
        self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_invalidates_older_tokens_only() {
        let counter = GenerationCounter::new();
        let old = counter.token();
        assert!(old.is_current());
        assert_eq!(counter.advance(), 1);
        let fresh = counter.token();
        assert!(!old.is_current());
        assert!(fresh.is_current());
        assert_eq!(fresh.generation(), 1);
    }
}
