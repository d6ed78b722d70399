use super::{Refiller, Rejected, Sink};
use std::collections::{VecDeque, vec_deque};

/// 永不拒绝的溢出节点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议层（例如会话的投递循环）往往无法在任意时刻“把值退回去”，需要一个总能接收的入口；
///
/// ## 逻辑（How）
/// - `offer`：溢出队列为空且下游不满时直接交给下游；下游拒绝、下游已满或队列非空时追加到队尾；
/// - `on_refill`：先把通知传给下游，再按 FIFO 逐项交给下游，下游一报告满就停止；
///   排空后若自身不满，通知上游生产者。
///
/// ## 契约（What）
/// - `offer` 恒为 `Ok`；丢弃只能由显式策略（`remove_first`/`remove_last`/`clear`）触发；
/// - `full() == 队列非空 || 下游已满`；
/// - 队列中的项按提交顺序送达，之后提交的项不会越过它们。
pub struct OverflowSink<T, D> {
    downstream: D,
    overflow: VecDeque<T>,
    refiller: Option<Refiller>,
}

impl<T, D: Sink<T>> OverflowSink<T, D> {
    pub fn new(downstream: D) -> Self {
        Self {
            downstream,
            overflow: VecDeque::new(),
            refiller: None,
        }
    }

    /// 尽可能把积压交给下游，返回本次送达的项数。
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while !self.downstream.full() {
            let Some(value) = self.overflow.pop_front() else {
                break;
            };
            match self.downstream.offer(value) {
                Ok(()) => delivered += 1,
                Err(Rejected(value)) => {
                    self.overflow.push_front(value);
                    break;
                }
            }
        }
        delivered
    }

    /// 丢弃最早的积压项。
    pub fn remove_first(&mut self) -> Option<T> {
        self.overflow.pop_front()
    }

    /// 丢弃最晚的积压项。
    pub fn remove_last(&mut self) -> Option<T> {
        self.overflow.pop_back()
    }

    /// 清空积压，返回被丢弃的项数。
    pub fn clear(&mut self) -> usize {
        let dropped = self.overflow.len();
        self.overflow.clear();
        dropped
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// 按送达顺序遍历积压项。
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.overflow.iter()
    }

    pub fn get_ref(&self) -> &D {
        &self.downstream
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.downstream
    }
}

impl<T: Send, D: Sink<T>> Sink<T> for OverflowSink<T, D> {
    fn offer(&mut self, value: T) -> Result<(), Rejected<T>> {
        if self.overflow.is_empty() && !self.downstream.full() {
            if let Err(Rejected(value)) = self.downstream.offer(value) {
                self.overflow.push_back(value);
            }
        } else {
            self.overflow.push_back(value);
        }
        Ok(())
    }

    fn full(&self) -> bool {
        !self.overflow.is_empty() || self.downstream.full()
    }

    fn on_refill(&mut self) {
        self.downstream.on_refill();
        let delivered = self.drain();
        if delivered > 0 {
            tracing::trace!(delivered, remaining = self.overflow.len(), "overflow drained");
        }
        if !self.full()
            && let Some(refiller) = self.refiller.as_mut()
        {
            refiller();
        }
    }

    fn set_refiller(&mut self, refiller: Refiller) {
        self.refiller = Some(refiller);
    }
}
