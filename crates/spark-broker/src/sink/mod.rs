//! 出站背压链。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接的出站路径需要统一的“能否再写”协商：生产者写入前询问 `full`，被拒后等待 refill 再重试；
//! - 链上节点可以组合：变换载荷（[`MapSink`]/[`FlatMapSink`]）、吸收突发（[`OverflowSink`]），
//!   终点总是传输本身（[`TransportSink`]）。
//!
//! ## 逻辑（How）
//! - refill 由持有链条的一方（连接的协议处理器）在传输上报可写时调用最外层节点的 [`Sink::on_refill`]；
//!   每个节点先把通知传给下游，再处理自身积压，最后在自身不满时通知自己的生产者。
//!   所有权沿链条单向向下，不需要下游反向持有上游。
//!
//! ## 契约（What）
//! - `offer` 返回 `Err(Rejected(value))` 时把值原样交还，调用方稍后重试；
//! - `full() == true` 表示下一次 `offer` 可能被拒；
//! - 链条保持提交顺序：较晚提交的项不会先于仍在任何溢出队列中的较早项送达。

mod map;
mod overflow;
mod transport;

pub use map::{FlatMapSink, MapSink};
pub use overflow::OverflowSink;
pub use transport::TransportSink;

use std::fmt;

/// 生产者注册的可写通知。
pub type Refiller = Box<dyn FnMut() + Send + 'static>;

/// 被拒绝的值，原样交还给调用方。
#[derive(Clone, PartialEq, Eq)]
pub struct Rejected<T>(pub T);

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

/// 背压出站节点。
pub trait Sink<T>: Send {
    /// 提交一个值；被拒时原样交还。
    fn offer(&mut self, value: T) -> Result<(), Rejected<T>>;

    /// 下一次 `offer` 是否可能被拒。
    fn full(&self) -> bool;

    /// 下游变为可写：先向下传递，再排空本节点积压，最后在不满时通知生产者。
    fn on_refill(&mut self);

    /// 注册本节点的生产者通知，替换先前的通知。
    fn set_refiller(&mut self, refiller: Refiller);
}

impl<T, S: Sink<T> + ?Sized> Sink<T> for Box<S> {
    fn offer(&mut self, value: T) -> Result<(), Rejected<T>> {
        (**self).offer(value)
    }

    fn full(&self) -> bool {
        (**self).full()
    }

    fn on_refill(&mut self) {
        (**self).on_refill()
    }

    fn set_refiller(&mut self, refiller: Refiller) {
        (**self).set_refiller(refiller)
    }
}

/// 组合子：以当前节点为下游，构造上游节点。
///
/// ```
/// use spark_broker::sink::{OverflowSink, Rejected, Refiller, Sink, SinkExt};
///
/// #[derive(Default)]
/// struct Collect(Vec<String>);
///
/// impl Sink<String> for Collect {
///     fn offer(&mut self, value: String) -> Result<(), Rejected<String>> {
///         self.0.push(value);
///         Ok(())
///     }
///     fn full(&self) -> bool {
///         false
///     }
///     fn on_refill(&mut self) {}
///     fn set_refiller(&mut self, _refiller: Refiller) {}
/// }
///
/// let mut sink: OverflowSink<u32, _> = Collect::default()
///     .with_map(|n: u32| n.to_string())
///     .with_overflow();
/// sink.offer(7).expect("overflow never rejects");
/// assert_eq!(sink.get_ref().get_ref().0, vec!["7".to_owned()]);
/// ```
pub trait SinkExt<U>: Sink<U> + Sized {
    /// 上游值经 `f` 变换后交给本节点。
    fn with_map<T, F>(self, f: F) -> MapSink<Self, F>
    where
        F: FnMut(T) -> U + Send,
    {
        MapSink::new(self, f)
    }

    /// 上游值经 `f` 变换；`f` 返回 `None` 的值被丢弃。
    fn with_flat_map<T, F>(self, f: F) -> FlatMapSink<Self, F>
    where
        F: FnMut(T) -> Option<U> + Send,
    {
        FlatMapSink::new(self, f)
    }

    /// 在本节点之前加一层永不拒绝的溢出队列。
    fn with_overflow(self) -> OverflowSink<U, Self>
    where
        U: Send,
    {
        OverflowSink::new(self)
    }
}

impl<U, S: Sink<U> + Sized> SinkExt<U> for S {}
