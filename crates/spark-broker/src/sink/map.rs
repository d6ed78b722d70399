use super::{Refiller, Rejected, Sink};

/// 变换载荷后转交下游；不改变 `full` 与 refill 语义。
///
/// 变换只在下游声明不满时进行，因此被拒的值可以原样交还。下游在声明不满后仍拒绝时，
/// 变换后的值已无法还原，只能记录告警后丢弃。
pub struct MapSink<D, F> {
    downstream: D,
    f: F,
    refiller: Option<Refiller>,
}

impl<D, F> MapSink<D, F> {
    pub fn new(downstream: D, f: F) -> Self {
        Self {
            downstream,
            f,
            refiller: None,
        }
    }

    pub fn get_ref(&self) -> &D {
        &self.downstream
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.downstream
    }
}

impl<T, U, D, F> Sink<T> for MapSink<D, F>
where
    D: Sink<U>,
    F: FnMut(T) -> U + Send,
{
    fn offer(&mut self, value: T) -> Result<(), Rejected<T>> {
        if self.downstream.full() {
            return Err(Rejected(value));
        }
        if self.downstream.offer((self.f)(value)).is_err() {
            tracing::warn!("downstream rejected a mapped value after reporting capacity");
        }
        Ok(())
    }

    fn full(&self) -> bool {
        self.downstream.full()
    }

    fn on_refill(&mut self) {
        self.downstream.on_refill();
        notify(&mut self.refiller, self.downstream.full());
    }

    fn set_refiller(&mut self, refiller: Refiller) {
        self.refiller = Some(refiller);
    }
}

/// 变换载荷，`None` 表示丢弃该值（视为已接收）。
pub struct FlatMapSink<D, F> {
    downstream: D,
    f: F,
    refiller: Option<Refiller>,
}

impl<D, F> FlatMapSink<D, F> {
    pub fn new(downstream: D, f: F) -> Self {
        Self {
            downstream,
            f,
            refiller: None,
        }
    }

    pub fn get_ref(&self) -> &D {
        &self.downstream
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.downstream
    }
}

impl<T, U, D, F> Sink<T> for FlatMapSink<D, F>
where
    D: Sink<U>,
    F: FnMut(T) -> Option<U> + Send,
{
    fn offer(&mut self, value: T) -> Result<(), Rejected<T>> {
        if self.downstream.full() {
            return Err(Rejected(value));
        }
        if let Some(mapped) = (self.f)(value)
            && self.downstream.offer(mapped).is_err()
        {
            tracing::warn!("downstream rejected a mapped value after reporting capacity");
        }
        Ok(())
    }

    fn full(&self) -> bool {
        self.downstream.full()
    }

    fn on_refill(&mut self) {
        self.downstream.on_refill();
        notify(&mut self.refiller, self.downstream.full());
    }

    fn set_refiller(&mut self, refiller: Refiller) {
        self.refiller = Some(refiller);
    }
}

fn notify(refiller: &mut Option<Refiller>, full: bool) {
    if !full && let Some(refiller) = refiller.as_mut() {
        refiller();
    }
}

#[cfg(test)]
mod tests {
    use crate::sink::{Sink, SinkExt, testing::VecSink};

    #[test]
    fn map_transforms_and_hands_back_when_full() {
        let downstream = VecSink::with_capacity(1);
        let mut sink = downstream.clone().with_map(|n: u32| n * 10);
        sink.offer(1).expect("accepted");
        assert!(sink.full());
        assert_eq!(sink.offer(2).map_err(|rejected| rejected.into_inner()), Err(2));
        assert_eq!(downstream.delivered(), [10]);
    }

    #[test]
    fn flat_map_drops_none_without_consuming_capacity() {
        let downstream = VecSink::with_capacity(1);
        let mut sink = downstream
            .clone()
            .with_flat_map(|n: u32| (n % 2 == 0).then_some(n));
        sink.offer(1).expect("dropped counts as accepted");
        assert!(!sink.full());
        sink.offer(2).expect("accepted");
        assert_eq!(downstream.delivered(), [2]);
    }

    #[test]
    fn overflow_over_map_preserves_order_across_refill() {
        let downstream = VecSink::with_capacity(0);
        let mut sink = downstream
            .clone()
            .with_map(|s: &'static str| s.to_uppercase())
            .with_overflow();
        for item in ["x", "y", "z"] {
            sink.offer(item).expect("overflow accepts");
        }
        downstream.grant(2);
        sink.on_refill();
        assert_eq!(downstream.delivered(), ["X", "Y"]);
        assert_eq!(sink.overflow_len(), 1);
    }
}
