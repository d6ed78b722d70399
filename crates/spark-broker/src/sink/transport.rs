use super::{Refiller, Rejected, Sink};
use spark_transport::{Frame, Transport};
use std::sync::Arc;

/// 链条终点：`offer`/`full` 直接委托给传输的写缓冲区，自身没有积压。
pub struct TransportSink {
    transport: Arc<dyn Transport>,
    refiller: Option<Refiller>,
}

impl TransportSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            refiller: None,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl Sink<Frame> for TransportSink {
    fn offer(&mut self, frame: Frame) -> Result<(), Rejected<Frame>> {
        self.transport.offer(frame).map_err(Rejected)
    }

    fn full(&self) -> bool {
        self.transport.full()
    }

    fn on_refill(&mut self) {
        if !self.transport.full()
            && let Some(refiller) = self.refiller.as_mut()
        {
            refiller();
        }
    }

    fn set_refiller(&mut self, refiller: Refiller) {
        self.refiller = Some(refiller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkExt;
    use bytes::Bytes;
    use spark_transport::mock::MockTransport;

    fn transport() -> MockTransport {
        MockTransport::new(
            "127.0.0.1:61613".parse().expect("addr"),
            "127.0.0.1:50000".parse().expect("addr"),
        )
    }

    #[test]
    fn backlog_reaches_transport_after_refill() {
        let mock = transport();
        let mut sink = TransportSink::new(Arc::new(mock.clone()))
            .with_map(Frame::new::<Bytes>)
            .with_overflow();
        mock.set_full(true);
        sink.offer(Bytes::from_static(b"a")).expect("queued");
        sink.offer(Bytes::from_static(b"b")).expect("queued");
        assert!(mock.take_written().is_empty());

        mock.set_full(false);
        sink.on_refill();
        let written: Vec<Bytes> = mock
            .take_written()
            .into_iter()
            .filter_map(|frame| frame.downcast::<Bytes>().ok())
            .collect();
        assert_eq!(written, [Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(!sink.full());
    }
}
