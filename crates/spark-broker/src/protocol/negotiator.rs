//! `any` 协议：根据连接最初的字节自动识别协议。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同一端口同时服务多种协议时，连接器无法事先知道对端讲什么；先由识别编解码器读入最少的字节，
//!   匹配到签名后把自己换成目标协议的编解码器，处理器随之替换；
//!
//! ## 逻辑（How）
//! - [`NegotiatingCodec`]：把可用字节追加到 [`DetectionBuffer`]（至多到最长签名长度），
//!   按注册顺序逐个测试候选；命中后创建目标编解码器并把已缓冲字节 `unread` 给它，返回
//!   [`Decoded::Switch`]；缓冲区已满仍未命中则报 `spark.protocol.unidentified`；
//! - [`NegotiatingHandler`]：连接就绪时打开读闸门并预约识别超时；收到“协议已识别”事件后
//!   用目标协议的处理器替换自己，新处理器的 `on_connected` 再次打开读闸门。
//!
//! ## 契约（What）
//! - 识别缓冲区长度永不超过最长签名；未识别前不会消费超过最长签名长度的字节；
//! - 超时任务在识别已完成或连接不再处于 STARTED 时静默放弃。

use super::{ANY_PROTOCOL, ConnectorInfo, HandlerContext, Protocol, ProtocolHandler};
use bytes::{Bytes, BytesMut};
use spark_core::{Completion, CoreError, ErrorCategory, ServiceState, error::codes};
use spark_transport::{Decoded, Frame, ProtocolCodec, PushbackBuffer};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// 识别阶段累积的首批字节，容量等于候选中最长的签名长度。
#[derive(Debug)]
pub struct DetectionBuffer {
    bytes: BytesMut,
    capacity: usize,
}

impl DetectionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// 从 `src` 头部取走至多 `remaining()` 个字节，返回取走的字节数。
    pub fn fill(&mut self, src: &mut BytesMut) -> usize {
        let take = self.remaining().min(src.len());
        if take > 0 {
            self.bytes.extend_from_slice(&src.split_to(take));
        }
        take
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// 取走全部已缓冲字节。
    pub fn take(&mut self) -> Bytes {
        self.bytes.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.capacity
    }
}

/// 识别阶段使用的编解码器。
pub struct NegotiatingCodec {
    candidates: Arc<[Arc<dyn Protocol>]>,
    connector: ConnectorInfo,
    buffer: DetectionBuffer,
    pushback: PushbackBuffer,
}

impl NegotiatingCodec {
    pub fn new(candidates: Arc<[Arc<dyn Protocol>]>, connector: ConnectorInfo) -> Self {
        let capacity = candidates
            .iter()
            .map(|candidate| candidate.signature_len())
            .max()
            .unwrap_or(0);
        Self {
            candidates,
            connector,
            buffer: DetectionBuffer::new(capacity),
            pushback: PushbackBuffer::new(),
        }
    }

    pub fn buffer(&self) -> &DetectionBuffer {
        &self.buffer
    }

    fn unidentified(&self) -> CoreError {
        let candidates: Vec<&str> = self.candidates.iter().map(|c| c.id()).collect();
        CoreError::new(
            codes::PROTOCOL_UNIDENTIFIED,
            format!(
                "first {} bytes match none of {:?}",
                self.buffer.len(),
                candidates
            ),
        )
        .with_category(ErrorCategory::ProtocolViolation)
    }
}

impl ProtocolCodec for NegotiatingCodec {
    fn protocol(&self) -> &str {
        ANY_PROTOCOL
    }

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, CoreError> {
        self.pushback.restore(src);
        self.buffer.fill(src);
        let matched = self
            .candidates
            .iter()
            .find(|candidate| candidate.matches(self.buffer.as_slice()))
            .cloned();
        if let Some(protocol) = matched {
            let mut codec = protocol.create_codec(&self.connector);
            codec.unread(self.buffer.take());
            return Ok(Some(Decoded::Switch {
                protocol: protocol.id().to_owned(),
                codec,
            }));
        }
        if self.buffer.is_full() {
            return Err(self.unidentified());
        }
        Ok(None)
    }

    fn encode(&mut self, _frame: Frame, _dst: &mut BytesMut) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::PROTOCOL_NOT_DETECTED,
            "cannot encode before the protocol is detected",
        ))
    }

    fn unread(&mut self, bytes: Bytes) {
        self.pushback.push(bytes);
    }
}

/// 识别阶段使用的处理器。
pub struct NegotiatingHandler {
    candidates: Arc<[Arc<dyn Protocol>]>,
    timeout: Duration,
    detected: Arc<AtomicBool>,
}

impl NegotiatingHandler {
    pub fn new(candidates: Arc<[Arc<dyn Protocol>]>, timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
            detected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ProtocolHandler for NegotiatingHandler {
    fn protocol(&self) -> &str {
        ANY_PROTOCOL
    }

    fn on_connected(&mut self, cx: &mut HandlerContext<'_>) {
        cx.transport().resume_read();
        let detected = Arc::clone(&self.detected);
        let timeout = self.timeout;
        cx.connection().schedule_once(timeout, move |connection| {
            if detected.load(Ordering::Acquire)
                || connection.service_state() != ServiceState::Started
            {
                return;
            }
            let error = CoreError::new(
                codes::PROTOCOL_DETECTION_TIMEOUT,
                format!("no protocol detected within {} ms", timeout.as_millis()),
            )
            .with_category(ErrorCategory::Timeout);
            tracing::warn!(
                connection = connection.id(),
                code = error.code(),
                error = %error,
                "protocol detection timed out; closing connection"
            );
            connection.stop(Completion::noop());
        });
    }

    fn on_frame(&mut self, cx: &mut HandlerContext<'_>, frame: Frame) {
        tracing::debug!(
            connection = cx.connection_id(),
            frame = frame.type_name(),
            "frame received before protocol detection; dropped"
        );
    }

    fn on_protocol_detected(&mut self, cx: &mut HandlerContext<'_>, protocol: &str) {
        self.detected.store(true, Ordering::Release);
        match self
            .candidates
            .iter()
            .find(|candidate| candidate.id() == protocol)
        {
            Some(candidate) => {
                tracing::debug!(connection = cx.connection_id(), protocol, "protocol detected");
                cx.replace_handler(candidate.create_handler());
            }
            None => {
                tracing::warn!(
                    connection = cx.connection_id(),
                    protocol,
                    "detected protocol is not a candidate; closing connection"
                );
                cx.stop_connection();
            }
        }
    }

    fn on_failure(&mut self, _cx: &mut HandlerContext<'_>, error: &CoreError) {
        if error.code() == codes::PROTOCOL_UNIDENTIFIED {
            self.detected.store(true, Ordering::Release);
        }
    }
}
