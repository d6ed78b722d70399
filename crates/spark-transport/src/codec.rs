use crate::Frame;
use bytes::{Bytes, BytesMut};
use spark_core::CoreError;
use std::fmt;

/// 一次解码的结果。
pub enum Decoded {
    /// 解出一个完整帧。
    Frame(Frame),
    /// 识别出对端协议：传输层应安装 `codec` 作为新的活动编解码器，并上报 `protocol`。
    Switch {
        protocol: String,
        codec: Box<dyn ProtocolCodec>,
    },
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoded::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            Decoded::Switch { protocol, .. } => {
                f.debug_struct("Switch").field("protocol", protocol).finish()
            }
        }
    }
}

/// 协议编解码器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接在建立之初可能并不知道对端讲哪种协议；编解码器因此需要能在解码过程中“把自己换掉”，
///   并把已经读走的字节还给继任者；
///
/// ## 契约（What）
/// - `decode`：从 `src` 消费字节；字节不足时返回 `Ok(None)` 且保留未消费部分；
///   返回 [`Decoded::Switch`] 后，传输层不得再用本编解码器解码；
/// - `encode`：把帧追加到 `dst`；帧类型不匹配时返回错误；
/// - `unread`：把字节放回输入端，下一次 `decode` 必须先看到这些字节；
/// - 编解码器只在单个任务中被串行调用，因此只要求 `Send`。
pub trait ProtocolCodec: Send + 'static {
    /// 编解码器对应的协议标识。
    fn protocol(&self) -> &str;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, CoreError>;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CoreError>;

    fn unread(&mut self, bytes: Bytes);
}

/// 编解码器内部使用的回退缓冲区，实现 [`ProtocolCodec::unread`] 的语义。
///
/// - `push` 把字节放到尚未消费数据的最前面；
/// - `restore` 在解码前把回退字节拼到输入缓冲区头部。
#[derive(Debug, Default)]
pub struct PushbackBuffer {
    pending: BytesMut,
}

impl PushbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.pending.len());
        merged.extend_from_slice(&bytes);
        merged.extend_from_slice(&self.pending);
        self.pending = merged;
    }

    pub fn restore(&mut self, src: &mut BytesMut) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.extend_from_slice(src);
        src.clear();
        std::mem::swap(&mut self.pending, src);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// 解码循环产生的事件。
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Frame),
    ProtocolDetected(String),
}

/// 用 `codec` 反复解码 `buffer`，直到字节不足或发生协议切换。
///
/// 返回 `Ok(true)` 表示已切换编解码器：调用方应暂停读取并上报事件，
/// 恢复读取后先对 `buffer` 中剩余字节再次调用本函数。
pub fn drain_decoded(
    codec: &mut Box<dyn ProtocolCodec>,
    buffer: &mut BytesMut,
    events: &mut Vec<ReadEvent>,
) -> Result<bool, CoreError> {
    loop {
        match codec.decode(buffer)? {
            Some(Decoded::Frame(frame)) => events.push(ReadEvent::Frame(frame)),
            Some(Decoded::Switch {
                protocol,
                codec: next,
            }) => {
                *codec = next;
                events.push(ReadEvent::ProtocolDetected(protocol));
                return Ok(true);
            }
            None => return Ok(false),
        }
    }
}
