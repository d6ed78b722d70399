use std::{any::Any, fmt};

/// 协议无关的帧容器。
///
/// 编解码器产出具体协议的帧类型，处理器再以 [`downcast`](Self::downcast) 取回；
/// 类型不匹配时原样交还，调用方可以继续尝试其他类型或报告协议错误。
pub struct Frame {
    payload: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl Frame {
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            payload: Box::new(payload),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Frame> {
        let type_name = self.type_name;
        self.payload
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|payload| Frame { payload, type_name })
    }

    /// 负载的类型名，仅用于诊断输出。
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Frame").field(&self.type_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_returns_frame_on_mismatch() {
        let frame = Frame::new(String::from("CONNECT"));
        assert!(frame.is::<String>());
        let frame = frame.downcast::<u32>().expect_err("not a u32");
        assert_eq!(frame.downcast::<String>().expect("string"), "CONNECT");
    }
}
