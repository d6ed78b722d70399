use spark_core::{CoreError, ErrorCategory};
use thiserror::Error;

/// Broker 领域内可枚举的失败。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - “找不到协议”“找不到监听工厂”这类情况是可预期的分支，以枚举值返回，调用方可以穷举匹配；
///
/// ## 契约（What）
/// - 每个变体对应一个稳定错误码（见 [`BrokerError::code`]）；
/// - 跨 crate 边界时通过 `From<BrokerError> for CoreError` 转换，原枚举保留为 `cause`。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("protocol `{0}` is already registered")]
    DuplicateProtocol(String),
    #[error("connector `{connector}` has no detectable protocols")]
    NoDetectableProtocols { connector: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("connector `{0}` is declared more than once")]
    DuplicateConnector(String),
    #[error("unknown connector `{0}`")]
    UnknownConnector(String),
    #[error("broker `{0}` is not started")]
    BrokerNotStarted(String),
    #[error("no server factory supports scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("broker `{0}` is already registered")]
    DuplicateBroker(String),
}

pub mod codes {
    pub const UNKNOWN_PROTOCOL: &str = "spark.broker.unknown_protocol";
    pub const DUPLICATE_PROTOCOL: &str = "spark.broker.duplicate_protocol";
    pub const NO_DETECTABLE_PROTOCOLS: &str = "spark.broker.no_detectable_protocols";
    pub const INVALID_CONFIG: &str = "spark.broker.invalid_config";
    pub const DUPLICATE_CONNECTOR: &str = "spark.broker.duplicate_connector";
    pub const UNKNOWN_CONNECTOR: &str = "spark.broker.unknown_connector";
    pub const NOT_STARTED: &str = "spark.broker.not_started";
    pub const UNSUPPORTED_SCHEME: &str = "spark.broker.unsupported_scheme";
    pub const DUPLICATE_BROKER: &str = "spark.broker.duplicate_broker";
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::UnknownProtocol(_) => codes::UNKNOWN_PROTOCOL,
            BrokerError::DuplicateProtocol(_) => codes::DUPLICATE_PROTOCOL,
            BrokerError::NoDetectableProtocols { .. } => codes::NO_DETECTABLE_PROTOCOLS,
            BrokerError::InvalidConfig(_) => codes::INVALID_CONFIG,
            BrokerError::DuplicateConnector(_) => codes::DUPLICATE_CONNECTOR,
            BrokerError::UnknownConnector(_) => codes::UNKNOWN_CONNECTOR,
            BrokerError::BrokerNotStarted(_) => codes::NOT_STARTED,
            BrokerError::UnsupportedScheme(_) => codes::UNSUPPORTED_SCHEME,
            BrokerError::DuplicateBroker(_) => codes::DUPLICATE_BROKER,
        }
    }
}

impl From<BrokerError> for CoreError {
    fn from(error: BrokerError) -> Self {
        CoreError::new(error.code(), error.to_string())
            .with_category(ErrorCategory::NonRetryable)
            .with_cause(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_keeps_code_and_cause() {
        let error: CoreError = BrokerError::UnknownProtocol("mqtt".into()).into();
        assert_eq!(error.code(), codes::UNKNOWN_PROTOCOL);
        assert_eq!(error.message(), "unknown protocol `mqtt`");
        assert_eq!(error.category(), ErrorCategory::NonRetryable);
        let cause = error
            .cause()
            .and_then(|cause| cause.downcast_ref::<BrokerError>())
            .expect("cause retained");
        assert_eq!(cause, &BrokerError::UnknownProtocol("mqtt".into()));
    }
}
