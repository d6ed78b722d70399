//! 全局日志安装只能成功一次；独立成测试二进制，避免与 `#[traced_test]` 争抢全局 Subscriber。

use spark_broker::logging::{self, LoggingError};

#[test]
fn install_succeeds_once_then_reports_error() {
    logging::install().expect("first install");
    tracing::info!(target: "spark_broker::logging", "subscriber installed");
    assert!(matches!(
        logging::install(),
        Err(LoggingError::SubscriberAlreadySet)
    ));
}
