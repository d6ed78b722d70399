//! Broker 与连接器的配置。
//!
//! ## 意图（Why）
//! - 配置以带标签的和类型表达，取用方穷举匹配，不存在“按类型令牌查找再强转”的路径；
//!
//! ## 契约（What）
//! - [`BrokerConfig::from_toml_str`] 解析并校验；校验失败返回 [`BrokerError`]；
//! - 所有可选字段都有默认值，最小配置只需 `id`。
//!
//! ```
//! use spark_broker::config::{BrokerConfig, ConnectorConfig};
//!
//! let config = BrokerConfig::from_toml_str(
//!     r#"
//!     id = "default"
//!
//!     [[connectors]]
//!     kind = "accepting"
//!     id = "tcp"
//!     bind = "tcp://127.0.0.1:61613"
//!     connection_limit = 2
//!     "#,
//! )
//! .expect("valid config");
//! let ConnectorConfig::Accepting(connector) = &config.connectors[0];
//! assert_eq!(connector.connection_limit, Some(2));
//! assert_eq!(connector.protocol, "any");
//! ```

use crate::{error::BrokerError, protocol::ANY_PROTOCOL};
use serde::{Deserialize, Serialize};
use spark_transport::BindUri;
use std::{collections::HashSet, time::Duration};

const DEFAULT_HEAP_BUDGET: u64 = 512 * 1024 * 1024;
const DEFAULT_SAMPLING_PERIOD_MS: u64 = 100;
const DEFAULT_WINDOW_SAMPLES: usize = 300;
const DEFAULT_BLOCKING_THREADS: usize = 16;
const DEFAULT_DETECT_TIMEOUT_MS: u64 = 5_000;

fn default_heap_budget() -> u64 {
    DEFAULT_HEAP_BUDGET
}

fn default_sampling_period_ms() -> u64 {
    DEFAULT_SAMPLING_PERIOD_MS
}

fn default_window_samples() -> usize {
    DEFAULT_WINDOW_SAMPLES
}

fn default_blocking_threads() -> usize {
    DEFAULT_BLOCKING_THREADS
}

fn default_bind() -> String {
    "tcp://0.0.0.0:0".to_owned()
}

fn default_protocol() -> String {
    ANY_PROTOCOL.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_detect_timeout_ms() -> u64 {
    DEFAULT_DETECT_TIMEOUT_MS
}

/// Broker 顶层配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub id: String,
    /// 连接缓冲区调优使用的堆预算（字节）。
    #[serde(default = "default_heap_budget")]
    pub heap_budget_bytes: u64,
    /// 连接数采样周期（毫秒）。
    #[serde(default = "default_sampling_period_ms")]
    pub sampling_period_ms: u64,
    /// 滚动窗口保留的采样数；窗口覆盖时长为 `window_samples × sampling_period_ms`。
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,
    /// 阻塞任务池的并发上限。
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

impl BrokerConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            heap_budget_bytes: DEFAULT_HEAP_BUDGET,
            sampling_period_ms: DEFAULT_SAMPLING_PERIOD_MS,
            window_samples: DEFAULT_WINDOW_SAMPLES,
            blocking_threads: DEFAULT_BLOCKING_THREADS,
            connectors: Vec::new(),
        }
    }

    /// 追加一个连接器配置。
    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn sampling_period(&self) -> Duration {
        Duration::from_millis(self.sampling_period_ms)
    }

    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, BrokerError> {
        let config: BrokerConfig =
            toml::from_str(text).map_err(|err| BrokerError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束：标识非空、连接器标识唯一、绑定地址可解析、采样参数为正。
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.id.trim().is_empty() {
            return Err(BrokerError::InvalidConfig("broker id must not be empty".into()));
        }
        if self.sampling_period_ms == 0 {
            return Err(BrokerError::InvalidConfig(
                "sampling_period_ms must be positive".into(),
            ));
        }
        if self.window_samples == 0 {
            return Err(BrokerError::InvalidConfig(
                "window_samples must be positive".into(),
            ));
        }
        if self.blocking_threads == 0 {
            return Err(BrokerError::InvalidConfig(
                "blocking_threads must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for connector in &self.connectors {
            if !seen.insert(connector.id()) {
                return Err(BrokerError::DuplicateConnector(connector.id().to_owned()));
            }
            connector.validate()?;
        }
        Ok(())
    }
}

/// 连接器配置的和类型。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    Accepting(AcceptingConnectorConfig),
}

impl ConnectorConfig {
    pub fn id(&self) -> &str {
        match self {
            ConnectorConfig::Accepting(config) => &config.id,
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        match self {
            ConnectorConfig::Accepting(config) => config.validate(),
        }
    }
}

/// 监听型连接器配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptingConnectorConfig {
    pub id: String,
    /// `scheme://host:port`，端口 0 由操作系统分配。
    #[serde(default = "default_bind")]
    pub bind: String,
    /// 固定协议标识，`"any"` 表示自动识别。
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 连接数上限；缺省不限。
    #[serde(default)]
    pub connection_limit: Option<u32>,
    #[serde(default = "default_true")]
    pub receive_buffer_auto_tune: bool,
    #[serde(default = "default_true")]
    pub send_buffer_auto_tune: bool,
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
}

impl AcceptingConnectorConfig {
    pub fn new(id: impl Into<String>, bind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bind: bind.into(),
            protocol: default_protocol(),
            connection_limit: None,
            receive_buffer_auto_tune: true,
            send_buffer_auto_tune: true,
            protocols: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_connection_limit(mut self, limit: u32) -> Self {
        self.connection_limit = Some(limit);
        self
    }

    pub fn with_protocol_config(mut self, config: ProtocolConfig) -> Self {
        self.protocols.push(config);
        self
    }

    /// 自动识别的附加配置；同类配置出现多次时取第一项。
    pub fn detect_config(&self) -> Option<&DetectConfig> {
        self.protocols.iter().find_map(|config| match config {
            ProtocolConfig::Detect(detect) => Some(detect),
        })
    }

    /// 识别超时；未配置时为 5 秒。
    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(
            self.detect_config()
                .map(|detect| detect.timeout_ms)
                .unwrap_or(DEFAULT_DETECT_TIMEOUT_MS),
        )
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.id.trim().is_empty() {
            return Err(BrokerError::InvalidConfig(
                "connector id must not be empty".into(),
            ));
        }
        self.bind.parse::<BindUri>().map_err(|err| {
            BrokerError::InvalidConfig(format!("connector `{}`: {}", self.id, err.message()))
        })?;
        if self.protocol.trim().is_empty() {
            return Err(BrokerError::InvalidConfig(format!(
                "connector `{}`: protocol must not be empty",
                self.id
            )));
        }
        if self.detect_config().is_some_and(|detect| detect.timeout_ms == 0) {
            return Err(BrokerError::InvalidConfig(format!(
                "connector `{}`: detection timeout must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// 协议相关配置的和类型。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolConfig {
    Detect(DetectConfig),
}

/// 自动识别配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectConfig {
    /// 允许参与识别的协议；缺省为全部可识别协议。
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
    #[serde(default = "default_detect_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            protocols: None,
            timeout_ms: DEFAULT_DETECT_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = BrokerConfig::from_toml_str(
            r#"
            id = "b"

            [[connectors]]
            kind = "accepting"
            id = "c"
            "#,
        )
        .expect("parse");
        assert_eq!(config.heap_budget_bytes, 512 * 1024 * 1024);
        assert_eq!(config.sampling_period(), Duration::from_millis(100));
        assert_eq!(config.window_samples, 300);
        let ConnectorConfig::Accepting(connector) = &config.connectors[0];
        assert_eq!(connector.bind, "tcp://0.0.0.0:0");
        assert!(connector.receive_buffer_auto_tune && connector.send_buffer_auto_tune);
        assert_eq!(connector.connection_limit, None);
        assert_eq!(connector.detect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn detect_section_restricts_candidates() {
        let config = BrokerConfig::from_toml_str(
            r#"
            id = "b"

            [[connectors]]
            kind = "accepting"
            id = "c"
            bind = "tcp://127.0.0.1:0"

            [[connectors.protocols]]
            kind = "detect"
            protocols = ["stomp", "amqp"]
            timeout_ms = 250
            "#,
        )
        .expect("parse");
        let ConnectorConfig::Accepting(connector) = &config.connectors[0];
        let detect = connector.detect_config().expect("detect config");
        assert_eq!(
            detect.protocols.as_deref(),
            Some(&["stomp".to_owned(), "amqp".to_owned()][..])
        );
        assert_eq!(connector.detect_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn duplicate_connector_ids_are_rejected() {
        let config = BrokerConfig::new("b")
            .with_connector(ConnectorConfig::Accepting(AcceptingConnectorConfig::new(
                "c",
                "tcp://127.0.0.1:0",
            )))
            .with_connector(ConnectorConfig::Accepting(AcceptingConnectorConfig::new(
                "c",
                "tcp://127.0.0.1:0",
            )));
        assert_eq!(
            config.validate(),
            Err(BrokerError::DuplicateConnector("c".into()))
        );
    }

    #[test]
    fn malformed_input_is_invalid_config() {
        let bad_bind = BrokerConfig::new("b").with_connector(ConnectorConfig::Accepting(
            AcceptingConnectorConfig::new("c", "no-scheme"),
        ));
        assert!(matches!(
            bad_bind.validate(),
            Err(BrokerError::InvalidConfig(_))
        ));
        assert!(matches!(
            BrokerConfig::from_toml_str("id = 3"),
            Err(BrokerError::InvalidConfig(_))
        ));
        assert!(matches!(
            BrokerConfig::from_toml_str("id = \"b\"\nsampling_period_ms = 0"),
            Err(BrokerError::InvalidConfig(_))
        ));
    }
}
