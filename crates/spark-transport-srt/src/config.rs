use crate::error::SrtError;
use crate::options::Options;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 套接字层的默认配置。
///
/// ```toml
/// dial_timeout_ms = 3000
///
/// [options]
/// payloadsize = "1316"
/// latency = "120"
/// ```
///
/// - `dial_timeout_ms`：`Dialer` 的默认建连超时，缺省或为 0 表示不限；
/// - `options`：监听与建连时叠加在调用方选项之下的默认选项。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SrtConfig {
    pub dial_timeout_ms: Option<u64>,
    pub options: Options,
}

impl SrtConfig {
    /// 从 TOML 文本加载配置。
    pub fn from_toml_str(text: &str) -> Result<Self, SrtError> {
        toml::from_str(text).map_err(|err| SrtError::InvalidConfig(err.to_string()))
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_ms
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timeout_and_options() {
        let config = SrtConfig::from_toml_str(
            r#"
            dial_timeout_ms = 250

            [options]
            payloadsize = "32"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.dial_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.options.get("payloadsize"), Some("32"));
    }

    #[test]
    fn empty_document_is_default() {
        let config = SrtConfig::from_toml_str("").expect("empty");
        assert_eq!(config, SrtConfig::default());
        assert_eq!(config.dial_timeout(), None);
    }

    #[test]
    fn rejects_unknown_fields_and_bad_types() {
        for text in ["backlog = 5", "dial_timeout_ms = \"soon\"", "[options]\npayloadsize = 32"] {
            let err = SrtConfig::from_toml_str(text).expect_err(text);
            assert!(matches!(err, SrtError::InvalidConfig(_)), "{text}");
        }
    }
}
