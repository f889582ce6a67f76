// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::LevelFilter;
use serde_json::json;

use super::structured::{LogFormat, LoggerConfig, create_logger, request_logger};
use super::test_logger;
use super::*;
use crate::warn_fmt;

#[test]
fn test_logging_config_defaults() {
    let config: LoggingConfig = serde_json::from_value(json!({})).unwrap();
    assert_eq!(config, LoggingConfig::default());
    assert!(!config.structured);
    assert_eq!(config.level_filter(), LevelFilter::Info);
}

#[test]
fn test_level_names() {
    for (name, level) in [
        ("TRACE", LevelFilter::Trace),
        ("debug", LevelFilter::Debug),
        ("warning", LevelFilter::Warn),
        ("critical", LevelFilter::Error),
        ("off", LevelFilter::Off),
        ("verbose", LevelFilter::Info),
    ] {
        let config = LoggingConfig {
            level: name.to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(config.level_filter(), level, "level {name}");
    }
}

#[test]
fn test_to_logger_config() {
    let config: LoggingConfig = serde_json::from_value(json!({
        "structured": true,
        "format": "JSON",
        "level": "warn",
        "static_fields": { "service": "edge", "env": "test" }
    }))
    .unwrap();

    let logger_config = config.to_logger_config();
    assert_eq!(logger_config.format, LogFormat::Json);
    assert_eq!(logger_config.level, slog::Level::Warning);
    assert_eq!(
        logger_config.static_fields,
        vec![
            ("env".to_string(), "test".to_string()),
            ("service".to_string(), "edge".to_string()),
        ]
    );
}

#[test]
fn test_create_loggers() {
    test_logger::init_test_logger();

    for format in [LogFormat::Terminal, LogFormat::Json] {
        let config = LoggerConfig {
            format,
            level: slog::Level::Critical,
            static_fields: vec![("service".to_string(), "edge".to_string())],
        };
        let logger = create_logger(&config);
        let child = request_logger(&logger, "req-1", "GET", "/v1/items");
        slog::debug!(child, "filtered out by level");
    }
}

#[test]
fn test_init_is_idempotent() {
    init(Some(LevelFilter::Warn));
    init(Some(LevelFilter::Trace));
    init_with_config(None, &LoggingConfig::default());

    // the first initialiser wins, a later structured request is ignored
    let structured = LoggingConfig {
        structured: true,
        ..LoggingConfig::default()
    };
    init_with_config(None, &structured);
    assert!(!is_structured_logging());

    warn_fmt!("LoggingTest", "still works after {} calls", 4);
}

#[test]
fn test_init_from_config_rejects_bad_section() {
    #[derive(Debug)]
    struct Section(serde_json::Value);

    impl crate::config::ConfigProvider for Section {
        fn has(&self, key: &str) -> bool {
            key == "proxy.logging"
        }

        fn provider_name(&self) -> &str {
            "section"
        }

        fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, ConfigError> {
            Ok((key == "proxy.logging").then(|| self.0.clone()))
        }
    }

    let config = Config::builder()
        .with_provider(Section(json!({ "structured": "sometimes" })))
        .build();
    assert!(init_from_config(&config, None).is_err());

    let config = Config::builder()
        .with_provider(Section(json!({ "level": "debug" })))
        .build();
    assert!(init_from_config(&config, None).is_ok());
}
