// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;

use serde_json::{Value, json};
use tempfile::Builder;

use crate::config::{Config, ConfigError, ConfigProvider, FileConfigProvider, FileFormat};
use crate::filters::MirrorSettings;

#[derive(Debug)]
struct MockConfigProvider {
    name: String,
    values: serde_json::Map<String, Value>,
}

impl MockConfigProvider {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: serde_json::Map::new(),
        }
    }

    fn with_value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl ConfigProvider for MockConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.values.get(key).cloned())
    }
}

fn config_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_later_provider_wins() {
    let config = Config::builder()
        .with_provider(
            MockConfigProvider::new("base")
                .with_value("proxy.max_loops", json!(9))
                .with_value("proxy.timeout", json!(30)),
        )
        .with_provider(MockConfigProvider::new("override").with_value("proxy.max_loops", json!(3)))
        .build();

    assert_eq!(config.get::<usize>("proxy.max_loops").unwrap(), Some(3));
    assert_eq!(config.get::<u64>("proxy.timeout").unwrap(), Some(30));
}

#[test]
fn test_get_or_default_and_type_errors() {
    let config = Config::builder()
        .with_provider(
            MockConfigProvider::new("test").with_value("proxy.preserve_host", json!("yes")),
        )
        .build();

    assert_eq!(config.get_or_default("proxy.max_loops", 9usize).unwrap(), 9);
    let err = config.get::<bool>("proxy.preserve_host").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(ref m) if m.contains("proxy.preserve_host")));
}

#[test]
fn test_file_formats() {
    assert_eq!(
        FileFormat::from_extension(std::path::Path::new("a.YML")),
        Some(FileFormat::Yaml)
    );
    assert_eq!(FileFormat::from_extension(std::path::Path::new("a.ini")), None);

    let json = config_file(
        ".json",
        r#"{ "proxy": { "max_loops": 2, "mirror": { "timeout": 5 } } }"#,
    );
    let toml = config_file(".toml", "[proxy]\nmax_loops = 2\n\n[proxy.mirror]\ntimeout = 5\n");
    let yaml = config_file(".yaml", "proxy:\n  max_loops: 2\n  mirror:\n    timeout: 5\n");

    for file in [&json, &toml, &yaml] {
        let config = Config::default_file(file.path()).unwrap();
        assert_eq!(config.get::<usize>("proxy.max_loops").unwrap(), Some(2));

        let mirror: MirrorSettings = config
            .get_or_default("proxy.mirror", MirrorSettings::default())
            .unwrap();
        assert_eq!(mirror.timeout, 5);
        assert_eq!(mirror.max_in_flight, 64);
    }
}

#[test]
fn test_file_errors() {
    assert!(matches!(
        FileConfigProvider::new("/definitely/not/here.json"),
        Err(ConfigError::IoError(_))
    ));

    let unsupported = config_file(".ini", "max_loops = 2");
    assert!(matches!(
        FileConfigProvider::new(unsupported.path()),
        Err(ConfigError::ProviderError { .. })
    ));

    let not_an_object = config_file(".json", "[1, 2, 3]");
    assert!(FileConfigProvider::new(not_an_object.path()).is_err());

    let broken = config_file(".yaml", "proxy: [unclosed");
    assert!(FileConfigProvider::new(broken.path()).is_err());
}
