// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable-based configuration provider implementation.
//!
//! `SHUNTTEE_PROXY__MAX_LOOPS=4` is read as `proxy.max_loops = 4`: the prefix
//! is stripped, the rest lowercased and every `__` becomes a key separator.

use std::collections::HashMap;
use std::env;

use serde_json::{Map, Value, json};

use super::ConfigError;
use super::ConfigProvider;

/// Prefix used by [`EnvConfigProvider::default`].
pub const DEFAULT_PREFIX: &str = "SHUNTTEE_";

const SEPARATOR: &str = "__";

/// Configuration provider that retrieves values from environment variables.
#[derive(Debug)]
pub struct EnvConfigProvider {
    /// Prefix for environment variables (e.g., "SHUNTTEE_").
    prefix: String,
    /// Cache of environment variables that match the prefix, by config key.
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    /// Create a new environment variable configuration provider with the specified prefix.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache.clear();

        for (key, value) in env::vars() {
            if let Some(rest) = key.strip_prefix(&self.prefix) {
                let config_key = rest.to_lowercase().replace(SEPARATOR, ".");
                self.cache.insert(config_key, value);
            }
        }
    }

    /// Parse a string value into a JSON Value.
    fn parse_value_to_json(value: &str) -> Value {
        if let Ok(json_value) = serde_json::from_str(value) {
            return json_value;
        }

        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        } else if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }

        if let Ok(int_val) = value.parse::<i64>() {
            return json!(int_val);
        }
        if let Ok(float_val) = value.parse::<f64>() {
            return json!(float_val);
        }

        json!(value)
    }

    /// Build an object out of every cached key below `key`.
    fn assemble(&self, key: &str) -> Option<Value> {
        let prefix = format!("{key}.");
        let mut root = Map::new();

        for (full, raw) in &self.cache {
            let Some(rest) = full.strip_prefix(&prefix) else {
                continue;
            };
            let mut parts = rest.split('.').peekable();
            let mut node = &mut root;
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), Self::parse_value_to_json(raw));
                    break;
                }
                let child = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                match child {
                    Value::Object(map) => node = map,
                    _ => break,
                }
            }
        }

        (!root.is_empty()).then_some(Value::Object(root))
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        match self.cache.get(key) {
            Some(value) => Ok(Some(Self::parse_value_to_json(value))),
            None => Ok(self.assemble(key)),
        }
    }

    fn has(&self, key: &str) -> bool {
        let prefix = format!("{key}.");
        self.cache.contains_key(key) || self.cache.keys().any(|k| k.starts_with(&prefix))
    }

    fn provider_name(&self) -> &str {
        "env"
    }
}
