// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layered configuration.
//!
//! A [`Config`] is an ordered list of [`ConfigProvider`]s; later providers
//! override earlier ones.  [`Config::layered`] stacks them like this:
//!
//! 1. `FileConfigProvider` – `shunttee.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `SHUNTTEE_PROXY__MAX_LOOPS=4`
//!
//! Keys read by the proxy core:
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `proxy.timeout`               | seconds | `30`    | Outbound request timeout            |
//! | `proxy.preserve_host`         | bool    | `false` | Send the inbound `Host` upstream    |
//! | `proxy.preserve_original`     | bool    | `false` | Snapshot original request/response  |
//! | `proxy.max_loops`             | integer | `9`     | Loopback nesting budget             |
//! | `proxy.mirror.max_in_flight`  | integer | `64`    | Concurrent mirror requests          |
//! | `proxy.mirror.buffer_chunks`  | integer | `16`    | Tee buffer, in body chunks          |
//! | `proxy.mirror.timeout`        | seconds | `30`    | Timeout of one mirror exchange      |
//! | `proxy.logging`               | object  | –       | See [`crate::logging::LoggingConfig`] |

mod env;
pub mod error;
mod file;

#[cfg(test)]
mod tests;

pub use env::{DEFAULT_PREFIX, EnvConfigProvider};
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Core configuration provider trait that all configuration sources must implement.
/// This trait is object-safe since it doesn't contain generic methods.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the configuration provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Get the name of the configuration provider for debugging purposes.
    fn provider_name(&self) -> &str;

    /// Get a raw configuration value by key.
    /// Returns a JSON Value that can be later deserialized into specific types.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Extension trait for ConfigProvider that provides methods for typed access.
/// This trait is not object-safe because it has generic methods.
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a configuration value by key and deserialize it to the specified type.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }
}

// Implement ConfigProviderExt for any type that implements ConfigProvider
impl<T: ConfigProvider> ConfigProviderExt for T {}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Main configuration struct that holds all providers and handles retrieving values.
#[derive(Debug, Clone)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Get a raw configuration value.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        // Iterate through providers in reverse order to respect priority
        // Later providers (higher index) should override earlier ones
        for provider in self.providers.iter().rev() {
            if provider.has(key) {
                return provider.get_raw(key);
            }
        }
        Ok(None)
    }

    /// Get a configuration value by key, checking all providers in the order they were added.
    /// Returns the first value found.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Get a configuration value by key with a default fallback value.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.get(key)? {
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }

    /// Create a configuration from a single file.
    pub fn default_file(file_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }

    /// An optional file overridden by `SHUNTTEE_*` environment variables.
    pub fn layered(file_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Some(path) = file_path {
            builder = builder.with_provider(FileConfigProvider::new(path)?);
        }
        Ok(builder.with_provider(EnvConfigProvider::default()).build())
    }
}
