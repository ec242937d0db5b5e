//! Configuration management for Windowgate.
//!
//! [`WindowgateConfig`] is the loose, file/environment shaped configuration.
//! It is validated into an immutable [`RateLimiterConfig`] before any store
//! connection is attempted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, WindowgateError};
use crate::ratelimit::validate_namespace;

/// Prefix of environment variables overriding file configuration,
/// e.g. `WINDOWGATE_STORE__CREDENTIAL`.
pub const ENV_PREFIX: &str = "WINDOWGATE";

/// What the limiter answers when the counter store cannot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deny the request.
    #[default]
    FailClosed,
    /// Let the request through uncounted.
    FailOpen,
}

/// Main configuration for the Windowgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,
}

/// Rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Window length in milliseconds
    pub window_ms: Option<i64>,

    /// Maximum requests per window per key
    pub limit: Option<i64>,

    /// Namespace separating this limiter's keys from others sharing the store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Policy when a single store call fails
    #[serde(default)]
    pub on_store_error: FailurePolicy,

    /// Policy while the store session is unavailable
    #[serde(default)]
    pub on_disconnect: FailurePolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            window_ms: None,
            limit: None,
            namespace: default_namespace(),
            key_prefix: default_key_prefix(),
            on_store_error: FailurePolicy::default(),
            on_disconnect: FailurePolicy::default(),
        }
    }
}

fn default_namespace() -> String {
    "endpoint".to_string()
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

/// Counter store settings.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Connection URL, e.g. `redis://cache.internal:6379`
    pub address: Option<String>,

    /// Authentication secret
    pub credential: Option<String>,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("address", &self.address)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WindowgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WindowgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply
    /// `WINDOWGATE_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| WindowgateError::Config(e.to_string()))
    }

    /// Validate into a [`RateLimiterConfig`].
    pub fn rate_limiter_config(&self) -> Result<RateLimiterConfig> {
        let window_ms = self.limiter.window_ms.ok_or_else(|| {
            WindowgateError::Config("window_ms must be a positive number".to_string())
        })?;
        let limit = self.limiter.limit.ok_or_else(|| {
            WindowgateError::Config("limit must be a positive number".to_string())
        })?;
        let address = self
            .store
            .address
            .clone()
            .ok_or_else(|| WindowgateError::Config("store address is required".to_string()))?;
        let credential = self
            .store
            .credential
            .clone()
            .ok_or_else(|| WindowgateError::Config("store credential is required".to_string()))?;

        Ok(RateLimiterConfig::new(window_ms, limit, address, credential)?
            .with_namespace(self.limiter.namespace.clone())?
            .with_key_prefix(self.limiter.key_prefix.clone())
            .with_failure_policy(self.limiter.on_store_error, self.limiter.on_disconnect))
    }
}

/// Validated, immutable rate limiter configuration.
#[derive(Clone)]
pub struct RateLimiterConfig {
    window: Duration,
    limit: u64,
    store_address: String,
    store_credential: String,
    namespace: String,
    key_prefix: String,
    on_store_error: FailurePolicy,
    on_disconnect: FailurePolicy,
}

impl std::fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("window", &self.window)
            .field("limit", &self.limit)
            .field("store_address", &self.store_address)
            .field("store_credential", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("key_prefix", &self.key_prefix)
            .field("on_store_error", &self.on_store_error)
            .field("on_disconnect", &self.on_disconnect)
            .finish()
    }
}

impl RateLimiterConfig {
    /// Validate and build a configuration. Performs no I/O.
    pub fn new(
        window_ms: i64,
        limit: i64,
        store_address: impl Into<String>,
        store_credential: impl Into<String>,
    ) -> Result<Self> {
        let store_address = store_address.into();
        let store_credential = store_credential.into();

        if window_ms <= 0 {
            return Err(WindowgateError::Config(
                "window_ms must be a positive number".to_string(),
            ));
        }
        if limit <= 0 {
            return Err(WindowgateError::Config(
                "limit must be a positive number".to_string(),
            ));
        }
        if store_address.trim().is_empty() {
            return Err(WindowgateError::Config("store address is required".to_string()));
        }
        if store_credential.is_empty() {
            return Err(WindowgateError::Config(
                "store credential is required".to_string(),
            ));
        }

        Ok(Self {
            window: Duration::from_millis(window_ms as u64),
            limit: limit as u64,
            store_address,
            store_credential,
            namespace: default_namespace(),
            key_prefix: default_key_prefix(),
            on_store_error: FailurePolicy::default(),
            on_disconnect: FailurePolicy::default(),
        })
    }

    /// Set the key namespace. It must be non-empty and free of `:`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        self.namespace = namespace;
        Ok(self)
    }

    /// Set the store key prefix.
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Set the failure policies for store errors and lost connections.
    pub fn with_failure_policy(
        mut self,
        on_store_error: FailurePolicy,
        on_disconnect: FailurePolicy,
    ) -> Self {
        self.on_store_error = on_store_error;
        self.on_disconnect = on_disconnect;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn store_address(&self) -> &str {
        &self.store_address
    }

    pub fn store_credential(&self) -> &str {
        &self.store_credential
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn on_store_error(&self) -> FailurePolicy {
        self.on_store_error
    }

    pub fn on_disconnect(&self) -> FailurePolicy {
        self.on_disconnect
    }
}
