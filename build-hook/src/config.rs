use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ETCD_URL: &str = "http://127.0.0.1:2379";
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Security key is empty (set `security_key` or $SECURITY_KEY)")]
    EmptySecurityKey,

    #[error("Security key must be a single path segment")]
    InvalidSecurityKey,

    #[error("Invalid store URL {0}: {1}")]
    InvalidStoreUrl(String, String),

    #[error("Store timeout cannot be 0")]
    InvalidTimeout,

    #[error("Maximum body size cannot be 0")]
    InvalidMaxBodySize,
}

#[derive(Error, Debug)]
#[error("Invalid value for ${name}: {value:?}")]
pub struct EnvError {
    pub name: &'static str,
    pub value: String,
}

/// Build hook receiver configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    /// Shared secret expected as the first path segment of the hook URL,
    /// i.e. the registry is configured to call `/{security_key}/success`.
    #[serde(default)]
    pub security_key: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            security_key: String::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            store: StoreConfig::default(),
        }
    }
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Config {
    /// Overrides file values with `SERVER_PORT`, `ETCD_URL` and `SECURITY_KEY`.
    ///
    /// `lookup` resolves a variable name to its value, normally `std::env::var(..).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), EnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SERVER_PORT") {
            self.listener.port = port.trim().parse().map_err(|_| EnvError {
                name: "SERVER_PORT",
                value: port.clone(),
            })?;
        }

        if let Some(url) = lookup("ETCD_URL") {
            let timeout_secs = match self.store {
                StoreConfig::Etcd { timeout_secs, .. } => timeout_secs,
                StoreConfig::Memory => DEFAULT_TIMEOUT_SECS,
            };
            self.store = StoreConfig::Etcd { url, timeout_secs };
        }

        if let Some(key) = lookup("SECURITY_KEY") {
            self.security_key = key;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.security_key.is_empty() {
            return Err(ValidationError::EmptySecurityKey);
        }
        if self.security_key.contains('/') {
            return Err(ValidationError::InvalidSecurityKey);
        }
        if self.max_body_bytes == 0 {
            return Err(ValidationError::InvalidMaxBodySize);
        }

        self.store.validate()
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Key/value store backend
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Etcd {
        url: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Etcd {
            url: DEFAULT_ETCD_URL.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Etcd { url, timeout_secs } => {
                let parsed = Url::parse(url)
                    .map_err(|e| ValidationError::InvalidStoreUrl(url.clone(), e.to_string()))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ValidationError::InvalidStoreUrl(
                        url.clone(),
                        "scheme must be http or https".into(),
                    ));
                }
                if *timeout_secs == 0 {
                    return Err(ValidationError::InvalidTimeout);
                }
                Ok(())
            }
            StoreConfig::Memory => Ok(()),
        }
    }
}
