use crate::tasks::TaskDefinition;
use crate::webhook::WebhookEndpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {msg}")]
    Parse { path: PathBuf, msg: String },
    #[error("Unsupported config file extension: {0}")]
    UnsupportedFormat(String),
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_verify_tls() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RucioSettings {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtsSettings {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// PEM client certificate, or a grid proxy holding certificate and key
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key, when not bundled in `cert_path`
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl FtsSettings {
    /// Client certificate and optional key to authenticate with. Falls back
    /// to `proxy` (the `X509_USER_PROXY` file) when no certificate is set.
    pub fn credentials(&self, proxy: Option<PathBuf>) -> Option<(PathBuf, Option<PathBuf>)> {
        match &self.cert_path {
            Some(cert) => Some((cert.clone(), self.key_path.clone())),
            None => proxy.map(|proxy| (proxy, None)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Es,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    #[serde(default)]
    pub uri: String,
    pub index: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Es,
            uri: String::from("http://localhost:9200"),
            index: String::from("replication-rules"),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulewatchConfig {
    #[serde(default)]
    pub rucio: Option<RucioSettings>,
    #[serde(default)]
    pub fts: Option<FtsSettings>,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub webhooks: Vec<WebhookEndpoint>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl RulewatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let parse_error = |msg: String| ConfigError::Parse {
            path: path.to_path_buf(),
            msg,
        };

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string())),
            "yml" | "yaml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error(e.to_string()))
            }
            _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
