use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Worker API reachable over HTTP
    Http {
        base_url: String,
        /// Supports ${ENV_VAR} substitution
        #[serde(default)]
        api_token: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    /// Worker runtime directory on this machine
    WorkerRoot {
        #[serde(default = "default_worker_root")]
        root: PathBuf,
        /// Worker binary used for `run` and `sign`
        worker_bin: PathBuf,
        /// Relative to `root` unless absolute
        #[serde(default = "default_signing_key")]
        signing_key: PathBuf,
        #[serde(default = "default_approved_by")]
        approved_by: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_decisions_ms")]
    pub decisions_ms: u64,
    #[serde(default = "default_tenants_ms")]
    pub tenants_ms: u64,
    #[serde(default = "default_inbox_ms")]
    pub inbox_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            decisions_ms: default_decisions_ms(),
            tenants_ms: default_tenants_ms(),
            inbox_ms: default_inbox_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Sandbox backend passed to fleet runs (`--backend`)
    #[serde(default = "default_execution_backend")]
    pub backend: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: default_execution_backend(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_worker_root() -> PathBuf {
    PathBuf::from(shellexpand::tilde("~/.nightcore").into_owned())
}

fn default_signing_key() -> PathBuf {
    PathBuf::from("keys/maintainers/admin1.key")
}

fn default_approved_by() -> String {
    "console".to_string()
}

fn default_decisions_ms() -> u64 {
    3000
}

fn default_tenants_ms() -> u64 {
    5000
}

fn default_inbox_ms() -> u64 {
    4000
}

fn default_execution_backend() -> String {
    "wasmtime".to_string()
}

impl BackendConfig {
    /// Human-readable description of the backend
    pub fn description(&self) -> String {
        match self {
            BackendConfig::Http { base_url, .. } => format!("http ({base_url})"),
            BackendConfig::WorkerRoot { root, .. } => {
                format!("worker root ({})", root.display())
            }
        }
    }
}

impl PollingConfig {
    pub fn decisions_interval(&self) -> Duration {
        Duration::from_millis(self.decisions_ms.max(1))
    }

    pub fn tenants_interval(&self) -> Duration {
        Duration::from_millis(self.tenants_ms.max(1))
    }

    pub fn inbox_interval(&self) -> Duration {
        Duration::from_millis(self.inbox_ms.max(1))
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${WORKER_API_TOKEN}
        let expanded = shellexpand::env(content)?;
        let mut config: Config = toml::from_str(&expanded)?;
        if let BackendConfig::WorkerRoot {
            root, worker_bin, ..
        } = &mut config.backend
        {
            *root = expand_tilde(root);
            *worker_bin = expand_tilde(worker_bin);
        }
        Ok(config)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
