//! `Backend` trait: abstraction over the worker the console supervises.
//!
//! Adapters (HTTP worker API, local worker root) implement this trait so
//! the console can be pointed at either via the `[backend] kind` config
//! field. Reads return raw JSON; the console validates it at the boundary.

pub mod http;
pub mod worker_root;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::{ActionError, FetchError};

pub use http::HttpBackend;
pub use worker_root::WorkerRootBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Raw decision log. Ordering and shape are not guaranteed.
    async fn fetch_decisions(&self) -> Result<Value, FetchError>;

    /// Raw per-tenant authorization / execution lifecycle.
    async fn fetch_tenant_states(&self) -> Result<Value, FetchError>;

    /// Raw list of agent submissions awaiting review.
    async fn fetch_inbox(&self) -> Result<Value, FetchError>;

    /// Records approval and signs the tenant's artifact.
    async fn approve_tenant(&self, tenant: &str) -> Result<(), ActionError>;

    /// Discards a submission. Fails with `NotFound` if it is already gone.
    async fn reject_tenant(&self, tenant: &str) -> Result<(), ActionError>;

    /// Runs a worker command and returns its standard output.
    async fn run_command(&self, args: &[String]) -> Result<String, ActionError>;

    /// Human-readable description, e.g. `"http (http://localhost:7420)"`.
    fn description(&self) -> String;
}

/// Builds the adapter selected in config.
pub fn from_config(config: &BackendConfig) -> anyhow::Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config {
        BackendConfig::Http {
            base_url,
            api_token,
            timeout_secs,
        } => Box::new(HttpBackend::new(
            base_url,
            api_token.clone(),
            std::time::Duration::from_secs(*timeout_secs),
        )?),
        BackendConfig::WorkerRoot {
            root,
            worker_bin,
            signing_key,
            approved_by,
        } => Box::new(WorkerRootBackend::new(
            root.clone(),
            worker_bin.clone(),
            signing_key.clone(),
            approved_by.clone(),
        )),
    };
    Ok(backend)
}
