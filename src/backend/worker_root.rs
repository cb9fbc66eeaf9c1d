//! Local worker runtime directory as a backend.
//!
//! Layout, as written by the worker:
//!
//! ```text
//! <root>/logs/guardian_decisions.jsonl     one decision per line
//! <root>/modules/<tenant>/manifest.json    ingestion + approval record
//! <root>/modules/<tenant>/module.sig       present once signed
//! ```
//!
//! The worker stays authoritative. This adapter derives tenant states and
//! the inbox from those files and shells out to the worker binary for
//! `run` and `sign`. All I/O uses `tokio::fs` / `tokio::process`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Backend;
use crate::error::{ActionError, FetchError};
use crate::guardian::tenant::{
    Authorization, Execution, InboxEntry, Ingestion, Observation, ObservationState, TenantState,
};
use crate::guardian::{decode_decisions, latest_per_tenant};

const DECISION_LOG: &str = "logs/guardian_decisions.jsonl";
const MODULES_DIR: &str = "modules";
const MANIFEST: &str = "manifest.json";
const SIGNATURE: &str = "module.sig";

/// Channel of tenants dropped in by hand; they never need approval.
const MANUAL_CHANNEL: &str = "manual";

pub struct WorkerRootBackend {
    root: PathBuf,
    worker_bin: PathBuf,
    signing_key: PathBuf,
    approved_by: String,
}

/// What the manifest says about one tenant.
#[derive(Debug, Default)]
struct ManifestInfo {
    ingestion: Ingestion,
    approved: bool,
    approved_at: Option<String>,
    approved_by: Option<String>,
}

impl ManifestInfo {
    fn from_json(v: &Value) -> Self {
        let ingestion_field = |key: &str| {
            v.get("ingestion")
                .and_then(|i| i.get(key))
                .and_then(|s| s.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        let opt_str = |key: &str| v.get(key).and_then(|s| s.as_str()).map(str::to_string);

        Self {
            ingestion: Ingestion {
                channel: ingestion_field("channel"),
                source: ingestion_field("source"),
                timestamp: ingestion_field("timestamp"),
            },
            approved: v.get("approved").and_then(|b| b.as_bool()).unwrap_or(false),
            approved_at: opt_str("approved_at"),
            approved_by: opt_str("approved_by"),
        }
    }

    fn needs_approval(&self) -> bool {
        self.ingestion.channel != MANUAL_CHANNEL && !self.approved
    }
}

impl WorkerRootBackend {
    pub fn new(root: PathBuf, worker_bin: PathBuf, signing_key: PathBuf, approved_by: String) -> Self {
        Self {
            root,
            worker_bin,
            signing_key,
            approved_by,
        }
    }

    fn module_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(MODULES_DIR).join(tenant)
    }

    fn signing_key_path(&self) -> PathBuf {
        if self.signing_key.is_absolute() {
            self.signing_key.clone()
        } else {
            self.root.join(&self.signing_key)
        }
    }

    /// Tenant names must stay inside `modules/`.
    fn check_tenant_name(tenant: &str, action: &'static str) -> Result<(), ActionError> {
        let valid = !tenant.is_empty()
            && tenant != "."
            && tenant != ".."
            && !tenant.contains(['/', '\\']);
        if valid {
            Ok(())
        } else {
            Err(ActionError::Backend {
                action,
                message: format!("invalid tenant name {tenant:?}"),
            })
        }
    }

    async fn read_decision_log(&self) -> Result<Value, FetchError> {
        let path = self.root.join(DECISION_LOG);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Value::Array(vec![])),
            Err(e) => {
                return Err(FetchError::Unavailable {
                    source_name: "decisions",
                    message: format!("reading {}: {e}", path.display()),
                })
            }
        };

        let mut skipped = 0usize;
        let rows: Vec<Value> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(v) => Some(v),
                Err(_) => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        if skipped > 0 {
            debug!("Skipped {skipped} unparseable line(s) in {}", path.display());
        }
        Ok(Value::Array(rows))
    }

    /// Directory names under `modules/`, sorted.
    async fn list_modules(&self, source_name: &'static str) -> Result<Vec<(String, PathBuf)>, FetchError> {
        let dir = self.root.join(MODULES_DIR);
        let unavailable = |e: std::io::Error| FetchError::Unavailable {
            source_name,
            message: format!("reading {}: {e}", dir.display()),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(unavailable(e)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            out.push((entry.file_name().to_string_lossy().to_string(), path));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// `None` when the tenant has no manifest. An unreadable manifest is
    /// logged and treated the same way rather than failing the whole fetch.
    async fn read_manifest(module_dir: &Path) -> Option<ManifestInfo> {
        let path = module_dir.join(MANIFEST);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                return None;
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => Some(ManifestInfo::from_json(&v)),
            Err(e) => {
                warn!("Cannot parse {}: {e}", path.display());
                None
            }
        }
    }

    /// Runs the worker binary inside the root, returning stdout.
    async fn run_worker(&self, action: &'static str, args: &[String]) -> Result<String, ActionError> {
        debug!("{} {}", self.worker_bin.display(), args.join(" "));

        let output = Command::new(&self.worker_bin)
            .current_dir(&self.root)
            .args(args)
            .output()
            .await
            .map_err(|e| ActionError::Backend {
                action,
                message: format!("cannot start {}: {e}", self.worker_bin.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ActionError::Backend {
                action,
                message: if stderr.is_empty() {
                    format!("worker exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Persists the approval into the tenant's manifest.
    async fn mark_authorized(&self, manifest_path: &Path) -> Result<(), ActionError> {
        let failed = |message: String| ActionError::Backend {
            action: "approve",
            message,
        };

        let raw = tokio::fs::read_to_string(manifest_path)
            .await
            .map_err(|e| failed(format!("reading {}: {e}", manifest_path.display())))?;
        let mut v: Value = serde_json::from_str(&raw)
            .map_err(|e| failed(format!("parsing {}: {e}", manifest_path.display())))?;
        if !v.is_object() {
            return Err(failed(format!("{} is not an object", manifest_path.display())));
        }

        v["approved"] = Value::Bool(true);
        v["approved_at"] = Value::String(Utc::now().to_rfc3339());
        v["approved_by"] = Value::String(self.approved_by.clone());

        let pretty = serde_json::to_string_pretty(&v).map_err(|e| failed(e.to_string()))?;
        tokio::fs::write(manifest_path, pretty)
            .await
            .map_err(|e| failed(format!("writing {}: {e}", manifest_path.display())))
    }
}

/// Observation state as the worker derives it from the files.
fn derive_state(manifest: Option<&ManifestInfo>, has_executed: bool) -> ObservationState {
    match manifest {
        None => ObservationState::Blocked,
        Some(_) if has_executed => ObservationState::Observed,
        Some(m) if m.needs_approval() => ObservationState::PendingApproval,
        Some(_) => ObservationState::Cleared,
    }
}

fn to_value<T: serde::Serialize>(source_name: &'static str, items: &[T]) -> Result<Value, FetchError> {
    serde_json::to_value(items).map_err(|e| FetchError::Malformed {
        source_name,
        message: e.to_string(),
    })
}

#[async_trait]
impl Backend for WorkerRootBackend {
    async fn fetch_decisions(&self) -> Result<Value, FetchError> {
        self.read_decision_log().await
    }

    async fn fetch_tenant_states(&self) -> Result<Value, FetchError> {
        let log = self.read_decision_log().await?;
        let latest: HashMap<String, (String, u8)> = latest_per_tenant(&decode_decisions(&log))
            .into_iter()
            .map(|d| (d.tenant, (d.timestamp.raw, d.threat_score)))
            .collect();

        let mut tenants = Vec::new();
        for (name, dir) in self.list_modules("tenants").await? {
            let manifest = Self::read_manifest(&dir).await;
            let observed = latest.get(&name).cloned();
            let has_executed = observed.is_some();
            let state = derive_state(manifest.as_ref(), has_executed);
            let m = manifest.unwrap_or_default();

            tenants.push(TenantState {
                id: name.clone(),
                name,
                ingestion: m.ingestion,
                authorization: Authorization {
                    approved: m.approved,
                    approved_at: m.approved_at,
                    approved_by: m.approved_by,
                },
                execution: Execution {
                    has_executed,
                    last_execution_time: observed.as_ref().map(|(ts, _)| ts.clone()),
                },
                observation: Observation {
                    current_threat_score: observed.map(|(_, score)| score),
                    state,
                },
            });
        }

        to_value("tenants", &tenants)
    }

    async fn fetch_inbox(&self) -> Result<Value, FetchError> {
        let mut entries = Vec::new();
        for (tenant, dir) in self.list_modules("inbox").await? {
            let timestamp = match Self::read_manifest(&dir).await {
                None => "unknown".to_string(),
                Some(m) if m.needs_approval() => m.ingestion.timestamp,
                Some(_) => continue,
            };
            entries.push(InboxEntry {
                signed: dir.join(SIGNATURE).exists(),
                path: format!("worker://{MODULES_DIR}/{tenant}"),
                tenant,
                timestamp,
            });
        }
        to_value("inbox", &entries)
    }

    /// Signs first and records the approval only once the signature exists,
    /// so a failed signing leaves the manifest untouched.
    async fn approve_tenant(&self, tenant: &str) -> Result<(), ActionError> {
        Self::check_tenant_name(tenant, "approve")?;
        let dir = self.module_dir(tenant);
        if !dir.is_dir() {
            return Err(ActionError::NotFound {
                tenant: tenant.to_string(),
            });
        }

        let manifest_path = dir.join(MANIFEST);
        if !manifest_path.exists() {
            return Err(ActionError::Backend {
                action: "approve",
                message: format!("Manifest missing at {}", manifest_path.display()),
            });
        }

        let key_path = self.signing_key_path();
        if !key_path.exists() {
            return Err(ActionError::Backend {
                action: "approve",
                message: format!("Signing key missing at {}", key_path.display()),
            });
        }

        let args = vec![
            "sign".to_string(),
            "--dir".to_string(),
            dir.to_string_lossy().into_owned(),
            "--key".to_string(),
            key_path.to_string_lossy().into_owned(),
        ];
        self.run_worker("approve", &args).await?;
        self.mark_authorized(&manifest_path).await?;

        info!("Tenant {tenant} approved by {}", self.approved_by);
        Ok(())
    }

    async fn reject_tenant(&self, tenant: &str) -> Result<(), ActionError> {
        Self::check_tenant_name(tenant, "reject")?;
        let dir = self.module_dir(tenant);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Tenant {tenant} rejected, removed {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ActionError::NotFound {
                tenant: tenant.to_string(),
            }),
            Err(e) => Err(ActionError::Backend {
                action: "reject",
                message: format!("removing {}: {e}", dir.display()),
            }),
        }
    }

    async fn run_command(&self, args: &[String]) -> Result<String, ActionError> {
        self.run_worker("run", args).await
    }

    fn description(&self) -> String {
        format!("worker root ({})", self.root.display())
    }
}
