use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Highest threat score the oracle can emit.
pub const MAX_THREAT_SCORE: u8 = 100;

/// Outcome recorded for one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    /// Anything the oracle does not spell `allow` counts as a denial.
    fn from_wire(s: &str) -> Self {
        if s.eq_ignore_ascii_case("allow") {
            Verdict::Allow
        } else {
            Verdict::Deny
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        }
    }
}

/// Ordering key of a decision.
///
/// Keeps the wire text for display next to the parsed instant,
/// which is the only thing comparisons look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    pub at: DateTime<Utc>,
    pub raw: String,
}

impl Timestamp {
    /// Parses RFC 3339 text, a naive `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC),
    /// or an integer epoch in milliseconds.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => {
                let at = DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
                    .or_else(|| {
                        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                            .ok()
                            .map(|naive| naive.and_utc())
                    })?;
                Some(Self { at, raw: s.clone() })
            }
            Value::Number(n) => {
                let millis = n.as_i64()?;
                let at = Utc.timestamp_millis_opt(millis).single()?;
                Some(Self {
                    at,
                    raw: at.to_rfc3339(),
                })
            }
            _ => None,
        }
    }
}

/// Host capabilities the module asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub filesystem: bool,
    pub network: bool,
}

/// Where the module came from and whether we have seen it before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Provenance {
    pub first_seen: bool,
    pub known_hash: bool,
    pub trusted_signer: bool,
}

/// Descriptive fields carried through for display only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionDetails {
    pub proof_mode: bool,
    pub sha256: String,
    pub threat_label: String,
    pub policy_exists: bool,
    pub wasm_size_bytes: u64,
    pub memory_request_mb: u64,
    pub runtime_request_ms: u64,
    pub wasi_imports: Vec<String>,
}

/// One recorded allow/deny outcome. Never mutated once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub timestamp: Timestamp,
    pub tenant: String,
    pub verdict: Verdict,
    pub threat_score: u8,
    pub capabilities: Capabilities,
    pub provenance: Provenance,
    pub backend: String,
    pub backend_allowed: bool,
    pub reason: String,
    pub details: DecisionDetails,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

// ── Wire shape ───────────────────────────────────────────

/// Loose wire record as written by the worker.
/// Only the ordering key, tenant, verdict and score are mandatory.
#[derive(Deserialize)]
struct WireDecision {
    timestamp: Value,
    tenant: String,
    decision: String,
    threat_score: u64,
    #[serde(default)]
    backend: String,
    #[serde(default)]
    backend_allowed: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    wasi_fs_access: bool,
    #[serde(default)]
    wasi_net_access: bool,
    #[serde(default)]
    first_seen: bool,
    #[serde(default)]
    known_sha: bool,
    #[serde(default)]
    trusted_signer: bool,
    #[serde(default)]
    proof_mode: bool,
    #[serde(default)]
    sha256: String,
    #[serde(default)]
    threat_label: String,
    #[serde(default)]
    policy_exists: bool,
    #[serde(default)]
    wasm_size_bytes: u64,
    #[serde(default)]
    memory_request_mb: u64,
    #[serde(default)]
    runtime_request_ms: u64,
    #[serde(default)]
    wasi_imports: Vec<String>,
}

/// Validates one loosely-typed record into a [`Decision`].
pub fn decode_decision(value: &Value) -> Result<Decision, String> {
    let wire: WireDecision =
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;

    let tenant = wire.tenant.trim().to_string();
    if tenant.is_empty() {
        return Err("empty tenant".to_string());
    }

    let timestamp = Timestamp::from_wire(&wire.timestamp)
        .ok_or_else(|| format!("unparseable timestamp {}", wire.timestamp))?;

    let threat_score = u8::try_from(wire.threat_score)
        .ok()
        .filter(|s| *s <= MAX_THREAT_SCORE)
        .ok_or_else(|| format!("threat score {} out of range", wire.threat_score))?;

    Ok(Decision {
        timestamp,
        tenant,
        verdict: Verdict::from_wire(&wire.decision),
        threat_score,
        capabilities: Capabilities {
            filesystem: wire.wasi_fs_access,
            network: wire.wasi_net_access,
        },
        provenance: Provenance {
            first_seen: wire.first_seen,
            known_hash: wire.known_sha,
            trusted_signer: wire.trusted_signer,
        },
        backend: wire.backend,
        backend_allowed: wire.backend_allowed,
        reason: wire.reason,
        details: DecisionDetails {
            proof_mode: wire.proof_mode,
            sha256: wire.sha256,
            threat_label: wire.threat_label,
            policy_exists: wire.policy_exists,
            wasm_size_bytes: wire.wasm_size_bytes,
            memory_request_mb: wire.memory_request_mb,
            runtime_request_ms: wire.runtime_request_ms,
            wasi_imports: wire.wasi_imports,
        },
    })
}

/// Builds a decision in tests without going through JSON.
#[cfg(test)]
pub fn sample(tenant: &str, ts: &str, verdict: Verdict, score: u8) -> Decision {
    Decision {
        timestamp: Timestamp::from_wire(&Value::String(ts.to_string())).unwrap(),
        tenant: tenant.to_string(),
        verdict,
        threat_score: score,
        capabilities: Capabilities::default(),
        provenance: Provenance::default(),
        backend: "wasmtime".to_string(),
        backend_allowed: true,
        reason: String::new(),
        details: DecisionDetails::default(),
    }
}
