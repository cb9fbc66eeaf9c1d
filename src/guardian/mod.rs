//! Guardian data model and the pure functions over it.
//!
//! Everything in here is synchronous and side-effect free: decoding of
//! loosely-typed worker payloads, the latest-decision reduction and the
//! risk classification. The pollers and the gate build on top of it.

pub mod decision;
pub mod reducer;
pub mod risk;
pub mod tenant;

use serde_json::Value;
use tracing::{debug, warn};

pub use decision::Decision;
pub use reducer::{history_for, latest_for, latest_per_tenant};
pub use risk::{classify, RiskSummary};
pub use tenant::{InboxEntry, ObservationState, TenantState};

/// How loudly a dropped record is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropLevel {
    Debug,
    Warn,
}

/// Decodes every element of a JSON array with `decode`, dropping the
/// elements it rejects. A payload that is not an array decodes to nothing.
pub fn decode_records<T>(
    kind: &str,
    payload: &Value,
    level: DropLevel,
    decode: impl Fn(&Value) -> Result<T, String>,
) -> Vec<T> {
    let Some(items) = payload.as_array() else {
        debug!("{kind}: payload is not an array, treating as empty");
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    let mut dropped = 0usize;
    for item in items {
        match decode(item) {
            Ok(record) => out.push(record),
            Err(e) => {
                dropped += 1;
                match level {
                    DropLevel::Debug => debug!("{kind}: dropping malformed record: {e}"),
                    DropLevel::Warn => warn!("{kind}: dropping malformed record: {e}"),
                }
            }
        }
    }

    if dropped > 0 {
        debug!("{kind}: kept {}, dropped {dropped}", out.len());
    }
    out
}

pub fn decode_decisions(payload: &Value) -> Vec<Decision> {
    decode_records("decisions", payload, DropLevel::Debug, decision::decode_decision)
}

/// A dropped tenant record is invisible to the gate, so drops are warned.
pub fn decode_tenant_states(payload: &Value) -> Vec<TenantState> {
    decode_records("tenants", payload, DropLevel::Warn, tenant::decode_tenant_state)
}

pub fn decode_inbox(payload: &Value) -> Vec<InboxEntry> {
    decode_records("inbox", payload, DropLevel::Debug, tenant::decode_inbox_entry)
}
