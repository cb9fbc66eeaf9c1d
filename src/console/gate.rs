//! Authorization gate.
//!
//! Fleet-wide `run` commands operate over every tenant, so a single
//! tenant that is neither approved nor executed blocks all of them.
//! Non-execution commands (`verify-env`, `export-dashboard`,
//! `inspect-state`, ...) bypass the gate.
//!
//! ```text
//!              first observation (unapproved, never run)
//!   Unknown ────────────────────────────────────────────▶ PendingApproval
//!                                                          │        │
//!                                        approve succeeds  │        │  reject succeeds /
//!                                                          ▼        ▼  observation blocked
//!                                              ApprovedUnexecuted  Blocked
//!                                                          │
//!                                          run completes   ▼
//!                                                       Executed
//!
//!   any state ── new unsigned inbox submission ──▶ PendingApproval
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::guardian::{InboxEntry, ObservationState, TenantState};

/// Shown whenever the gate refuses a run.
pub const BLOCKED_MESSAGE: &str = "Execution blocked: pending approvals detected";

/// Shown when no tenant-state snapshot has been loaded yet.
pub const NOT_LOADED_MESSAGE: &str = "Execution blocked: tenant states not loaded yet";

/// Outcome of consulting the gate. A denial is expected, not an error:
/// it needs a user to approve the blocking tenants, not a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Granted,
    Denied {
        reason: &'static str,
        /// Tenants that are unapproved and have never run.
        blocking: Vec<String>,
    },
}

impl GateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, GateDecision::Granted)
    }
}

/// Denied iff any tenant is unapproved and has never executed.
/// An empty fleet is granted.
pub fn can_run(tenants: &[TenantState]) -> GateDecision {
    let blocking: Vec<String> = tenants
        .iter()
        .filter(|t| t.is_awaiting_approval())
        .map(|t| t.name.clone())
        .collect();

    if blocking.is_empty() {
        GateDecision::Granted
    } else {
        GateDecision::Denied {
            reason: BLOCKED_MESSAGE,
            blocking,
        }
    }
}

/// Only `run` executes tenant code; everything else bypasses the gate.
pub fn requires_gate(args: &[String]) -> bool {
    args.first().is_some_and(|cmd| cmd == "run")
}

/// A gated run over every tenant, as opposed to a single-tenant `run`.
pub fn is_fleet_run(args: &[String]) -> bool {
    requires_gate(args) && args.iter().any(|a| a == "--all")
}

/// `run --all [--proof] --backend <backend>`
pub fn fleet_run_args(backend: &str, proof: bool) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--all".to_string()];
    if proof {
        args.push("--proof".to_string());
    }
    args.push("--backend".to_string());
    args.push(backend.to_string());
    args
}

/// Per-tenant lifecycle as seen by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateState {
    Unknown,
    PendingApproval,
    Blocked,
    Cleared,
    Observed,
    ApprovedUnexecuted,
    Executed,
}

impl GateState {
    /// Maps one tenant-state record.
    fn from_observation(t: &TenantState) -> Self {
        if t.observation.state == ObservationState::Blocked {
            GateState::Blocked
        } else if t.execution.has_executed {
            GateState::Executed
        } else if t.authorization.approved {
            GateState::ApprovedUnexecuted
        } else {
            match t.observation.state {
                ObservationState::Cleared => GateState::Cleared,
                ObservationState::Observed => GateState::Observed,
                _ => GateState::PendingApproval,
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Unknown => "unknown",
            GateState::PendingApproval => "pending_approval",
            GateState::Blocked => "blocked",
            GateState::Cleared => "cleared",
            GateState::Observed => "observed",
            GateState::ApprovedUnexecuted => "approved_unexecuted",
            GateState::Executed => "executed",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the gate state of every tenant the console has seen.
///
/// Tenant-state snapshots are the source of truth and overwrite whatever
/// was recorded from local actions; the recorded transitions only bridge
/// the gap until the next snapshot arrives.
#[derive(Debug, Default)]
pub struct TenantLedger {
    states: HashMap<String, GateState>,
    /// Unsigned inbox submissions present in the last inbox snapshot.
    submissions: HashSet<String>,
}

impl TenantLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, tenant: &str) -> GateState {
        self.states
            .get(tenant)
            .copied()
            .unwrap_or(GateState::Unknown)
    }

    fn set(&mut self, tenant: &str, next: GateState) {
        let prev = self.state(tenant);
        if prev != next {
            debug!("Tenant {tenant}: {prev} -> {next}");
        }
        self.states.insert(tenant.to_string(), next);
    }

    /// Applies a fresh tenant-state snapshot. Tenants that vanished are
    /// forgotten, except blocked ones which stay visible as such.
    pub fn observe_tenants(&mut self, tenants: &[TenantState]) {
        let present: HashSet<&str> = tenants.iter().map(|t| t.name.as_str()).collect();
        self.states
            .retain(|name, state| present.contains(name.as_str()) || *state == GateState::Blocked);

        for t in tenants {
            self.set(&t.name, GateState::from_observation(t));
        }
    }

    /// Applies a fresh inbox snapshot: every unsigned submission not
    /// present last time re-opens the gate for its tenant.
    pub fn observe_inbox(&mut self, entries: &[InboxEntry]) {
        let pending: HashSet<String> = entries
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.tenant.clone())
            .collect();

        let arrived: Vec<String> = pending.difference(&self.submissions).cloned().collect();
        for tenant in &arrived {
            self.set(tenant, GateState::PendingApproval);
        }
        self.submissions = pending;
    }

    pub fn record_approved(&mut self, tenant: &str) {
        self.set(tenant, GateState::ApprovedUnexecuted);
    }

    pub fn record_rejected(&mut self, tenant: &str) {
        self.set(tenant, GateState::Blocked);
    }

    /// A fleet run finished: every approved tenant has now executed.
    /// Not for single-tenant runs, which leave the others unexecuted.
    pub fn record_run_completed(&mut self) {
        for state in self.states.values_mut() {
            if *state == GateState::ApprovedUnexecuted {
                *state = GateState::Executed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::tenant::sample;

    fn inbox(tenant: &str, signed: bool) -> InboxEntry {
        InboxEntry {
            tenant: tenant.to_string(),
            signed,
            timestamp: "unknown".to_string(),
            path: format!("worker://modules/{tenant}"),
        }
    }

    // ── can_run ─────────────────────────────────────────

    #[test]
    fn test_can_run_empty_fleet_is_granted() {
        assert_eq!(can_run(&[]), GateDecision::Granted);
    }

    #[test]
    fn test_can_run_all_approved_or_executed() {
        let fleet = vec![
            sample("a", true, false),
            sample("b", true, true),
            // Executed without approval (policy did not require one)
            sample("c", false, true),
        ];
        assert!(can_run(&fleet).is_granted());
    }

    #[test]
    fn test_one_unapproved_tenant_blocks_everything() {
        let fleet = vec![
            sample("a", true, true),
            sample("b", false, false),
            sample("c", true, false),
        ];
        assert_eq!(
            can_run(&fleet),
            GateDecision::Denied {
                reason: BLOCKED_MESSAGE,
                blocking: vec!["b".to_string()],
            }
        );
    }

    #[test]
    fn test_denial_message_is_stable() {
        let GateDecision::Denied { reason, .. } = can_run(&[sample("x", false, false)]) else {
            panic!("expected denial");
        };
        assert_eq!(reason, "Execution blocked: pending approvals detected");
    }

    // ── command classification ──────────────────────────

    #[test]
    fn test_requires_gate() {
        let args = |s: &[&str]| s.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        assert!(requires_gate(&args(&["run", "--all", "--backend", "wasmtime"])));
        assert!(requires_gate(&args(&["run", "--all", "--proof"])));
        assert!(!requires_gate(&args(&["verify-env"])));
        assert!(!requires_gate(&args(&["export-dashboard"])));
        assert!(!requires_gate(&args(&["inspect-state", "--all-tenants"])));
        assert!(!requires_gate(&[]));
    }

    #[test]
    fn test_is_fleet_run() {
        let args = |s: &[&str]| s.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        assert!(is_fleet_run(&fleet_run_args("wasmtime", false)));
        assert!(is_fleet_run(&fleet_run_args("wasmtime", true)));
        assert!(!is_fleet_run(&args(&["run", "--tenant", "a"])));
        assert!(!is_fleet_run(&args(&["inspect-state", "--all"])));
    }

    #[test]
    fn test_fleet_run_args() {
        assert_eq!(
            fleet_run_args("wasmtime", false),
            vec!["run", "--all", "--backend", "wasmtime"]
        );
        assert_eq!(
            fleet_run_args("firecracker", true),
            vec!["run", "--all", "--proof", "--backend", "firecracker"]
        );
    }

    // ── ledger ──────────────────────────────────────────

    #[test]
    fn test_unknown_to_pending_on_first_observation() {
        let mut ledger = TenantLedger::new();
        assert_eq!(ledger.state("a"), GateState::Unknown);
        ledger.observe_tenants(&[sample("a", false, false)]);
        assert_eq!(ledger.state("a"), GateState::PendingApproval);
    }

    #[test]
    fn test_approve_then_run() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", false, false), sample("b", true, true)]);

        ledger.record_approved("a");
        assert_eq!(ledger.state("a"), GateState::ApprovedUnexecuted);

        ledger.record_run_completed();
        assert_eq!(ledger.state("a"), GateState::Executed);
        assert_eq!(ledger.state("b"), GateState::Executed);
    }

    #[test]
    fn test_reject_blocks_and_survives_disappearance() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", false, false), sample("b", true, false)]);
        ledger.record_rejected("a");
        assert_eq!(ledger.state("a"), GateState::Blocked);

        // Rejected module is gone from the next snapshot
        ledger.observe_tenants(&[sample("b", true, false)]);
        assert_eq!(ledger.state("a"), GateState::Blocked);
    }

    #[test]
    fn test_vanished_tenants_are_forgotten() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", true, true)]);
        ledger.observe_tenants(&[]);
        assert_eq!(ledger.state("a"), GateState::Unknown);
    }

    #[test]
    fn test_observation_blocked_wins() {
        let mut t = sample("a", true, true);
        t.observation.state = ObservationState::Blocked;
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[t]);
        assert_eq!(ledger.state("a"), GateState::Blocked);
    }

    #[test]
    fn test_observation_mapping() {
        let mut cleared = sample("cleared", false, false);
        cleared.observation.state = ObservationState::Cleared;
        let mut observed = sample("observed", false, false);
        observed.observation.state = ObservationState::Observed;

        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[
            cleared,
            observed,
            sample("approved", true, false),
            sample("ran", false, true),
        ]);
        assert_eq!(ledger.state("cleared"), GateState::Cleared);
        assert_eq!(ledger.state("observed"), GateState::Observed);
        assert_eq!(ledger.state("approved"), GateState::ApprovedUnexecuted);
        assert_eq!(ledger.state("ran"), GateState::Executed);
    }

    #[test]
    fn test_snapshot_overrides_local_approval() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", false, false)]);
        ledger.record_approved("a");
        // Backend still reports unapproved: backend wins
        ledger.observe_tenants(&[sample("a", false, false)]);
        assert_eq!(ledger.state("a"), GateState::PendingApproval);
    }

    #[test]
    fn test_new_submission_reopens_gate() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", true, true)]);
        assert_eq!(ledger.state("a"), GateState::Executed);

        ledger.observe_inbox(&[inbox("a", false)]);
        assert_eq!(ledger.state("a"), GateState::PendingApproval);
    }

    #[test]
    fn test_same_submission_does_not_reopen_twice() {
        let mut ledger = TenantLedger::new();
        ledger.observe_inbox(&[inbox("a", false)]);
        ledger.record_approved("a");

        // Still listed (stale inbox): not a new submission
        ledger.observe_inbox(&[inbox("a", false)]);
        assert_eq!(ledger.state("a"), GateState::ApprovedUnexecuted);

        // Gone, then submitted again: re-opens
        ledger.observe_inbox(&[]);
        ledger.observe_inbox(&[inbox("a", false)]);
        assert_eq!(ledger.state("a"), GateState::PendingApproval);
    }

    #[test]
    fn test_malformed_tenant_record_is_not_seen_by_gate() {
        // Unknown observation state: the record is dropped at decoding, so
        // this unapproved tenant no longer blocks the fleet
        let payload = serde_json::json!([{
            "id": "a", "name": "a",
            "authorization": {"approved": false},
            "execution": {"has_executed": false},
            "observation": {"state": "quarantined"}
        }]);
        let tenants = crate::guardian::decode_tenant_states(&payload);
        assert!(tenants.is_empty());
        assert_eq!(can_run(&tenants), GateDecision::Granted);
    }

    #[test]
    fn test_signed_submissions_do_not_reopen() {
        let mut ledger = TenantLedger::new();
        ledger.observe_tenants(&[sample("a", true, false)]);
        ledger.observe_inbox(&[inbox("a", true)]);
        assert_eq!(ledger.state("a"), GateState::ApprovedUnexecuted);
    }
}
