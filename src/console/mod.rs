//! The console core: three pollers, the authorization gate and the
//! pending-items notifier behind one facade.
//!
//! Views only read snapshots and call the action methods. Actions wait for
//! the backend round-trip and then for the affected pollers to re-fetch,
//! so the state a caller sees afterwards always comes from the backend.

pub mod gate;
pub mod notifier;
pub mod poller;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::PollingConfig;
use crate::error::{ActionError, FetchError};
use crate::guardian::{
    self, history_for, latest_for, latest_per_tenant, Decision, InboxEntry, RiskSummary,
    TenantState,
};

pub use gate::{GateDecision, GateState, TenantLedger};
pub use notifier::{PendingNotice, PendingNotifier};
pub use poller::{PollerHandle, Snapshot, Source};

// ── Sources ─────────────────────────────────────────────

struct DecisionSource(Arc<dyn Backend>);
struct TenantSource(Arc<dyn Backend>);
struct InboxSource(Arc<dyn Backend>);

#[async_trait]
impl Source for DecisionSource {
    type Item = Decision;

    fn name(&self) -> &'static str {
        "decisions"
    }

    async fn fetch(&self) -> Result<Vec<Decision>, FetchError> {
        Ok(guardian::decode_decisions(&self.0.fetch_decisions().await?))
    }
}

#[async_trait]
impl Source for TenantSource {
    type Item = TenantState;

    fn name(&self) -> &'static str {
        "tenants"
    }

    async fn fetch(&self) -> Result<Vec<TenantState>, FetchError> {
        Ok(guardian::decode_tenant_states(
            &self.0.fetch_tenant_states().await?,
        ))
    }
}

#[async_trait]
impl Source for InboxSource {
    type Item = InboxEntry;

    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn fetch(&self) -> Result<Vec<InboxEntry>, FetchError> {
        Ok(guardian::decode_inbox(&self.0.fetch_inbox().await?))
    }
}

// ── Console ─────────────────────────────────────────────

/// Result of a command that reached the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Dispatched to the backend; worker output.
    Completed { output: String },
    /// Refused by the gate; nothing was dispatched.
    Blocked {
        reason: &'static str,
        blocking: Vec<String>,
    },
}

pub struct Console {
    backend: Arc<dyn Backend>,
    decisions: PollerHandle<Decision>,
    tenants: PollerHandle<TenantState>,
    inbox: PollerHandle<InboxEntry>,
    ledger: Arc<Mutex<TenantLedger>>,
    notifier: Arc<PendingNotifier>,
    /// Sandbox backend passed to fleet runs.
    execution_backend: String,
    /// One user action at a time.
    actions: tokio::sync::Mutex<()>,
}

impl Console {
    /// Starts the pollers. Must be called inside a tokio runtime.
    pub fn start(
        backend: Arc<dyn Backend>,
        polling: &PollingConfig,
        execution_backend: impl Into<String>,
    ) -> Self {
        let ledger = Arc::new(Mutex::new(TenantLedger::new()));
        let notifier = Arc::new(PendingNotifier::new());

        let tenant_ledger = ledger.clone();
        let tenant_hook: poller::Hook<TenantState> = Box::new(move |tenants| {
            tenant_ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe_tenants(tenants);
        });

        let inbox_ledger = ledger.clone();
        let inbox_notifier = notifier.clone();
        let inbox_hook: poller::Hook<InboxEntry> = Box::new(move |entries| {
            let pending = entries.iter().filter(|e| e.is_pending()).count();
            inbox_notifier.observe(pending);
            inbox_ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe_inbox(entries);
        });

        let decisions = poller::spawn(
            Arc::new(DecisionSource(backend.clone())),
            polling.decisions_interval(),
            None,
        );
        let tenants = poller::spawn(
            Arc::new(TenantSource(backend.clone())),
            polling.tenants_interval(),
            Some(tenant_hook),
        );
        let inbox = poller::spawn(
            Arc::new(InboxSource(backend.clone())),
            polling.inbox_interval(),
            Some(inbox_hook),
        );

        info!("Console started against {}", backend.description());

        Self {
            backend,
            decisions,
            tenants,
            inbox,
            ledger,
            notifier,
            execution_backend: execution_backend.into(),
            actions: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend_description(&self) -> String {
        self.backend.description()
    }

    // ── Decisions ───────────────────────────────────────

    pub fn decisions_snapshot(&self) -> Snapshot<Decision> {
        self.decisions.snapshot()
    }

    /// Most recent decision per tenant, newest first.
    pub fn latest_decisions(&self) -> Vec<Decision> {
        latest_per_tenant(&self.decisions.snapshot().items)
    }

    pub fn latest_decision_for(&self, tenant: &str) -> Option<Decision> {
        latest_for(&self.decisions.snapshot().items, tenant).cloned()
    }

    /// Every decision for one tenant, newest first.
    pub fn decision_history(&self, tenant: &str) -> Vec<Decision> {
        let snapshot = self.decisions.snapshot();
        history_for(&snapshot.items, tenant)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn risk_summary(&self) -> RiskSummary {
        RiskSummary::from_latest(&self.latest_decisions())
    }

    // ── Tenants & inbox ─────────────────────────────────

    pub fn tenants_snapshot(&self) -> Snapshot<TenantState> {
        self.tenants.snapshot()
    }

    pub fn tenant_states(&self) -> Arc<Vec<TenantState>> {
        self.tenants.snapshot().items
    }

    /// Tenants that are unapproved and have never run.
    pub fn pending_approvals(&self) -> Vec<TenantState> {
        self.tenant_states()
            .iter()
            .filter(|t| t.is_awaiting_approval())
            .cloned()
            .collect()
    }

    pub fn inbox_snapshot(&self) -> Snapshot<InboxEntry> {
        self.inbox.snapshot()
    }

    pub fn inbox(&self) -> Arc<Vec<InboxEntry>> {
        self.inbox.snapshot().items
    }

    pub fn gate_state(&self, tenant: &str) -> GateState {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state(tenant)
    }

    /// Gate check over the current tenant-state snapshot. Denied until the
    /// first snapshot has loaded.
    pub fn can_run(&self) -> GateDecision {
        let snapshot = self.tenants.snapshot();
        if !snapshot.loaded {
            return GateDecision::Denied {
                reason: gate::NOT_LOADED_MESSAGE,
                blocking: Vec::new(),
            };
        }
        gate::can_run(&snapshot.items)
    }

    // ── Notifications ───────────────────────────────────

    pub fn subscribe_pending(&self) -> watch::Receiver<PendingNotice> {
        self.notifier.subscribe()
    }

    pub fn pending_notice(&self) -> PendingNotice {
        self.notifier.current()
    }

    pub fn dismiss_pending(&self) {
        self.notifier.dismiss();
    }

    // ── Actions ─────────────────────────────────────────

    /// Runs a worker command. `run` goes through the gate; everything else
    /// is dispatched directly.
    pub async fn run_command(&self, args: Vec<String>) -> Result<RunOutcome, ActionError> {
        let _guard = self.actions.lock().await;
        let gated = gate::requires_gate(&args);

        if gated {
            if let GateDecision::Denied { reason, blocking } = self.can_run() {
                warn!("{reason}: {}", blocking.join(", "));
                return Ok(RunOutcome::Blocked { reason, blocking });
            }
        }

        info!("Dispatching: {}", args.join(" "));
        let output = self.backend.run_command(&args).await.inspect_err(|e| {
            warn!("Command {} failed: {e}", args.join(" "));
        })?;

        if gated {
            if gate::is_fleet_run(&args) {
                self.ledger
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_run_completed();
            }
            tokio::join!(
                self.decisions.refresh_and_wait(),
                self.tenants.refresh_and_wait(),
            );
        }

        Ok(RunOutcome::Completed { output })
    }

    /// `run --all [--proof] --backend <configured backend>`
    pub async fn run_fleet(&self, proof: bool) -> Result<RunOutcome, ActionError> {
        self.run_command(gate::fleet_run_args(&self.execution_backend, proof))
            .await
    }

    /// Approves and signs one tenant. Fails with `AlreadyApproved`, without
    /// contacting the backend, if the latest snapshot shows it approved.
    pub async fn approve(&self, tenant: &str) -> Result<(), ActionError> {
        let _guard = self.actions.lock().await;

        let already = self
            .tenant_states()
            .iter()
            .any(|t| t.name == tenant && t.authorization.approved);
        if already {
            return Err(ActionError::AlreadyApproved {
                tenant: tenant.to_string(),
            });
        }

        self.backend
            .approve_tenant(tenant)
            .await
            .inspect_err(|e| warn!("Approve {tenant}: {e}"))?;

        info!("Approved {tenant}");
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_approved(tenant);
        tokio::join!(
            self.decisions.refresh_and_wait(),
            self.tenants.refresh_and_wait(),
            self.inbox.refresh_and_wait(),
        );
        Ok(())
    }

    /// Discards a submission. `NotFound` means it was already resolved;
    /// the views are re-fetched either way.
    pub async fn reject(&self, tenant: &str) -> Result<(), ActionError> {
        let _guard = self.actions.lock().await;

        let result = self.backend.reject_tenant(tenant).await;
        match &result {
            Ok(()) => {
                info!("Rejected {tenant}");
                self.ledger
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_rejected(tenant);
            }
            Err(e) if e.is_already_resolved() => info!("Reject {tenant}: {e}"),
            Err(e) => {
                warn!("Reject {tenant}: {e}");
                return result;
            }
        }

        tokio::join!(
            self.inbox.refresh_and_wait(),
            self.tenants.refresh_and_wait(),
        );
        result
    }

    // ── Lifecycle ───────────────────────────────────────

    /// Fetches every source once more and waits for the results.
    pub async fn refresh_all(&self) {
        tokio::join!(
            self.decisions.refresh_and_wait(),
            self.tenants.refresh_and_wait(),
            self.inbox.refresh_and_wait(),
        );
    }

    pub async fn shutdown(self) {
        tokio::join!(
            self.decisions.stop(),
            self.tenants.stop(),
            self.inbox.stop(),
        );
        info!("Console stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::tenant::sample;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory worker. Approve/reject mutate the tenant list the way a
    /// real worker would, so re-fetches observe the change.
    #[derive(Default)]
    struct FakeBackend {
        tenants: Mutex<Vec<TenantState>>,
        inbox: Mutex<Vec<InboxEntry>>,
        decisions: Mutex<Value>,
        fail_approve: bool,
        fail_fetch: bool,
        /// Tenant fetches read the state first, then take this long.
        tenant_fetch_delay: Duration,
        approve_calls: AtomicUsize,
        reject_calls: AtomicUsize,
        run_calls: AtomicUsize,
    }

    impl FakeBackend {
        fn with_tenants(tenants: Vec<TenantState>) -> Self {
            Self {
                tenants: Mutex::new(tenants),
                decisions: Mutex::new(json!([])),
                ..Default::default()
            }
        }

        fn unavailable(&self, source_name: &'static str) -> FetchError {
            FetchError::Unavailable {
                source_name,
                message: "down".to_string(),
            }
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn fetch_decisions(&self) -> Result<Value, FetchError> {
            if self.fail_fetch {
                return Err(self.unavailable("decisions"));
            }
            Ok(self.decisions.lock().unwrap().clone())
        }

        async fn fetch_tenant_states(&self) -> Result<Value, FetchError> {
            if self.fail_fetch {
                return Err(self.unavailable("tenants"));
            }
            let value = serde_json::to_value(&*self.tenants.lock().unwrap()).unwrap();
            if !self.tenant_fetch_delay.is_zero() {
                tokio::time::sleep(self.tenant_fetch_delay).await;
            }
            Ok(value)
        }

        async fn fetch_inbox(&self) -> Result<Value, FetchError> {
            if self.fail_fetch {
                return Err(self.unavailable("inbox"));
            }
            Ok(serde_json::to_value(&*self.inbox.lock().unwrap()).unwrap())
        }

        async fn approve_tenant(&self, tenant: &str) -> Result<(), ActionError> {
            self.approve_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_approve {
                return Err(ActionError::Backend {
                    action: "approve",
                    message: "Signing key missing at keys/maintainers/admin1.key".to_string(),
                });
            }
            let mut tenants = self.tenants.lock().unwrap();
            let t = tenants
                .iter_mut()
                .find(|t| t.name == tenant)
                .ok_or_else(|| ActionError::NotFound {
                    tenant: tenant.to_string(),
                })?;
            t.authorization.approved = true;
            self.inbox.lock().unwrap().retain(|e| e.tenant != tenant);
            Ok(())
        }

        async fn reject_tenant(&self, tenant: &str) -> Result<(), ActionError> {
            self.reject_calls.fetch_add(1, Ordering::SeqCst);
            let mut tenants = self.tenants.lock().unwrap();
            let before = tenants.len();
            tenants.retain(|t| t.name != tenant);
            self.inbox.lock().unwrap().retain(|e| e.tenant != tenant);
            if tenants.len() == before {
                return Err(ActionError::NotFound {
                    tenant: tenant.to_string(),
                });
            }
            Ok(())
        }

        async fn run_command(&self, args: &[String]) -> Result<String, ActionError> {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            if gate::is_fleet_run(args) {
                for t in self.tenants.lock().unwrap().iter_mut() {
                    t.execution.has_executed = true;
                }
            }
            Ok(format!("ran {}", args.join(" ")))
        }

        fn description(&self) -> String {
            "fake".to_string()
        }
    }

    fn inbox_entry(tenant: &str) -> InboxEntry {
        InboxEntry {
            tenant: tenant.to_string(),
            signed: false,
            timestamp: "2025-01-10T12:00:00Z".to_string(),
            path: format!("worker://modules/{tenant}"),
        }
    }

    async fn start(backend: Arc<FakeBackend>) -> Console {
        let console = Console::start(backend, &PollingConfig::default(), "wasmtime");
        console.refresh_all().await;
        console
    }

    // ── Gate ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_denied_run_is_never_dispatched() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![
            sample("a", true, false),
            sample("b", false, false),
        ]));
        let console = start(backend.clone()).await;

        let outcome = console.run_fleet(false).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Blocked {
                reason: gate::BLOCKED_MESSAGE,
                blocking: vec!["b".to_string()],
            }
        );
        assert_eq!(backend.run_calls.load(Ordering::SeqCst), 0);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_denied_before_first_load() {
        let backend = Arc::new(FakeBackend {
            fail_fetch: true,
            ..Default::default()
        });
        let console = start(backend.clone()).await;

        let GateDecision::Denied { reason, .. } = console.can_run() else {
            panic!("expected denial");
        };
        assert_eq!(reason, gate::NOT_LOADED_MESSAGE);
        assert!(console.tenants_snapshot().last_error.is_some());

        console.run_fleet(true).await.unwrap();
        assert_eq!(backend.run_calls.load(Ordering::SeqCst), 0);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_run_commands_bypass_gate() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![sample("b", false, false)]));
        let console = start(backend.clone()).await;

        let outcome = console
            .run_command(vec!["verify-env".to_string()])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                output: "ran verify-env".to_string()
            }
        );
        assert_eq!(backend.run_calls.load(Ordering::SeqCst), 1);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_fleet_run_uses_configured_backend() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![sample("a", true, false)]));
        let console = start(backend.clone()).await;
        assert_eq!(console.gate_state("a"), GateState::ApprovedUnexecuted);

        let outcome = console.run_fleet(true).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                output: "ran run --all --proof --backend wasmtime".to_string()
            }
        );
        assert_eq!(console.gate_state("a"), GateState::Executed);
        assert!(console.tenant_states()[0].execution.has_executed);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_tenant_run_leaves_others_unexecuted() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![
            sample("a", true, false),
            sample("b", true, false),
        ]));
        let console = start(backend.clone()).await;

        let args = ["run", "--tenant", "a"].map(String::from).to_vec();
        let outcome = console.run_command(args).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(backend.run_calls.load(Ordering::SeqCst), 1);
        assert_eq!(console.gate_state("a"), GateState::ApprovedUnexecuted);
        assert_eq!(console.gate_state("b"), GateState::ApprovedUnexecuted);
        console.shutdown().await;
    }

    // ── Approve / reject ────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_approve_unblocks_fleet() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![sample("a", false, false)]));
        let console = start(backend.clone()).await;
        assert_eq!(console.pending_approvals().len(), 1);
        assert!(!console.can_run().is_granted());

        console.approve("a").await.unwrap();
        assert_eq!(backend.approve_calls.load(Ordering::SeqCst), 1);
        assert!(console.pending_approvals().is_empty());
        assert!(console.can_run().is_granted());
        assert_eq!(console.gate_state("a"), GateState::ApprovedUnexecuted);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_during_tenant_fetch_waits_for_fresh_state() {
        let backend = Arc::new(FakeBackend {
            tenant_fetch_delay: Duration::from_secs(2),
            ..FakeBackend::with_tenants(vec![sample("a", false, false)])
        });
        let console = start(backend.clone()).await;

        // A poll that read the backend before the approval is still running
        console.tenants.refresh();
        let mut rx = console.tenants.subscribe();
        rx.wait_for(|s| s.dispatched > s.attempts).await.unwrap();

        console.approve("a").await.unwrap();
        assert!(console.tenant_states()[0].authorization.approved);
        assert!(console.can_run().is_granted());
        assert_eq!(console.gate_state("a"), GateState::ApprovedUnexecuted);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_already_approved_skips_backend() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![sample("a", true, false)]));
        let console = start(backend.clone()).await;

        let err = console.approve("a").await.unwrap_err();
        assert_eq!(
            err,
            ActionError::AlreadyApproved {
                tenant: "a".to_string()
            }
        );
        assert!(err.is_already_resolved());
        assert_eq!(backend.approve_calls.load(Ordering::SeqCst), 0);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_approve_leaves_state_unchanged() {
        let backend = Arc::new(FakeBackend {
            fail_approve: true,
            ..FakeBackend::with_tenants(vec![sample("a", false, false)])
        });
        let console = start(backend.clone()).await;

        let err = console.approve("a").await.unwrap_err();
        assert!(err.to_string().contains("Signing key missing"));
        assert_eq!(console.gate_state("a"), GateState::PendingApproval);
        assert!(!console.tenant_states()[0].authorization.approved);
        assert!(!console.can_run().is_granted());
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_twice_is_already_resolved() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![
            sample("a", false, false),
            sample("b", true, true),
        ]));
        *backend.inbox.lock().unwrap() = vec![inbox_entry("a")];
        let console = start(backend.clone()).await;
        assert_eq!(console.inbox().len(), 1);

        console.reject("a").await.unwrap();
        assert!(console.inbox().is_empty());
        assert_eq!(console.gate_state("a"), GateState::Blocked);
        assert!(console.can_run().is_granted());

        let err = console.reject("a").await.unwrap_err();
        assert!(err.is_already_resolved());
        assert_eq!(backend.reject_calls.load(Ordering::SeqCst), 2);
        console.shutdown().await;
    }

    // ── Views ───────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_decision_views() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![]));
        *backend.decisions.lock().unwrap() = json!([
            {"timestamp": "2025-01-10T12:00:00Z", "tenant": "a", "decision": "deny", "threat_score": 90},
            {"timestamp": "2025-01-10T13:00:00Z", "tenant": "a", "decision": "allow", "threat_score": 10},
            {"timestamp": "2025-01-10T11:00:00Z", "tenant": "b", "decision": "allow", "threat_score": 30},
            {"tenant": "broken"}
        ]);
        let console = start(backend).await;

        let latest = console.latest_decisions();
        let tenants: Vec<&str> = latest.iter().map(|d| d.tenant.as_str()).collect();
        assert_eq!(tenants, vec!["a", "b"]);
        assert_eq!(console.decision_history("a").len(), 2);

        let summary = console.risk_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.quarantined, 0);
        assert_eq!(summary.compliance_percent(), 100);
        console.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbox_arrival_notifies() {
        let backend = Arc::new(FakeBackend::with_tenants(vec![sample("a", true, true)]));
        let console = start(backend.clone()).await;
        assert!(!console.pending_notice().visible);
        let mut rx = console.subscribe_pending();

        backend.inbox.lock().unwrap().push(inbox_entry("a"));
        console.refresh_all().await;

        assert!(rx.has_changed().unwrap());
        let notice = *rx.borrow_and_update();
        assert!(notice.visible);
        assert_eq!(notice.count, 1);
        assert_eq!(notice.fired, 1);

        // Still pending on the next poll: no second notification
        console.refresh_all().await;
        assert_eq!(console.pending_notice().fired, 1);

        console.dismiss_pending();
        assert!(!console.pending_notice().visible);
        console.shutdown().await;
    }
}
