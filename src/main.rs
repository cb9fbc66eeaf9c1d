mod backend;
mod config;
mod console;
mod error;
mod guardian;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::Backend;
use crate::config::Config;
use crate::console::{Console, GateDecision, RunOutcome, Snapshot};
use crate::guardian::{classify, Decision};

/// How often the watch loop logs a status line and re-arms the
/// pending-submission reminder.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_CONFIG_PATH: &str = "config/console.toml";

fn print_help() {
    println!(
        "\
guardian-console v{}

Supervises a Guardian worker: polls its decision log, tenant states and
submission inbox, and gates fleet runs on pending approvals.

USAGE:
    guardian-console [OPTIONS] [CONFIG_PATH] [COMMAND]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/console.toml]

COMMANDS:
    (none)                Watch: log new submissions and a periodic status line
    approve <TENANT>      Approve and sign a tenant
    reject <TENANT>       Discard a tenant's submission
    history <TENANT>      Print every recorded decision for a tenant
    run [--proof]         Run every tenant (refused while approvals are pending)
    verify-env [ARGS]     Worker commands passed through as-is, ungated;
    export-dashboard      arguments after them go to the worker
    inspect-state

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
        --once       Fetch every source once, print status and exit
        --proof      With `run`: run in proof mode

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG            Log level filter for tracing
                        (e.g. debug, guardian_console=debug,warn)
    WORKER_API_TOKEN    Bearer token for the worker HTTP API (http backend)

EXAMPLES:
    guardian-console                            # uses config/console.toml
    guardian-console --once                     # one-shot status report
    guardian-console approve tenant-a           # approve one tenant
    guardian-console run --proof                # gated fleet run
    guardian-console /etc/guardian/console.toml # custom config path
    RUST_LOG=debug guardian-console             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// What the console is asked to do once started.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Watch,
    Status,
    Approve(String),
    Reject(String),
    History(String),
    Run { proof: bool },
    /// Ungated worker command with its arguments.
    Worker(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Invocation {
    Help,
    Version,
    Console { config_path: String, command: Command },
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut args = args.into_iter();
    let mut config_path = None;
    let mut command = None;
    let mut once = false;
    let mut proof = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Invocation::Version),
            "--help" | "-h" => return Ok(Invocation::Help),
            "--once" => once = true,
            "--proof" => proof = true,
            "approve" | "reject" | "history" if command.is_none() => {
                let Some(tenant) = args.next() else {
                    anyhow::bail!("{arg} needs a tenant name");
                };
                command = Some(match arg.as_str() {
                    "approve" => Command::Approve(tenant),
                    "reject" => Command::Reject(tenant),
                    _ => Command::History(tenant),
                });
            }
            "run" if command.is_none() => command = Some(Command::Run { proof: false }),
            "verify-env" | "export-dashboard" | "inspect-state" if command.is_none() => {
                // Everything after a worker command belongs to the worker
                let mut worker_args = vec![arg.clone()];
                worker_args.extend(args.by_ref());
                command = Some(Command::Worker(worker_args));
            }
            flag if flag.starts_with('-') => anyhow::bail!("Unknown option: {flag}"),
            _ if config_path.is_none() => config_path = Some(arg.clone()),
            _ => anyhow::bail!("Unexpected argument: {arg}"),
        }
    }

    if proof && !matches!(command, Some(Command::Run { .. })) {
        anyhow::bail!("--proof only applies to `run`");
    }

    let command = match (command, once) {
        (None, false) => Command::Watch,
        (None, true) => Command::Status,
        (Some(Command::Run { .. }), false) => Command::Run { proof },
        (Some(command), false) => command,
        (Some(_), true) => anyhow::bail!("--once cannot be combined with a command"),
    };

    Ok(Invocation::Console {
        config_path: config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
        command,
    })
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn print_source<T>(source: &str, snapshot: &Snapshot<T>) {
    let last = snapshot
        .fetched_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  {source:<10} {} item(s), {} update(s), last success {last}",
        snapshot.items.len(),
        snapshot.generation
    );
    if !snapshot.loaded {
        println!("             not loaded yet");
    }
    if let Some(error) = &snapshot.last_error {
        println!("             last fetch failed: {error}");
    }
}

/// One-shot report of everything the console currently knows.
fn print_status(console: &Console) {
    let summary = console.risk_summary();
    println!("Backend: {}", console.backend_description());
    println!(
        "Decisions: {} tenant(s), {} allowed, {} denied, {} quarantined, compliance {}%",
        summary.total,
        summary.allowed,
        summary.denied,
        summary.quarantined,
        summary.compliance_percent()
    );
    println!("Insight: {}", summary.insight());
    if let Some(last) = &summary.last_decision {
        println!("Last decision: {} at {}", last.tenant, last.timestamp.raw);
    }

    for d in console.latest_decisions() {
        println!(
            "  {:<24} {:<5} score {:>3} ({})  {}",
            d.tenant,
            d.verdict.as_str(),
            d.threat_score,
            classify(d.threat_score),
            d.timestamp.raw
        );
    }

    let tenants = console.tenant_states();
    println!("Tenants: {}", tenants.len());
    for t in tenants.iter() {
        let score = t
            .observation
            .current_threat_score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<20} score {score:>3}  id {}",
            t.name,
            console.gate_state(&t.name).as_str(),
            t.id
        );
        if let (Some(at), Some(by)) = (&t.authorization.approved_at, &t.authorization.approved_by) {
            println!("    approved by {by} at {at}");
        }
        if let Some(at) = &t.execution.last_execution_time {
            println!("    last run {at}");
        }
    }

    for t in console.pending_approvals() {
        println!(
            "Awaiting approval: {} (via {} from {}, {})",
            t.name, t.ingestion.channel, t.ingestion.source, t.ingestion.timestamp
        );
    }

    let inbox = console.inbox();
    let pending = inbox.iter().filter(|e| e.is_pending()).count();
    println!("Inbox: {} submission(s), {pending} awaiting approval", inbox.len());
    for e in inbox.iter() {
        let signed = if e.signed { "signed" } else { "unsigned" };
        println!("  {:<24} {signed:<8} {}  {}", e.tenant, e.timestamp, e.path);
    }

    match console.can_run() {
        GateDecision::Granted => println!("Fleet run: allowed"),
        GateDecision::Denied { reason, blocking } if blocking.is_empty() => {
            println!("Fleet run: {reason}")
        }
        GateDecision::Denied { reason, blocking } => {
            println!("Fleet run: {reason} ({})", blocking.join(", "))
        }
    }

    println!("Sources:");
    print_source("decisions", &console.decisions_snapshot());
    print_source("tenants", &console.tenants_snapshot());
    print_source("inbox", &console.inbox_snapshot());
}

fn print_decision(d: &Decision) {
    println!(
        "{}  {:<5} score {:>3} ({})  backend {} ({})",
        d.timestamp.raw,
        d.verdict.as_str(),
        d.threat_score,
        classify(d.threat_score),
        d.backend,
        if d.backend_allowed { "allowed" } else { "refused" }
    );
    if !d.reason.is_empty() {
        println!("    reason: {}", d.reason);
    }
    println!(
        "    fs {} net {}  first seen {} known hash {} trusted signer {}",
        yes_no(d.capabilities.filesystem),
        yes_no(d.capabilities.network),
        yes_no(d.provenance.first_seen),
        yes_no(d.provenance.known_hash),
        yes_no(d.provenance.trusted_signer)
    );
    let details = &d.details;
    if !details.sha256.is_empty() || !details.threat_label.is_empty() {
        println!("    sha256 {}  label {}", details.sha256, details.threat_label);
    }
    println!(
        "    proof {} policy {}  {} bytes, {} MB, {} ms",
        yes_no(details.proof_mode),
        yes_no(details.policy_exists),
        details.wasm_size_bytes,
        details.memory_request_mb,
        details.runtime_request_ms
    );
    if !details.wasi_imports.is_empty() {
        println!("    imports: {}", details.wasi_imports.join(", "));
    }
}

fn print_history(console: &Console, tenant: &str) {
    let history = console.decision_history(tenant);
    if history.is_empty() {
        println!("No decisions recorded for {tenant}");
        return;
    }
    println!("{} decision(s) for {tenant}, newest first:", history.len());
    for d in &history {
        print_decision(d);
    }
}

fn report_outcome(outcome: RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed { output } => {
            print!("{output}");
            if !output.is_empty() && !output.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        RunOutcome::Blocked { reason, blocking } => {
            if !blocking.is_empty() {
                eprintln!("Awaiting approval: {}", blocking.join(", "));
            }
            anyhow::bail!("{reason}")
        }
    }
}

async fn approve(console: &Console, tenant: &str) -> Result<()> {
    match console.latest_decision_for(tenant) {
        Some(d) => println!(
            "Last decision for {tenant}: {} score {} ({}) at {}",
            d.verdict.as_str(),
            d.threat_score,
            classify(d.threat_score),
            d.timestamp.raw
        ),
        None => println!("No decision recorded for {tenant} yet"),
    }

    match console.approve(tenant).await {
        Ok(()) => {
            println!("Approved {tenant} ({})", console.gate_state(tenant));
            if console.can_run().is_granted() {
                println!("No approvals pending, fleet run allowed");
            }
            Ok(())
        }
        Err(e) if e.is_already_resolved() => {
            println!("{e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn reject(console: &Console, tenant: &str) -> Result<()> {
    match console.reject(tenant).await {
        Ok(()) => {
            println!("Rejected {tenant}");
            Ok(())
        }
        Err(e) if e.is_already_resolved() => {
            println!("{e} (already resolved)");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn watch(console: &Console) -> Result<()> {
    let mut pending = console.subscribe_pending();
    let mut last_fired = 0;
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    // The first tick completes immediately; wait for data instead
    status.tick().await;

    loop {
        tokio::select! {
            changed = pending.changed() => {
                if changed.is_err() {
                    warn!("Notifier closed, exiting");
                    return Ok(());
                }
                let notice = *pending.borrow_and_update();
                if notice.visible && notice.fired > last_fired {
                    last_fired = notice.fired;
                    info!("Submissions awaiting approval: {}", notice.count);
                    for e in console.inbox().iter().filter(|e| e.is_pending()) {
                        info!("  pending: {} ({})", e.tenant, e.timestamp);
                    }
                }
            }
            _ = status.tick() => {
                // Re-arm: the next inbox poll that still has pending
                // submissions logs them again
                if console.pending_notice().visible {
                    console.dismiss_pending();
                }
                let summary = console.risk_summary();
                let gate = match console.can_run() {
                    GateDecision::Granted => "open".to_string(),
                    GateDecision::Denied { reason, blocking } if blocking.is_empty() => {
                        reason.to_string()
                    }
                    GateDecision::Denied { blocking, .. } => {
                        format!("blocked by {} tenant(s)", blocking.len())
                    }
                };
                info!(
                    "{} tenant(s), compliance {}%, max threat {}, gate {gate}",
                    summary.total,
                    summary.compliance_percent(),
                    summary.max_threat
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
        }
    }
}

async fn execute(console: &Console, command: Command) -> Result<()> {
    match command {
        Command::Watch => watch(console).await,
        Command::Status => {
            console.refresh_all().await;
            print_status(console);
            Ok(())
        }
        Command::History(tenant) => {
            console.refresh_all().await;
            print_history(console, &tenant);
            Ok(())
        }
        Command::Approve(tenant) => {
            console.refresh_all().await;
            approve(console, &tenant).await
        }
        Command::Reject(tenant) => {
            console.refresh_all().await;
            reject(console, &tenant).await
        }
        Command::Run { proof } => {
            console.refresh_all().await;
            report_outcome(console.run_fleet(proof).await?)
        }
        Command::Worker(args) => report_outcome(console.run_command(args).await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    let (config_path, command) = match parse_args(std::env::args().skip(1))? {
        Invocation::Version => {
            println!("guardian-console v{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Invocation::Help => {
            print_help();
            std::process::exit(0);
        }
        Invocation::Console {
            config_path,
            command,
        } => (config_path, command),
    };

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("guardian_console=info")),
        )
        .init();

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("Cannot load configuration from {config_path}"))?;

    info!("Backend: {}", config.backend.description());
    info!("Execution backend: {}", config.execution.backend);
    info!(
        "Polling: decisions {}ms, tenants {}ms, inbox {}ms",
        config.polling.decisions_ms, config.polling.tenants_ms, config.polling.inbox_ms
    );

    let backend: Arc<dyn Backend> = backend::from_config(&config.backend)?.into();
    let console = Console::start(backend, &config.polling, config.execution.backend.clone());

    let result = execute(&console, command).await;
    console.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    fn console_command(args: &[&str]) -> (String, Command) {
        match parse(args).unwrap() {
            Invocation::Console {
                config_path,
                command,
            } => (config_path, command),
            other => panic!("unexpected invocation: {other:?}"),
        }
    }

    #[test]
    fn test_no_args_watches_with_default_config() {
        assert_eq!(
            console_command(&[]),
            (DEFAULT_CONFIG_PATH.to_string(), Command::Watch)
        );
    }

    #[test]
    fn test_once_is_status() {
        assert_eq!(
            console_command(&["--once", "/etc/guardian.toml"]),
            ("/etc/guardian.toml".to_string(), Command::Status)
        );
    }

    #[test]
    fn test_help_and_version_win() {
        assert_eq!(parse(&["approve", "a", "--help"]).unwrap(), Invocation::Help);
        assert_eq!(parse(&["-V"]).unwrap(), Invocation::Version);
    }

    #[test]
    fn test_tenant_commands() {
        assert_eq!(
            console_command(&["approve", "tenant-a"]).1,
            Command::Approve("tenant-a".to_string())
        );
        assert_eq!(
            console_command(&["cfg.toml", "reject", "tenant-b"]),
            ("cfg.toml".to_string(), Command::Reject("tenant-b".to_string()))
        );
        assert_eq!(
            console_command(&["history", "tenant-c", "cfg.toml"]),
            ("cfg.toml".to_string(), Command::History("tenant-c".to_string()))
        );
    }

    #[test]
    fn test_tenant_command_needs_a_name() {
        let err = parse(&["approve"]).unwrap_err();
        assert!(err.to_string().contains("approve needs a tenant name"));
    }

    #[test]
    fn test_run_with_and_without_proof() {
        assert_eq!(console_command(&["run"]).1, Command::Run { proof: false });
        assert_eq!(
            console_command(&["run", "--proof"]).1,
            Command::Run { proof: true }
        );
        assert_eq!(
            console_command(&["--proof", "run"]).1,
            Command::Run { proof: true }
        );
    }

    #[test]
    fn test_proof_requires_run() {
        assert!(parse(&["--proof"]).is_err());
        assert!(parse(&["approve", "a", "--proof"]).is_err());
    }

    #[test]
    fn test_worker_commands_take_remaining_args() {
        assert_eq!(
            console_command(&["cfg.toml", "inspect-state", "--all-tenants"]),
            (
                "cfg.toml".to_string(),
                Command::Worker(vec![
                    "inspect-state".to_string(),
                    "--all-tenants".to_string()
                ])
            )
        );
        assert_eq!(
            console_command(&["verify-env"]).1,
            Command::Worker(vec!["verify-env".to_string()])
        );
        assert_eq!(
            console_command(&["export-dashboard"]).1,
            Command::Worker(vec!["export-dashboard".to_string()])
        );
    }

    #[test]
    fn test_once_conflicts_with_commands() {
        assert!(parse(&["--once", "run"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_and_extra_args() {
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["a.toml", "b.toml"]).is_err());
        assert!(parse(&["approve", "a", "reject", "b"]).is_err());
    }

    #[test]
    fn test_blocked_outcome_is_an_error() {
        let err = report_outcome(RunOutcome::Blocked {
            reason: console::gate::BLOCKED_MESSAGE,
            blocking: vec!["a".to_string()],
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Execution blocked: pending approvals detected");

        assert!(report_outcome(RunOutcome::Completed {
            output: "done\n".to_string()
        })
        .is_ok());
    }
}
