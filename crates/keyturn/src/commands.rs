//! Subcommand handlers.

use std::sync::Arc;
use std::time::Duration;

use keyturn_agent::backoff::RetryConfig;
use keyturn_agent::{bootstrap_identity, idfile, Agent, AgentConfig, HttpControlPlane};
use keyturn_rotation::protocol::RotateRequest;
use keyturn_rotation::{CaType, Phase, RotationConfig, RotationCore, RotationMode, RotationState};
use tokio_util::sync::CancellationToken;

use crate::cli::{AgentArgs, BootstrapSpec, Cli, RotateSubcommand, ServeArgs};
use crate::client::RotationClient;

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

// ── serve ───────────────────────────────────────────────────────────

pub async fn serve(args: &ServeArgs) -> anyhow::Result<()> {
    let mut config = RotationConfig::default()
        .with_grace_period(Duration::from_secs(args.grace_period))
        .with_cert_ttl(Duration::from_secs(args.cert_ttl));
    if !args.no_audit {
        config = config.with_audit_log(keyturn_rotation::audit::default_audit_path());
    }
    let core = RotationCore::new(config)?;
    startup_diagnostics(args, &core);

    for spec in &args.bootstrap {
        let spec: BootstrapSpec = spec.parse().map_err(anyhow::Error::msg)?;
        write_bootstrap_identity(&core, &spec)?;
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    {
        let core = core.clone();
        let port = args.port;
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::start_http(core, port, token).await {
                tracing::error!(error = %e, "HTTP adapter failed");
            }
        }));
    }
    {
        let core = core.clone();
        let interval = Duration::from_secs(args.auto_interval.max(1));
        tasks.push(tokio::spawn(async move {
            core.run_auto_rotation(interval).await;
        }));
    }

    tracing::info!("Ready.");
    crate::shutdown_signal().await;
    tracing::info!("Shutting down...");

    // Ordered shutdown: end watch streams, stop accepting, then drain.
    let shutdown = async {
        core.shutdown();
        cancel.cancel();
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        tracing::warn!("Shutdown timed out after {:?}, forcing exit", SHUTDOWN_TIMEOUT);
    }
    Ok(())
}

fn startup_diagnostics(args: &ServeArgs, core: &RotationCore) {
    tracing::info!("keyturn v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Platform: {}", std::env::consts::OS);
    match hostname::get() {
        Ok(h) => tracing::info!("Hostname: {}", h.to_string_lossy()),
        Err(e) => tracing::warn!(error = %e, "Could not determine hostname"),
    }
    for state in core.states() {
        tracing::info!(
            ca_type = %state.ca_type,
            fingerprint = %state.active.fingerprint,
            "CA ready"
        );
    }
    tracing::info!(
        grace_period_secs = args.grace_period,
        cert_ttl_secs = args.cert_ttl,
        "Rotation policy"
    );
    match core.audit().path() {
        Some(path) => tracing::info!("Audit log: {}", path.display()),
        None => tracing::info!("Audit log: disabled"),
    }
}

fn write_bootstrap_identity(core: &RotationCore, spec: &BootstrapSpec) -> anyhow::Result<()> {
    let config = AgentConfig::new(spec.subject.clone(), spec.role).with_identity_ca(spec.ca_type);
    let response = core.issue_bootstrap_credentials(&spec.subject, spec.role, spec.ca_type)?;
    let identity = bootstrap_identity(&config, response);
    let dir = keyturn_common::paths::keyturn_identity_dir(&spec.subject);
    idfile::write_identity(&dir, &identity)?;
    tracing::info!(
        subject = %spec.subject,
        role = %spec.role,
        ca_type = %spec.ca_type,
        path = %dir.display(),
        "Bootstrap identity written"
    );
    Ok(())
}

// ── agent ───────────────────────────────────────────────────────────

pub async fn agent(cli: &Cli, args: &AgentArgs) -> anyhow::Result<()> {
    let subject = match &args.subject {
        Some(s) => s.clone(),
        None => hostname::get()?.to_string_lossy().into_owned(),
    };
    let identity_dir = args
        .identity_dir
        .clone()
        .unwrap_or_else(|| keyturn_common::paths::keyturn_identity_dir(&subject));
    let trusted = if args.trusted.is_empty() {
        CaType::ALL.to_vec()
    } else {
        args.trusted.clone()
    };

    let config = AgentConfig::new(subject, args.role)
        .with_identity_ca(args.identity_ca)
        .with_trusted_ca_types(trusted)
        .with_renew_fraction(args.renew_fraction)
        .with_retry(RetryConfig::with_max_attempts(args.max_attempts))
        .with_identity_dir(identity_dir);

    let control = HttpControlPlane::new(&cli.endpoint)?;
    tracing::info!(endpoint = %control.base_url(), "Using control plane");
    let handle = Agent::start(config, Arc::new(control), None)?;

    let mut identities = handle.store().subscribe();
    loop {
        tokio::select! {
            _ = crate::shutdown_signal() => break,
            changed = identities.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = identities.borrow_and_update().clone();
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "generation": snapshot.current.generation,
                            "issuer": snapshot.current.issuer_fingerprint,
                            "trusted": snapshot.current.trusted_fingerprints(),
                            "expires_at": snapshot.current.expires_at,
                        })
                    );
                } else {
                    println!(
                        "Identity generation {} ({} trusted CA certificates, expires {})",
                        snapshot.current.generation,
                        snapshot.current.trusted_anchor_count(),
                        snapshot.current.expires_at.to_rfc3339()
                    );
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    Ok(())
}

// ── rotate ──────────────────────────────────────────────────────────

pub async fn rotate(cli: &Cli, command: &RotateSubcommand) -> anyhow::Result<()> {
    let client = RotationClient::new(&cli.endpoint)?;
    let request = match command {
        RotateSubcommand::Start {
            ca_type,
            auto,
            expected_version,
        } => {
            let mut request = RotateRequest::new(*ca_type, Phase::Init);
            request.mode = if *auto {
                RotationMode::Automatic
            } else {
                RotationMode::Manual
            };
            request.expected_version = *expected_version;
            request
        }
        RotateSubcommand::Advance {
            ca_type,
            to,
            expected_version,
            force,
        } => {
            let mut request = match (ca_type, to) {
                (ca_type, Some(target)) => {
                    let mut request = RotateRequest::new(*ca_type, *target);
                    request.expected_version = *expected_version;
                    request
                }
                (Some(ca_type), None) => {
                    // Advance one step from the state we just read, fenced on it.
                    let state = client.state(*ca_type).await?;
                    let Some(next) = state.phase.next() else {
                        anyhow::bail!("{ca_type} CA is not rotating (phase {})", state.phase);
                    };
                    let mut request = RotateRequest::new(Some(*ca_type), next);
                    request.expected_version = Some(expected_version.unwrap_or(state.version));
                    request
                }
                (None, None) => anyhow::bail!("advancing every CA requires --to"),
            };
            request.force = *force;
            request
        }
        RotateSubcommand::Rollback {
            ca_type,
            expected_version,
        } => {
            let mut request = RotateRequest::new(*ca_type, Phase::Rollback);
            request.expected_version = *expected_version;
            request
        }
    };

    let states = client.rotate(&request).await?;
    print_states(&states, cli.json)
}

// ── status ──────────────────────────────────────────────────────────

pub async fn status(cli: &Cli, ca_type: Option<CaType>) -> anyhow::Result<()> {
    let client = RotationClient::new(&cli.endpoint)?;
    if let Err(e) = client.health().await {
        anyhow::bail!("{e}. Is `keyturn serve` running at {}?", cli.endpoint);
    }
    let states = match ca_type {
        Some(ca_type) => vec![client.state(ca_type).await?],
        None => client.states().await?,
    };
    print_states(&states, cli.json)
}

// ── Output ──────────────────────────────────────────────────────────

fn print_states(states: &[RotationState], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(states)?);
        return Ok(());
    }
    let now = chrono::Utc::now();
    for state in states {
        println!("{}", format_state(state, now));
    }
    Ok(())
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}

fn format_state(state: &RotationState, now: chrono::DateTime<chrono::Utc>) -> String {
    let mut out = format!(
        "{:<5} {:<15} v{:<4} {:<9} active {}",
        state.ca_type.as_str(),
        state.phase.as_str(),
        state.version,
        state.mode.as_str(),
        short(&state.active.fingerprint)
    );
    if let Some(standby) = &state.standby {
        out.push_str(&format!("  standby {}", short(&standby.fingerprint)));
    }
    if state.phase.is_rotating() {
        let remaining = state.grace_remaining(now);
        if remaining.is_zero() {
            out.push_str("  ready to advance");
        } else {
            out.push_str(&format!("  grace {}s", remaining.as_secs()));
        }
    }
    if let Some(err) = &state.last_error {
        out.push_str(&format!("\n      last error: {err}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_shows_standby_and_grace() {
        let core = RotationCore::new(RotationConfig::default()).unwrap();
        let state = core
            .start_rotation(CaType::Host, RotationMode::Manual)
            .unwrap();
        let line = format_state(&state, chrono::Utc::now());
        assert!(line.starts_with("host  init"), "{line}");
        assert!(line.contains("standby "));
        assert!(line.contains("grace "));
    }

    #[test]
    fn format_standby_has_no_grace() {
        let core = RotationCore::new(RotationConfig::default()).unwrap();
        let state = core.get_state(CaType::User).unwrap();
        let line = format_state(&state, chrono::Utc::now());
        assert!(!line.contains("grace"));
        assert!(line.contains(&state.active.fingerprint[..16]));
    }
}
