use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use steward_core::{
    ActivityController, AgentConfig, EventBus, HealthState, LivenessSubmitter, Orchestrator,
    OrchestratorSettings, RunError, SafeLiveness, Scheduler,
};
use steward_decision::{DecisionEngine, DecisionEngineConfig, OpenAiCompatProvider};
use steward_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use steward_server::{serve, AppState};
use steward_snapshot::{RelayClient, SnapshotClient};
use steward_state::{DecisionLog, StateStore};
use steward_types::{ExecutionPath, RunTrigger};
use steward_voting::{
    Address, ExecutorConfig, LocalWalletSigner, SafeClient, VoteExecutor, VoteSigner,
};

#[derive(Parser, Debug)]
#[command(name = "steward-engine")]
#[command(about = "Autonomous DAO governance voting agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent loop and the supervisor-facing API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        store_root: Option<PathBuf>,
        /// Force the dry-run path regardless of configuration.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Execute a single agent run and exit.
    RunOnce {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        store_root: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            host,
            port,
            config,
            store_root,
            dry_run,
        } => serve_command(host, port, config, store_root, dry_run).await,
        Command::RunOnce {
            config,
            store_root,
            dry_run,
        } => run_once_command(config, store_root, dry_run).await,
    }
}

fn load_config(
    file: Option<&PathBuf>,
    store_root: Option<PathBuf>,
    dry_run: bool,
) -> Result<AgentConfig, ExitCode> {
    let mut config = match AgentConfig::load_unchecked(file.map(PathBuf::as_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return Err(ExitCode::from(2));
        }
    };
    if let Some(root) = store_root {
        config.store_root = root;
    }
    if dry_run {
        config.execution_path = ExecutionPath::DryRun;
    }
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err}");
        return Err(ExitCode::from(2));
    }
    Ok(config)
}

async fn serve_command(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
    store_root: Option<PathBuf>,
    dry_run: bool,
) -> ExitCode {
    let config = match load_config(config_path.as_ref(), store_root, dry_run) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let logs_dir = canonical_logs_dir_from_root(&config.store_root);
    let _log_guard =
        match init_process_logging(ProcessKind::Agent, &logs_dir, config.retention.log_days) {
            Ok((guard, init)) => {
                info!(logs_dir = %init.logs_dir, "logging initialized");
                guard
            }
            Err(err) => {
                eprintln!("logging setup failed: {err}");
                return ExitCode::from(1);
            }
        };

    let orchestrator = match build_agent(&config).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(error = %err, "agent construction failed");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    let (scheduler, handle) = Scheduler::new(
        orchestrator.clone(),
        Duration::from_secs(config.poll_interval_secs),
        Duration::from_secs(config.shutdown_grace_secs),
    );
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "invalid listen address");
            return ExitCode::from(2);
        }
    };
    let app_state = AppState {
        orchestrator: orchestrator.clone(),
        scheduler: handle,
        health_staleness: Duration::from_secs(config.health_staleness_secs),
    };
    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(err) = serve(addr, app_state, server_cancel).await {
            error!(error = %err, "api server stopped");
        }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "signal handler setup failed");
            return ExitCode::from(1);
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "signal handler setup failed");
            return ExitCode::from(1);
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "signal handler setup failed");
            return ExitCode::from(1);
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => {
                match AgentConfig::load(config_path.as_deref()) {
                    Ok(_) => info!("configuration reloaded and validated"),
                    Err(err) => warn!(error = %err, "configuration reload rejected"),
                }
            }
        }
    }

    info!("shutdown requested, stopping at the next checkpoint boundary");
    cancel.cancel();

    // A second signal forces immediate exit.
    tokio::select! {
        _ = async {
            let _ = scheduler_task.await;
            let _ = server_task.await;
        } => ExitCode::SUCCESS,
        _ = sigterm.recv() => {
            warn!("second signal, exiting immediately");
            ExitCode::from(1)
        }
        _ = sigint.recv() => {
            warn!("second signal, exiting immediately");
            ExitCode::from(1)
        }
    }
}

async fn run_once_command(
    config_path: Option<PathBuf>,
    store_root: Option<PathBuf>,
    dry_run: bool,
) -> ExitCode {
    let config = match load_config(config_path.as_ref(), store_root, dry_run) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let logs_dir = canonical_logs_dir_from_root(&config.store_root);
    let _log_guard =
        match init_process_logging(ProcessKind::Agent, &logs_dir, config.retention.log_days) {
            Ok((guard, _)) => guard,
            Err(err) => {
                eprintln!("logging setup failed: {err}");
                return ExitCode::from(1);
            }
        };

    let orchestrator = match build_agent(&config).await {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(error = %err, "agent construction failed");
            return ExitCode::from(1);
        }
    };

    match orchestrator
        .execute(RunTrigger::Manual, &CancellationToken::new())
        .await
    {
        Ok(outcome) => {
            info!(
                run_id = %outcome.run.run_id,
                state = outcome.run.state.as_str(),
                voted = outcome.run.counters.proposals_voted,
                "run finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::from(run_exit_code(&err))
        }
    }
}

fn run_exit_code(err: &RunError) -> u8 {
    match err {
        RunError::Preferences(_) => 3,
        RunError::State(state) if state.is_corruption() => 3,
        _ => 1,
    }
}

async fn build_agent(config: &AgentConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let state = Arc::new(
        StateStore::with_retention(&config.store_root, config.retention.backups)
            .await
            .context("state store")?,
    );
    let decision_log = Arc::new(
        DecisionLog::new(&config.store_root)
            .await
            .context("decision log")?,
    );

    let snapshot = Arc::new(SnapshotClient::new(
        config.snapshot.hub_url.clone(),
        Duration::from_secs(config.timeouts.snapshot_secs),
    ));
    let provider = Arc::new(OpenAiCompatProvider::new(
        config.provider.url.clone(),
        config.provider.api_key.clone(),
        config.provider.model.clone(),
        Duration::from_secs(config.timeouts.provider_secs),
    ));
    let engine = Arc::new(DecisionEngine::new(provider, DecisionEngineConfig::default()));

    let signer: Arc<dyn VoteSigner> = match config.wallet.private_key.as_deref() {
        Some(key) if !key.trim().is_empty() => Arc::new(
            LocalWalletSigner::from_private_key(key, config.wallet.chain_id)
                .context("wallet key")?,
        ),
        _ => Arc::new(LocalWalletSigner::random(config.wallet.chain_id)),
    };

    let relay = RelayClient::new(
        config.snapshot.relay_url.clone(),
        Duration::from_secs(config.timeouts.vote_secs),
    );
    let safe = match (config.safe.address.as_deref(), config.safe.service_url.as_deref()) {
        (Some(address), Some(service_url)) if !address.is_empty() && !service_url.is_empty() => {
            let address: Address = address.parse().context("safe address")?;
            Some(Arc::new(SafeClient::new(
                service_url.to_string(),
                address,
                config.wallet.chain_id,
                Duration::from_secs(config.timeouts.vote_secs),
            )))
        }
        _ => None,
    };
    let governors = config
        .governors
        .iter()
        .map(|(space, governor)| {
            let address: Address = governor
                .parse()
                .with_context(|| format!("governor address for `{space}`"))?;
            Ok((space.clone(), address))
        })
        .collect::<anyhow::Result<HashMap<_, _>>>()?;

    let executor = Arc::new(VoteExecutor::new(
        signer.clone(),
        relay,
        safe.clone(),
        governors,
        ExecutorConfig::default(),
    ));

    let liveness: Option<Arc<dyn LivenessSubmitter>> = safe
        .map(|safe| Arc::new(SafeLiveness::new(safe, signer.clone())) as Arc<dyn LivenessSubmitter>);
    let activity = ActivityController::new(state.clone(), liveness);

    let settings = OrchestratorSettings {
        spaces: config.spaces.clone(),
        execution_path: config.execution_path,
        checkpoint_retention_runs: config.retention.checkpoint_runs,
        decision_log_retention_runs: config.retention.decision_log_runs,
        ..Default::default()
    };

    Ok(Arc::new(Orchestrator::new(
        state,
        decision_log,
        snapshot,
        engine,
        executor,
        activity,
        EventBus::new(),
        HealthState::new(),
        settings,
    )))
}
