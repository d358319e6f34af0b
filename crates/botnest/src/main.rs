use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use botnest_protocol::PairingMethod;

use botnest::config::{Config, PrefixSpec};
use botnest::credentials::CredentialStore;
use botnest::dispatch::{CommandRegistry, DispatchPipeline, OwnerNotice};
use botnest::ledger::LedgerStore;
use botnest::modules;
use botnest::session::{
    ActivationTracker, SessionRegistry, SessionState, StdioConnector, SupervisorContext,
    PRIMARY_SESSION_ID,
};

// ============================================================================
// CLI Types
// ============================================================================

/// Botnest - a multi-session chat-bot runtime
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the runtime: primary session, reconcile sweep, ledger flusher
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "botnest.yaml")]
        config: String,

        /// Pairing method (overrides config file) [qr, code]
        #[arg(long)]
        pairing: Option<String>,

        /// Command prefix (overrides config file)
        #[arg(long)]
        prefix: Option<String>,

        /// React only to messages sent from the bot's own account
        #[arg(long)]
        self_mode: bool,

        /// Dispatch commands only in group chats
        #[arg(long)]
        group_only: bool,

        /// Dispatch commands only in private chats
        #[arg(long)]
        private_only: bool,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            pairing,
            prefix,
            self_mode,
            group_only,
            private_only,
        } => {
            run_runtime(
                Path::new(&config),
                pairing.as_deref(),
                prefix,
                self_mode,
                group_only,
                private_only,
            )
            .await
        }
    }
}

// ============================================================================
// Runtime wiring
// ============================================================================

async fn run_runtime(
    config_path: &Path,
    pairing: Option<&str>,
    prefix: Option<String>,
    self_mode: bool,
    group_only: bool,
    private_only: bool,
) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Some(method) = pairing {
        config.session.pairing_method = parse_pairing(method)?;
    }
    if let Some(prefix) = prefix {
        config.dispatch.prefix = Some(PrefixSpec::One(prefix));
    }
    config.dispatch.self_mode |= self_mode;
    config.dispatch.group_only |= group_only;
    config.dispatch.private_only |= private_only;
    let config = Arc::new(config);

    let ledger_path = config.ledger_path(config_path);
    if let Some(parent) = ledger_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let ledger = LedgerStore::open(&ledger_path)
        .with_context(|| format!("opening ledger {}", ledger_path.display()))?;

    let (shutdown_tx, _) = watch::channel(false);
    let flush_task =
        ledger.spawn_flush_task(config.ledger.flush_interval(), shutdown_tx.subscribe());

    let command_registry = Arc::new(CommandRegistry::empty());
    let (notice_tx, notice_rx) = mpsc::channel::<OwnerNotice>(64);
    let pipeline = Arc::new(DispatchPipeline::new(
        &config,
        Arc::clone(&command_registry),
        Arc::clone(&ledger),
        notice_tx.clone(),
    )?);

    let ctx = SupervisorContext {
        config: Arc::clone(&config),
        connector: Arc::new(StdioConnector::new(&config.connector)),
        credentials: CredentialStore::new(
            config.sessions_dir(config_path),
            config.backups_dir(config_path),
        ),
        pipeline,
        owner_notify: notice_tx,
        activation: ActivationTracker::new(),
    };
    let registry = SessionRegistry::new(ctx);

    command_registry
        .reload(modules::builtin_modules(Arc::clone(&registry)))
        .await
        .context("loading built-in command modules")?;

    let notice_task = tokio::spawn(forward_owner_notices(
        Arc::clone(&registry),
        Arc::clone(&config),
        notice_rx,
    ));

    registry.start_primary().await?;
    let reconcile_task = registry.spawn_reconcile_task(config.session.reconcile_interval());

    info!("Runtime started, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    registry.shutdown().await;
    reconcile_task.abort();
    notice_task.abort();
    if flush_task.await.is_err() {
        warn!("Ledger flush task did not stop cleanly");
    }

    Ok(())
}

fn parse_pairing(method: &str) -> Result<PairingMethod> {
    match method {
        "qr" => Ok(PairingMethod::Qr),
        "code" => Ok(PairingMethod::NumericCode),
        other => bail!("unknown pairing method '{other}' (expected 'qr' or 'code')"),
    }
}

/// Deliver owner notices as direct messages from the session that raised
/// them, falling back to the primary session.
async fn forward_owner_notices(
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
    mut notices: mpsc::Receiver<OwnerNotice>,
) {
    while let Some(notice) = notices.recv().await {
        let handle = registry
            .get(&notice.session_id)
            .filter(|h| h.state() != SessionState::Terminated)
            .or_else(|| registry.get(PRIMARY_SESSION_ID));
        let Some(handle) = handle else {
            warn!(session_id = %notice.session_id, "No session to deliver owner notice");
            continue;
        };
        for owner in &config.roles.owners {
            if let Err(e) = handle.send_text(owner.clone(), notice.text.clone()).await {
                warn!(owner = %owner, error = %e, "Owner notice delivery failed");
            }
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
