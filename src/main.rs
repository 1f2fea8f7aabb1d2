use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wardendb::{DbError, Server, ServerConfig, ServerState};

/// WardenDB server
#[derive(Parser, Debug)]
#[command(name = "wardendb", version, about)]
struct Args {
    /// Durable dump file
    #[arg(long, default_value = "wardendb.db")]
    dump: PathBuf,

    /// JSON-lines audit trail
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Password for the root persona
    #[arg(long)]
    root_password: String,

    /// Idle limit in minutes
    #[arg(long, default_value_t = 15)]
    idle_minutes: u64,

    /// Idle limit in minutes for sessions with checked-out objects
    #[arg(long, default_value_t = 20)]
    idle_minutes_with_objects: u64,

    /// Minutes between automatic dumps (0 = only dump at shutdown)
    #[arg(long, default_value_t = 120)]
    dump_every: u64,

    /// Keep the previous dump when writing a new one
    #[arg(long)]
    archive: bool,

    /// Start from an empty store even if a dump exists
    #[arg(long)]
    fresh: bool,

    /// Seconds a login may wait for the gate to reopen
    #[arg(long, default_value_t = 0)]
    login_wait: u64,

    /// Seconds between the last logout and a deferred shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_grace: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(&self.root_password)
            .dump_path(self.dump.clone())
            .archive_dumps(self.archive)
            .load_on_start(!self.fresh)
            .idle_timeout(Duration::from_secs(self.idle_minutes * 60))
            .idle_timeout_with_objects(Duration::from_secs(self.idle_minutes_with_objects * 60))
            .login_wait(Duration::from_secs(self.login_wait))
            .shutdown_grace(Duration::from_secs(self.shutdown_grace))
            .dump_interval((self.dump_every > 0).then(|| Duration::from_secs(self.dump_every * 60)));
        if let Some(path) = &self.audit_log {
            config = config.audit_log_path(path.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wardendb=info")))
        .init();

    match run(Args::parse()).await {
        Ok(ServerState::ShutDown) => ExitCode::SUCCESS,
        Ok(state) => {
            error!(%state, "server stopped abnormally");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ServerState> {
    let server = Server::start(args.config())
        .await
        .context("failed to start server")?;
    let scheduler = server
        .start_background_tasks()
        .context("failed to start background tasks")?;
    info!(dump = %args.dump.display(), "wardendb running, ctrl+c to shut down");

    tokio::select! {
        state = server.wait_for_shutdown() => {
            scheduler.abort();
            return Ok(state);
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "unable to listen for ctrl+c");
            }
        }
    }

    info!("interrupt received");
    match server.shutdown(Some("Server interrupted")).await {
        Ok(()) => {}
        Err(DbError::Fatal(message)) => {
            error!(%message, "final dump failed, exiting without cleanup");
            return Ok(ServerState::Failed);
        }
        Err(e) => return Err(e).context("shutdown refused"),
    }
    let state = server.wait_for_shutdown().await;
    scheduler.abort();
    Ok(state)
}
