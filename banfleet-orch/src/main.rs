use std::path::PathBuf;
use std::process::ExitCode;

use banfleet_orch::cmd;
use banfleet_orch::config::OrchConfig;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "banfleet-orch", about = "banfleet orchestrator", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// YAML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Etcd endpoints, comma separated.
    #[arg(long = "etcd-endpoints", global = true, value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Node name; defaults to the hostname.
    #[arg(long, global = true)]
    name: Option<String>,

    /// Secret sealing the cluster CA key.
    #[arg(long = "cluster-secret", global = true)]
    cluster_secret: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the cluster CA and announce this orchestrator.
    Init,
    /// Join an initialized cluster.
    Join {
        /// Cluster secret handed out by the operator.
        #[arg(long)]
        token: String,
    },
    /// Wipe orchestrator state from etcd.
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Run the gRPC server and controllers.
    Server {
        /// gRPC listen address.
        #[arg(long = "grpc-addr")]
        grpc_addr: Option<String>,

        /// Serve without TLS (development only).
        #[arg(long)]
        insecure: bool,
    },
}

fn apply_overrides(config: &mut OrchConfig, global: &GlobalArgs) {
    if !global.etcd_endpoints.is_empty() {
        config.etcd.endpoints = global.etcd_endpoints.clone();
    }
    if let Some(name) = &global.name {
        config.name = name.clone();
    }
    if let Some(secret) = &global.cluster_secret {
        config.cluster_secret = secret.clone();
    }
}

/// First signal cancels gracefully; a second one force-quits with
/// exit code 2.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, stopping");
        cancel.cancel();

        wait_for_signal().await;
        warn!("second signal received, forcing quit");
        std::process::exit(2);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match OrchConfig::load(cli.global.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "loading config failed");
            return ExitCode::from(1);
        }
    };
    apply_overrides(&mut config, &cli.global);

    let result = match cli.command {
        Command::Init => cmd::init::run(&config).await,
        Command::Join { token } => cmd::join::run(&config, &token).await,
        Command::Reset { force } => cmd::reset::run(&config, force).await,
        Command::Server { grpc_addr, insecure } => {
            if let Some(addr) = grpc_addr {
                config.grpc_addr = addr;
            }
            config.insecure = config.insecure || insecure;

            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());
            cmd::server::run(&config, cancel).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::from(1)
        }
    }
}
