use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use banfleet_agent::cmd;
use banfleet_agent::config::AgentConfig;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "banfleet-agent", about = "banfleet agent", version)]
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

    /// Agent name; defaults to the hostname.
    #[arg(long, global = true)]
    name: Option<String>,

    /// Orchestrator gRPC endpoint, host:port.
    #[arg(long = "orch-endpoint", global = true)]
    orch_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Obtain an mTLS identity from the orchestrator.
    Join {
        /// Registration token handed out by the operator.
        #[arg(long)]
        token: String,

        /// RPC timeout in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Run the agent.
    Server {
        /// gRPC listen address.
        #[arg(long = "grpc-addr")]
        grpc_addr: Option<String>,

        /// Status report interval in seconds.
        #[arg(long = "report-interval")]
        report_interval: Option<u64>,

        /// Talk plaintext gRPC (development only).
        #[arg(long)]
        insecure: bool,
    },
}

fn apply_overrides(config: &mut AgentConfig, global: &GlobalArgs) {
    if let Some(name) = &global.name {
        config.name = name.clone();
    }
    if let Some(endpoint) = &global.orch_endpoint {
        config.orch_endpoint = endpoint.clone();
    }
}

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

    let mut config = match AgentConfig::load(cli.global.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "loading config failed");
            return ExitCode::from(1);
        }
    };
    apply_overrides(&mut config, &cli.global);

    let result = match cli.command {
        Command::Join { token, timeout } => {
            cmd::join::run(&config, &token, Duration::from_secs(timeout)).await
        }
        Command::Server { grpc_addr, report_interval, insecure } => {
            if let Some(addr) = grpc_addr {
                config.grpc_addr = addr;
            }
            if let Some(interval) = report_interval {
                config.report_interval_secs = interval;
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
