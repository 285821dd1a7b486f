use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use convoy_domain::config::{Config, ConfigSeverity};
use convoy_runtime::{build_app_state, spawn_background_tasks, ConvoyServer};

#[derive(Parser)]
#[command(name = "convoy", version, about = "Streaming conversational event runtime")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "convoy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (default).
    Serve,
    /// Validate the config file and exit.
    ConfigValidate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)?;
            run_server(config).await
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                eprintln!("{tag}: {issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("config ok: {}", cli.config.display());
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,convoy_runtime=debug")),
        )
        .init();
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "convoy starting");

    let state = build_app_state(Arc::new(config))?;
    spawn_background_tasks(&state);

    let server = ConvoyServer::new(state.clone());

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown.notify_waiters();
        }
    });

    server.listen().await?;
    server.close().await;
    Ok(())
}
