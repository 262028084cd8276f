//! # ipc-bridge - Main Entry Point
//!
//! One binary, two roles:
//!
//! 1. **Runner mode** (`--process ...`): host the named service and
//!    serve calls from the manager that spawned this process. Exit code
//!    0 on graceful stop or manager disconnect, 1 on initialisation
//!    failure.
//! 2. **Demo mode** (no flags): spawn this same executable as a runner
//!    hosting the bundled sample service, drive a short scripted session
//!    against it, and shut down: an end-to-end smoke test of the
//!    bridge.
//!
//! The demo installs a plain stderr `tracing` subscriber at the level
//! selected by `-v`/`-q`; runner mode installs its own subscriber inside
//! the serve path so structured records flow back to the manager as Log
//! frames.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use ipc_bridge::cli::{Args, Mode};
use ipc_bridge::{runner, sample, ManagerConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = args.log_level();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    match mode {
        Mode::Runner(opts) => {
            let catalog = sample::built_in_catalog();
            match runner::run_runner(opts, &catalog, level).await {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("runner initialisation failed: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        Mode::Demo => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(level),
                )
                .init();

            if let Err(e) = run_demo().await {
                error!("demo session failed: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

/// Scripted session against a self-spawned runner.
async fn run_demo() -> anyhow::Result<()> {
    info!("spawning sample runner");
    let client = sample::SampleClient::spawn(ManagerConfig::new(sample::SAMPLE_SERVICE_ID)).await?;

    let subscription = client.on_message(|message| {
        info!("event received: {message}");
    });

    let sum = client.add(5, 3).await?;
    info!("add(5, 3) = {sum}");

    let echoed = client.echo("Hello").await?;
    info!("echo(\"Hello\") = {echoed:?}");

    match client.throw_exception().await {
        Ok(()) => info!("throw_exception unexpectedly succeeded"),
        Err(e) => info!("throw_exception raised: {e}"),
    }

    client.unsubscribe(&subscription);
    client.stop().await?;
    info!(
        exit_code = client.manager().exit_code(),
        "runner stopped; demo complete"
    );
    Ok(())
}
