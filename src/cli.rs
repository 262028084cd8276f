//! # Command-Line Interface Module
//!
//! Argument surface of the `ipc-bridge` binary, parsed with `clap`'s
//! derive API. The binary has two modes:
//!
//! - **runner mode**: selected by `--process`; the process connects to
//!   the given endpoints and hosts the named service. This is the mode
//!   managers spawn children in.
//! - **demo mode**: no `--process`; the binary spawns *itself* as a
//!   runner hosting the bundled sample service, drives a short scripted
//!   session against it, and shuts down. Useful as a smoke test of the
//!   whole bridge.
//!
//! ```bash
//! # runner mode (normally constructed by a manager, not by hand)
//! ipc-bridge --process sample-worker \
//!     --command-pipe /tmp/ab12cd34-cmd.sock \
//!     --response-pipe /tmp/ab12cd34-rsp.sock
//!
//! # demo mode with debug diagnostics
//! ipc-bridge -vv
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

/// Transparent RPC bridge between a manager process and a child runner
/// hosting a background service.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Identifier of the service to host; presence of this flag selects
    /// runner mode.
    #[arg(long = "process", value_name = "SERVICE-ID", help_heading = "Runner Mode")]
    pub process: Option<String>,

    /// Path of the command endpoint (manager → runner) to connect to.
    #[arg(
        long = "command-pipe",
        value_name = "PATH",
        requires = "process",
        help_heading = "Runner Mode"
    )]
    pub command_pipe: Option<PathBuf>,

    /// Path of the response endpoint (runner → manager) to connect to.
    #[arg(
        long = "response-pipe",
        value_name = "PATH",
        requires = "process",
        help_heading = "Runner Mode"
    )]
    pub response_pipe: Option<PathBuf>,

    /// Increase diagnostic verbosity (-v: debug, -vv: trace).
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help_heading = "Output and Logging"
    )]
    pub verbose: u8,

    /// Silence all diagnostics below the error level.
    #[arg(short, long, help_heading = "Output and Logging")]
    pub quiet: bool,
}

/// Options a runner needs beyond the shared flags.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub service_id: String,
    pub command_pipe: PathBuf,
    pub response_pipe: PathBuf,
}

/// What the binary has been asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Runner(RunnerOptions),
    Demo,
}

impl Args {
    /// Resolve the execution mode, validating runner-mode flag pairing.
    pub fn mode(&self) -> anyhow::Result<Mode> {
        match &self.process {
            None => Ok(Mode::Demo),
            Some(service_id) => {
                let (Some(command_pipe), Some(response_pipe)) =
                    (&self.command_pipe, &self.response_pipe)
                else {
                    bail!("--process requires both --command-pipe and --response-pipe");
                };
                Ok(Mode::Runner(RunnerOptions {
                    service_id: service_id.clone(),
                    command_pipe: command_pipe.clone(),
                    response_pipe: response_pipe.clone(),
                }))
            }
        }
    }

    /// Diagnostic level selected by the verbosity flags.
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::ERROR;
        }
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}
