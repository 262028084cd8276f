//! # Process-Hosted Service Bridge
//!
//! A transparent RPC bridge between a *manager* process and a child
//! *runner* process hosting a user-supplied background service. The
//! manager obtains a handle that behaves like a local instance of the
//! service; calls on it are marshalled over a Unix-domain-socket pair,
//! executed in the runner, and their results (or failures) marshalled
//! back. Service-raised events propagate to manager-side subscribers,
//! and the runner's structured log records are replayed into the
//! manager's `tracing` subscriber.

pub mod cli;
pub mod error;
pub mod logging;
pub mod manager;
pub mod runner;
pub mod sample;
pub mod service;
pub mod transport;
pub mod wire;

pub use error::BridgeError;
pub use manager::{EventSubscription, ManagerConfig, ServiceManager, SessionState};
pub use runner::{run_runner, RunnerState};
pub use service::{
    arg, to_arg, BridgedService, EventSink, HostedService, MethodTable, ServiceCatalog,
    ServiceHost, START_METHOD, STOP_METHOD,
};
pub use wire::{Frame, ResponseStatus, WireError};

/// The current version of the bridge crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Kernel socket buffer applied to every session endpoint; sized to
    /// absorb bursts of event frames without blocking the service.
    pub const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

    /// Upper bound on any single string or blob field in a frame.
    pub const MAX_FIELD_BYTES: u64 = 64 * 1024 * 1024;

    /// How long startup waits for each runner connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long graceful shutdown waits for the stop reply and for the
    /// child to exit before terminating it.
    pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);
}
