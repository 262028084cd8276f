//! # Runner Core Module
//!
//! The child side of a bridge session. A runner process is the same
//! executable started with `--process <service-id> --command-pipe <path>
//! --response-pipe <path>`; it connects to both endpoints, instantiates
//! the named service from the catalog, hooks up event and log
//! forwarding, and then serves Call frames until told to stop or until
//! the manager goes away.
//!
//! Calls are processed strictly sequentially, one in-flight call per
//! runner, so hosted services never need to be safe against concurrent
//! method invocation. Events a method raises mid-body are written under
//! the same lock as its Response and therefore reach the manager first.
//!
//! A failing method never kills the runner: the failure is converted
//! into an error Response and the loop continues. Only a dead command
//! stream (or a dispatched `stop_async`) ends the serve loop.

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::Context as _;
use rmpv::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::cli::RunnerOptions;
use crate::logging;
use crate::service::{
    EventSink, ServiceCatalog, ServiceHost, SharedWriter, START_METHOD, STOP_METHOD,
};
use crate::transport;
use crate::wire::{self, Frame, ResponseStatus, WireError};

/// Lifecycle of a runner process.
///
/// `Serving → Stopping` when `stop_async` is dispatched;
/// `Stopping → Exiting` once the final Response has been flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Unconnected,
    Connected,
    Serving,
    Stopping,
    Exiting,
}

/// Connect, host the named service, and serve until stopped.
///
/// Installs the process-global tracing subscriber (stderr for
/// warnings-and-up opportunistic diagnostics, Log frames for the
/// structured records), so it must be the only subscriber initialiser in
/// the process. Returns `Ok` on a clean stop or manager disconnect; any
/// error before the serve loop is an initialisation failure and the
/// binary exits with status 1.
pub async fn run_runner(
    opts: RunnerOptions,
    catalog: &ServiceCatalog,
    level: LevelFilter,
) -> anyhow::Result<()> {
    let mut state = RunnerState::Unconnected;
    trace!(?state, service = %opts.service_id, "runner starting");

    let (mut command, response) =
        transport::connect_runner(&opts.command_pipe, &opts.response_pipe)
            .await
            .context("connecting to session endpoints")?;
    state = RunnerState::Connected;
    trace!(?state, "session endpoints connected");

    let writer: SharedWriter = Arc::new(Mutex::new(
        Box::new(response) as Box<dyn AsyncWrite + Send + Unpin>
    ));

    let (forward_layer, _log_task) = logging::spawn_forwarder(Arc::clone(&writer));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_filter(LevelFilter::WARN),
        )
        .with(forward_layer.with_filter(level))
        .init();

    let host: Arc<dyn ServiceHost> = Arc::from(
        catalog
            .construct(&opts.service_id, EventSink::new(Arc::clone(&writer)))
            .context("constructing hosted service")?,
    );
    info!(service = %opts.service_id, "service instantiated");

    // Fire-and-forget startup hook; the serve loop does not wait for it.
    {
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            if let Err(e) = host.start().await {
                error!("service start hook failed: {e:#}");
            }
        });
    }

    state = RunnerState::Serving;
    debug!(?state, "entering serve loop");

    loop {
        let frame = match Frame::read_from(&mut command).await {
            Ok(frame) => frame,
            Err(WireError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("command stream closed by the manager");
                break;
            }
            Err(e) => {
                warn!("command stream terminated: {e}");
                break;
            }
        };
        let Frame::Call { id, method, args } = frame else {
            debug!("ignoring non-call frame on the command stream");
            continue;
        };
        trace!(id, method, "dispatching call");

        let mut stopping = false;
        let reply = dispatch_call(host.as_ref(), &method, &args, &mut stopping).await;
        if stopping {
            state = RunnerState::Stopping;
        }

        let frame = match reply {
            Ok(value) => Frame::Response {
                id,
                status: ResponseStatus::Success,
                payload: encode_result(value)?,
            },
            Err(message) => {
                debug!(id, method, "call failed: {message}");
                Frame::Response {
                    id,
                    status: ResponseStatus::Error,
                    payload: wire::encode_error_message(&message)?,
                }
            }
        };
        {
            let mut stream = writer.lock().await;
            frame
                .write_to(&mut *stream)
                .await
                .context("writing response frame")?;
        }

        if state == RunnerState::Stopping {
            // Respond-before-exit: the Response above is already flushed,
            // so the manager's pending stop call resolves cleanly even
            // though the process is about to go away.
            state = RunnerState::Exiting;
            debug!(?state, "stop dispatched; leaving the serve loop");
            break;
        }
    }

    Ok(())
}

/// Resolve and invoke one call, reporting failures as message text.
async fn dispatch_call(
    host: &dyn ServiceHost,
    method: &str,
    args: &[u8],
    stopping: &mut bool,
) -> Result<Option<Value>, String> {
    let args = match wire::decode_args(args) {
        Ok(args) => args,
        Err(e) => return Err(format!("malformed argument payload: {e}")),
    };

    match method {
        STOP_METHOD => {
            *stopping = true;
            host.stop().await.map_err(|e| root_cause_message(&e))
        }
        START_METHOD => host.start().await.map_err(|e| root_cause_message(&e)),
        _ => match host.dispatch(method, args) {
            None => Err(format!("Method {method} not found")),
            Some(invocation) => invocation.await.map_err(|e| root_cause_message(&e)),
        },
    }
}

/// Unwrap error wrappers down to the root cause, whose message is what
/// travels back to the manager.
fn root_cause_message(err: &anyhow::Error) -> String {
    err.root_cause().to_string()
}

fn encode_result(value: Option<Value>) -> Result<Vec<u8>, WireError> {
    match value {
        Some(value) => wire::encode_value(&value),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{arg, BridgedService, HostedService, MethodTable};
    use async_trait::async_trait;

    struct Greeter;

    #[async_trait]
    impl BridgedService for Greeter {
        fn methods(table: &mut MethodTable<Self>) {
            table.register("greet", |_svc, args| async move {
                let name: String = arg(&args, 0)?;
                Ok(Some(Value::from(format!("hello {name}"))))
            });
            table.register("fail", |_svc, _args| async move {
                let io = std::io::Error::new(std::io::ErrorKind::Other, "Test exception");
                Err(anyhow::Error::new(io).context("invocation wrapper"))
            });
        }
    }

    #[tokio::test]
    async fn dispatch_reports_missing_methods_by_name() {
        let host = HostedService::new(Greeter);
        let mut stopping = false;
        let err = dispatch_call(&host, "frob", &[], &mut stopping)
            .await
            .unwrap_err();
        assert_eq!(err, "Method frob not found");
        assert!(!stopping);
    }

    #[tokio::test]
    async fn dispatch_unwraps_to_the_root_cause() {
        let host = HostedService::new(Greeter);
        let mut stopping = false;
        let err = dispatch_call(&host, "fail", &[], &mut stopping)
            .await
            .unwrap_err();
        assert_eq!(err, "Test exception");
    }

    #[tokio::test]
    async fn dispatch_decodes_positional_arguments() {
        let host = HostedService::new(Greeter);
        let blob = wire::encode_args(vec![Value::from("runner")]).unwrap();
        let mut stopping = false;
        let value = dispatch_call(&host, "greet", &blob, &mut stopping)
            .await
            .unwrap();
        assert_eq!(value, Some(Value::from("hello runner")));
    }

    #[tokio::test]
    async fn stop_method_sets_the_stopping_flag() {
        let host = HostedService::new(Greeter);
        let mut stopping = false;
        let value = dispatch_call(&host, STOP_METHOD, &[], &mut stopping)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(stopping);
    }

    #[tokio::test]
    async fn malformed_argument_payload_becomes_an_error_reply() {
        let host = HostedService::new(Greeter);
        // A bare scalar is not the outer positional array.
        let blob = wire::encode_value(&Value::from(1)).unwrap();
        let mut stopping = false;
        let err = dispatch_call(&host, "greet", &blob, &mut stopping)
            .await
            .unwrap_err();
        assert!(err.contains("malformed argument payload"));
    }
}
