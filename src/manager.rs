//! # Manager Core Module
//!
//! The manager side of a bridge session: spawns the runner process,
//! establishes the transport pair, correlates replies to in-flight calls,
//! dispatches events and forwarded logs, and drives the session through
//! its lifecycle.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────── manager process ─────────────────────────────┐
//! │  caller tasks ──invoke──► pending registry ──► command stream ──► runner  │
//! │                               ▲                                           │
//! │  reader task ◄── response stream ◄── runner (Response / Event / Log)      │
//! │       │                                                                   │
//! │       ├─ Response → complete the matching pending entry                   │
//! │       ├─ Event    → typed subscribers, in emission order                  │
//! │       └─ Log      → replayed into this process's tracing subscriber       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One dedicated reader task owns the response stream's read side
//! exclusively; callers share the command stream behind a write lock so
//! every Call frame is written atomically. The pending registry is the
//! only structure shared between the two sides and is held only for map
//! operations, never across an await.
//!
//! ## Crash propagation
//!
//! The runner holds the only write end of the response stream, so its
//! death, graceful or not, surfaces as end-of-stream in the reader.
//! The reader then reaps the child, fails every pending call with
//! [`BridgeError::ChildExited`], and parks the session in the Stopped
//! state; subsequent calls fail immediately with the same error.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::defaults;
use crate::error::BridgeError;
use crate::logging;
use crate::service::STOP_METHOD;
use crate::transport::EndpointPair;
use crate::wire::{self, Frame, ResponseStatus, WireError};

/// Configuration for spawning a runner session.
///
/// `program` defaults to the current executable, matching the usual
/// deployment where manager and runner share one binary and the runner
/// mode is selected by command line.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Executable to spawn; `None` resolves the current executable.
    pub program: Option<PathBuf>,

    /// Service identifier passed to the child as `--process`.
    pub service_id: String,

    /// Directory the session's socket files are created in.
    pub socket_dir: PathBuf,

    /// Bound on each startup accept; a child that has not connected in
    /// time is killed and startup fails.
    pub connect_timeout: Duration,

    /// Bound on the graceful-stop reply and on the subsequent exit wait.
    pub stop_timeout: Duration,
}

impl ManagerConfig {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            program: None,
            service_id: service_id.into(),
            socket_dir: std::env::temp_dir(),
            connect_timeout: defaults::CONNECT_TIMEOUT,
            stop_timeout: defaults::STOP_TIMEOUT,
        }
    }
}

/// Lifecycle of a manager session.
///
/// ```text
/// Spawning ──► Ready ──► Stopping ──► Stopped
///     └────────────────────────────────►┘   (child died before Ready)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Endpoints bound, child spawned, connections not yet accepted.
    /// Only observable from inside [`ServiceManager::spawn`].
    Spawning,
    /// Both streams connected, reader task running, calls accepted.
    Ready,
    /// Graceful shutdown in progress.
    Stopping,
    /// Transports closed and child reaped; terminal.
    Stopped,
}

/// Handle returned by [`ServiceManager::subscribe`]; pass it back to
/// [`ServiceManager::unsubscribe`] to remove that one registration.
#[derive(Debug)]
pub struct EventSubscription {
    name: String,
    token: u64,
}

impl EventSubscription {
    /// Event name this subscription is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

type CallReply = Result<Option<Value>, BridgeError>;
type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct EventEntry {
    token: u64,
    callback: EventCallback,
}

struct Shared {
    pending: StdMutex<HashMap<i32, oneshot::Sender<CallReply>>>,
    next_id: AtomicI32,
    events: StdMutex<HashMap<String, Vec<EventEntry>>>,
    next_token: AtomicU64,
    /// Command stream; dropped (taken) on shutdown or child exit, which
    /// is what makes later calls fail fast.
    writer: AsyncMutex<Option<UnixStream>>,
    state: StdMutex<SessionState>,
    exited_unexpectedly: AtomicBool,
    child: AsyncMutex<Option<Child>>,
    exit_code: StdMutex<Option<i32>>,
    stop_timeout: Duration,
    stdio_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// A live (or terminated) runner session.
///
/// All methods take `&self`; the handle can be shared behind an `Arc` by
/// any number of caller tasks.
pub struct ServiceManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager").finish_non_exhaustive()
    }
}

impl ServiceManager {
    /// Spawn the runner process and bring the session to Ready.
    ///
    /// Binds both endpoints before spawning so the child never races an
    /// unbound socket, then accepts command first and response second,
    /// the order the runner connects in. Each accept races the child's
    /// exit and the connect timeout; losing either race fails startup
    /// with [`BridgeError::Startup`] carrying the child's exit code when
    /// known.
    pub async fn spawn(config: ManagerConfig) -> Result<Self, BridgeError> {
        let program = match &config.program {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                BridgeError::startup(format!("cannot resolve current executable: {e}"), None)
            })?,
        };

        let mut endpoints = EndpointPair::bind(&config.socket_dir)
            .map_err(|e| BridgeError::startup(format!("endpoint creation failed: {e}"), None))?;

        let mut child = Command::new(&program)
            .arg("--process")
            .arg(&config.service_id)
            .arg("--command-pipe")
            .arg(endpoints.command_path())
            .arg("--response-pipe")
            .arg(endpoints.response_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::startup(format!("spawn of {} failed: {e}", program.display()), None)
            })?;
        debug!(
            pid = child.id(),
            service = %config.service_id,
            "runner process spawned"
        );

        let mut stdio_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            stdio_tasks.push(tokio::spawn(forward_stdio(stdout, false)));
        }
        if let Some(stderr) = child.stderr.take() {
            stdio_tasks.push(tokio::spawn(forward_stdio(stderr, true)));
        }

        let command = accept_or_fail(
            endpoints.accept_command(),
            &mut child,
            config.connect_timeout,
            "command",
        )
        .await?;
        let response = accept_or_fail(
            endpoints.accept_response(),
            &mut child,
            config.connect_timeout,
            "response",
        )
        .await?;
        endpoints.unlink();

        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicI32::new(0),
            events: StdMutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            writer: AsyncMutex::new(Some(command)),
            state: StdMutex::new(SessionState::Ready),
            exited_unexpectedly: AtomicBool::new(false),
            child: AsyncMutex::new(Some(child)),
            exit_code: StdMutex::new(None),
            stop_timeout: config.stop_timeout,
            stdio_tasks: StdMutex::new(stdio_tasks),
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            reader_loop(reader_shared, response).await;
        });

        debug!("session ready");
        Ok(Self { shared })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    /// Exit code of the runner process, once it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.lock().unwrap()
    }

    /// Invoke a method on the hosted service and await its result.
    ///
    /// `stop_async` is intercepted and routed through
    /// [`ServiceManager::shutdown`]; the runner still receives the stop
    /// through that path, but the session is also torn down cleanly.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, BridgeError> {
        if method == STOP_METHOD {
            self.shutdown().await?;
            return Ok(None);
        }
        match self.state() {
            SessionState::Stopping | SessionState::Stopped => {
                return Err(self.terminal_error());
            }
            SessionState::Spawning | SessionState::Ready => {}
        }
        self.call(method, args).await
    }

    /// Invoke a method and decode its result into `T`.
    pub async fn invoke_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, BridgeError> {
        let value = self.invoke(method, args).await?.ok_or_else(|| BridgeError::Call {
            message: format!("method {method} returned no payload"),
        })?;
        rmpv::ext::from_value(value).map_err(|e| BridgeError::Call {
            message: format!("method {method} result: {e}"),
        })
    }

    /// Invoke a method whose result (if any) is discarded.
    pub async fn invoke_unit(&self, method: &str, args: Vec<Value>) -> Result<(), BridgeError> {
        self.invoke(method, args).await.map(|_| ())
    }

    /// Register a typed subscriber for `event`.
    ///
    /// Subscribers for a given event must agree on the payload type; the
    /// reader decodes each Event frame once and every subscriber converts
    /// the decoded value to its declared parameter type.
    pub fn subscribe<T, F>(&self, event: &str, callback: F) -> EventSubscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        let callback: EventCallback = Arc::new(move |value: &Value| {
            match rmpv::ext::from_value::<T>(value.clone()) {
                Ok(decoded) => callback(decoded),
                Err(e) => warn!("event payload did not match subscriber type: {e}"),
            }
        });
        self.shared
            .events
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(EventEntry { token, callback });
        EventSubscription {
            name: event.to_string(),
            token,
        }
    }

    /// Remove one subscriber registration; the event's entry disappears
    /// entirely once its list empties.
    pub fn unsubscribe(&self, subscription: &EventSubscription) {
        let mut events = self.shared.events.lock().unwrap();
        if let Some(list) = events.get_mut(&subscription.name) {
            if let Some(pos) = list.iter().position(|e| e.token == subscription.token) {
                list.remove(pos);
            }
            if list.is_empty() {
                events.remove(&subscription.name);
            }
        }
    }

    /// Gracefully terminate the session. Idempotent.
    ///
    /// Sends `stop_async` through the normal call path while the runner
    /// is still live, bounded by the configured stop timeout, then closes
    /// the command stream, detaches the stdio forwarders, force-kills a
    /// child that is still running, and awaits its exit.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                SessionState::Stopping | SessionState::Stopped => return Ok(()),
                _ => *state = SessionState::Stopping,
            }
        }

        if !self.shared.exited_unexpectedly.load(Ordering::SeqCst) {
            match tokio::time::timeout(
                self.shared.stop_timeout,
                self.call(STOP_METHOD, Vec::new()),
            )
            .await
            {
                Ok(Ok(_)) => debug!("runner acknowledged stop"),
                // The runner may exit between writing its stop Response and
                // the reader delivering it; the exit handler mops that up.
                Ok(Err(e)) => debug!("stop call resolved with {e}"),
                Err(_) => warn!("stop call timed out"),
            }
        }

        self.shared.writer.lock().await.take();

        for task in self.shared.stdio_tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        if let Some(mut child) = self.shared.child.lock().await.take() {
            let status = match tokio::time::timeout(self.shared.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => {
                    warn!("runner still alive after stop; terminating");
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };
            if let Some(status) = status {
                *self.shared.exit_code.lock().unwrap() = status.code();
                debug!(code = status.code(), "runner exited");
            }
        }

        *self.shared.state.lock().unwrap() = SessionState::Stopped;
        Ok(())
    }

    fn terminal_error(&self) -> BridgeError {
        if self.shared.exited_unexpectedly.load(Ordering::SeqCst) {
            BridgeError::ChildExited
        } else {
            BridgeError::Stopped
        }
    }

    /// The raw call path: allocate id, register, write, await.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, BridgeError> {
        let shared = &self.shared;
        if shared.exited_unexpectedly.load(Ordering::SeqCst) {
            return Err(BridgeError::ChildExited);
        }

        let blob = wire::encode_args(args)?;
        let (id, rx) = {
            let mut pending = shared.pending.lock().unwrap();
            allocate_pending(&shared.next_id, &mut pending)
        };

        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args: blob,
        };
        {
            let mut writer = shared.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                shared.pending.lock().unwrap().remove(&id);
                return Err(self.terminal_error());
            };
            if let Err(e) = frame.write_to(stream).await {
                shared.pending.lock().unwrap().remove(&id);
                return Err(if shared.exited_unexpectedly.load(Ordering::SeqCst) {
                    BridgeError::ChildExited
                } else {
                    BridgeError::Wire(e)
                });
            }
        }
        trace!(id, method, "call dispatched");

        match rx.await {
            Ok(reply) => reply,
            // Sender dropped by the child-exit drain.
            Err(_) => Err(BridgeError::ChildExited),
        }
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        // Closing the command stream is enough to make an abandoned
        // runner exit; the reader task then drains and reaps as usual.
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
    }
}

/// Allocate a request id that is not currently live and register a fresh
/// pending entry under it.
///
/// Ids increment atomically; after wraparound an id still in flight is
/// skipped rather than reused, so no two in-flight calls ever share one.
fn allocate_pending(
    next_id: &AtomicI32,
    pending: &mut HashMap<i32, oneshot::Sender<CallReply>>,
) -> (i32, oneshot::Receiver<CallReply>) {
    loop {
        let id = next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if pending.contains_key(&id) {
            continue;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        return (id, rx);
    }
}

async fn accept_or_fail<F>(
    accept: F,
    child: &mut Child,
    connect_timeout: Duration,
    which: &'static str,
) -> Result<UnixStream, BridgeError>
where
    F: std::future::Future<Output = std::io::Result<UnixStream>>,
{
    tokio::select! {
        res = accept => res.map_err(|e| {
            BridgeError::startup(format!("accept on the {which} endpoint failed: {e}"), None)
        }),
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            Err(BridgeError::startup(
                format!("child exited before connecting to the {which} endpoint"),
                code,
            ))
        }
        _ = tokio::time::sleep(connect_timeout) => {
            let _ = child.start_kill();
            Err(BridgeError::startup(
                format!("timed out waiting for the {which} endpoint connection"),
                None,
            ))
        }
    }
}

async fn forward_stdio<R>(stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "ipc_bridge::child", "{line}");
        } else {
            debug!(target: "ipc_bridge::child", "{line}");
        }
    }
}

async fn reader_loop(shared: Arc<Shared>, mut stream: UnixStream) {
    loop {
        match Frame::read_from(&mut stream).await {
            Ok(Frame::Response {
                id,
                status,
                payload,
            }) => handle_response(&shared, id, status, &payload),
            Ok(Frame::Event { name, payload }) => handle_event(&shared, &name, &payload),
            Ok(Frame::Log { severity, message }) => {
                logging::forward_to_tracing(&severity, &message)
            }
            Ok(Frame::Call { id, .. }) => {
                debug!(id, "ignoring call frame on the response stream")
            }
            Err(WireError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("response stream closed");
                break;
            }
            Err(e) => {
                warn!("response stream terminated: {e}");
                break;
            }
        }
    }
    handle_stream_end(&shared).await;
}

fn handle_response(shared: &Shared, id: i32, status: ResponseStatus, payload: &[u8]) {
    // Decode before removing the pending entry: a malformed payload drops
    // the frame and leaves the call to be resolved by child-exit.
    let reply = match status {
        ResponseStatus::Success => match wire::decode_value(payload) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(id, "dropping response with undecodable payload: {e}");
                return;
            }
        },
        ResponseStatus::Error => match wire::decode_error_message(payload) {
            Ok(message) => Err(BridgeError::Call { message }),
            Err(e) => {
                warn!(id, "dropping error response with undecodable message: {e}");
                return;
            }
        },
    };

    let sender = shared.pending.lock().unwrap().remove(&id);
    match sender {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(id, "dropping response with no pending call"),
    }
}

fn handle_event(shared: &Shared, name: &str, payload: &[u8]) {
    let value = match wire::decode_value(payload) {
        Ok(Some(value)) => value,
        Ok(None) => Value::Nil,
        Err(e) => {
            warn!(event = name, "dropping event with undecodable payload: {e}");
            return;
        }
    };

    let callbacks: Vec<EventCallback> = {
        let events = shared.events.lock().unwrap();
        events
            .get(name)
            .map(|list| list.iter().map(|e| Arc::clone(&e.callback)).collect())
            .unwrap_or_default()
    };
    if callbacks.is_empty() {
        trace!(event = name, "event has no subscribers");
        return;
    }

    for callback in callbacks {
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&value)));
        if outcome.is_err() {
            error!(event = name, "event subscriber panicked");
        }
    }
}

/// Runs when the reader loop ends for any reason: reap the child, fail
/// every pending call, and park the session.
///
/// During a graceful shutdown the child is left to [`ServiceManager::shutdown`],
/// which already holds responsibility for reaping it and recording the
/// exit code; taking it here as well would race that path.
async fn handle_stream_end(shared: &Arc<Shared>) {
    let graceful = matches!(
        *shared.state.lock().unwrap(),
        SessionState::Stopping | SessionState::Stopped
    );

    if !graceful {
        if let Some(mut child) = shared.child.lock().await.take() {
            if let Ok(status) = child.wait().await {
                *shared.exit_code.lock().unwrap() = status.code();
                debug!(code = status.code(), "runner process reaped");
            }
        }
        shared.exited_unexpectedly.store(true, Ordering::SeqCst);
        warn!("runner exited unexpectedly; failing pending calls");
    }

    shared.writer.lock().await.take();
    if !graceful {
        *shared.state.lock().unwrap() = SessionState::Stopped;
    }

    // Drain last: a caller woken by the drain already observes the
    // terminal state and the recorded exit code.
    let drained: Vec<(i32, oneshot::Sender<CallReply>)> =
        shared.pending.lock().unwrap().drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(BridgeError::ChildExited));
    }
}
