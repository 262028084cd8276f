//! # Service-Binding Module
//!
//! The seam between user-written services and the bridge. A service is an
//! ordinary struct implementing [`BridgedService`]; it declares its
//! callable surface by filling a [`MethodTable`] (a static dispatch
//! table keyed by method name, the substitute for reflective lookup)
//! and raises events through the [`EventSink`] handle
//! it is constructed with.
//!
//! On the runner side a [`ServiceCatalog`] maps service identifiers (as
//! they appear after `--process` on the child command line) to boxed
//! constructors, and [`HostedService`] erases the concrete service type
//! behind the [`ServiceHost`] object the dispatch loop drives.
//!
//! On the manager side the facade pattern is hand-written: a typed
//! wrapper struct turns each method into an `invoke(name, args)` call and
//! each event into a typed subscription (see the bundled sample facade
//! for the shape).
//!
//! ## Reserved method names
//!
//! `start_async` and `stop_async` are lifecycle hooks, not table entries:
//! the runner invokes `start` fire-and-forget after construction, and a
//! dispatched `stop_async` runs `stop` and then terminates the dispatch
//! loop. The manager-side facade never sends `stop_async` as a plain
//! call; it routes through graceful shutdown instead.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::wire::{self, Frame, WireError};

/// Reserved name of the fire-and-forget startup hook.
pub const START_METHOD: &str = "start_async";
/// Reserved name of the graceful-stop hook.
pub const STOP_METHOD: &str = "stop_async";

/// What a method handler resolves to: a value, nothing, or a failure
/// whose root-cause message travels back in an error Response.
pub type MethodResult = anyhow::Result<Option<Value>>;

/// Boxed future produced by a dispatched method.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

type BoxedMethod<S> = Box<dyn Fn(Arc<S>, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Shared write end of the runner's response stream.
///
/// Response, Event and Log frames all go through this one lock so every
/// frame is written atomically.
pub(crate) type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Dispatch table mapping method names to handlers for one service type.
pub struct MethodTable<S> {
    methods: HashMap<&'static str, BoxedMethod<S>>,
}

impl<S: Send + Sync + 'static> MethodTable<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a handler under `name`.
    ///
    /// The handler receives the service instance and the positionally
    /// decoded argument sequence; use [`arg`] to pull typed parameters
    /// out of it.
    pub fn register<F, Fut>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(Arc<S>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.methods.insert(
            name,
            Box::new(move |svc, args| -> MethodFuture { Box::pin(handler(svc, args)) }),
        );
    }

    /// Registered method names, for diagnostics.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }

    fn get(&self, name: &str) -> Option<&BoxedMethod<S>> {
        self.methods.get(name)
    }
}

impl<S: Send + Sync + 'static> Default for MethodTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// A service hosted inside a runner process.
///
/// One instance exists per runner; it is created at startup and lives
/// until the process exits.
#[async_trait]
pub trait BridgedService: Send + Sync + 'static {
    /// Declare the callable surface by filling the dispatch table.
    fn methods(table: &mut MethodTable<Self>)
    where
        Self: Sized;

    /// Startup hook, invoked fire-and-forget before the dispatch loop.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Shutdown hook, awaited while handling `stop_async`.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Type-erased view of a hosted service, driven by the dispatch loop.
pub trait ServiceHost: Send + Sync {
    /// Look up and invoke `method`; `None` means the name is unknown.
    fn dispatch(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture>;

    /// Run the service's startup hook.
    fn start(&self) -> MethodFuture;

    /// Run the service's shutdown hook.
    fn stop(&self) -> MethodFuture;
}

impl std::fmt::Debug for Box<dyn ServiceHost> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost").finish_non_exhaustive()
    }
}

/// Pairs a service instance with its dispatch table.
pub struct HostedService<S: BridgedService> {
    service: Arc<S>,
    table: MethodTable<S>,
}

impl<S: BridgedService> HostedService<S> {
    pub fn new(service: S) -> Self {
        let mut table = MethodTable::new();
        S::methods(&mut table);
        Self {
            service: Arc::new(service),
            table,
        }
    }
}

impl<S: BridgedService> ServiceHost for HostedService<S> {
    fn dispatch(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture> {
        let handler = self.table.get(method)?;
        Some(handler(self.service.clone(), args))
    }

    fn start(&self) -> MethodFuture {
        let svc = self.service.clone();
        Box::pin(async move { svc.start().await.map(|_| None) })
    }

    fn stop(&self) -> MethodFuture {
        let svc = self.service.clone();
        Box::pin(async move { svc.stop().await.map(|_| None) })
    }
}

type ServiceCtor = Box<dyn Fn(EventSink) -> anyhow::Result<Box<dyn ServiceHost>> + Send + Sync>;

/// Registry resolving `--process` identifiers to service constructors.
pub struct ServiceCatalog {
    entries: HashMap<String, ServiceCtor>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a constructor under a service identifier.
    pub fn register<F>(&mut self, id: impl Into<String>, ctor: F)
    where
        F: Fn(EventSink) -> anyhow::Result<Box<dyn ServiceHost>> + Send + Sync + 'static,
    {
        self.entries.insert(id.into(), Box::new(ctor));
    }

    /// Construct the service registered under `id`.
    pub fn construct(&self, id: &str, events: EventSink) -> anyhow::Result<Box<dyn ServiceHost>> {
        let ctor = self
            .entries
            .get(id)
            .ok_or_else(|| anyhow!("unknown service identifier `{id}`"))?;
        ctor(events)
    }

    /// Registered identifiers, for diagnostics.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a hosted service raises events through.
///
/// Cloneable; every clone writes Event frames under the write lock shared
/// with the dispatch loop's Responses, so an event emitted inside a
/// method body reaches the manager before that method's Response.
#[derive(Clone)]
pub struct EventSink {
    writer: SharedWriter,
}

impl EventSink {
    pub(crate) fn new(writer: SharedWriter) -> Self {
        Self { writer }
    }

    /// Emit an event carrying any serialisable payload.
    ///
    /// Blocks (asynchronously) when the response stream's socket buffer
    /// is full; backpressure deliberately stalls the emitting service.
    pub async fn emit<T: Serialize>(&self, name: &str, payload: &T) -> Result<(), WireError> {
        self.emit_raw(name, rmp_serde::to_vec(payload)?).await
    }

    /// Emit an event carrying an already-built value.
    pub async fn emit_value(&self, name: &str, payload: &Value) -> Result<(), WireError> {
        self.emit_raw(name, wire::encode_value(payload)?).await
    }

    async fn emit_raw(&self, name: &str, payload: Vec<u8>) -> Result<(), WireError> {
        let frame = Frame::Event {
            name: name.to_string(),
            payload,
        };
        let mut writer = self.writer.lock().await;
        frame.write_to(&mut *writer).await
    }
}

/// Decode the argument at `index` into its declared parameter type.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| anyhow!("missing argument {index}"))?;
    rmpv::ext::from_value(value.clone()).map_err(|e| anyhow!("argument {index}: {e}"))
}

/// Convert a typed value into a wire argument.
pub fn to_arg<T: Serialize>(value: T) -> anyhow::Result<Value> {
    rmpv::ext::to_value(value).map_err(|e| anyhow!("unserialisable argument: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adder;

    #[async_trait]
    impl BridgedService for Adder {
        fn methods(table: &mut MethodTable<Self>) {
            table.register("add", |_svc, args| async move {
                let a: i64 = arg(&args, 0)?;
                let b: i64 = arg(&args, 1)?;
                Ok(Some(Value::from(a + b)))
            });
            table.register("nothing", |_svc, _args| async move { Ok(None) });
        }
    }

    fn writer_stub() -> SharedWriter {
        Arc::new(Mutex::new(
            Box::new(Vec::<u8>::new()) as Box<dyn AsyncWrite + Send + Unpin>
        ))
    }

    #[tokio::test]
    async fn table_dispatches_by_name() {
        let host = HostedService::new(Adder);
        let args = vec![Value::from(5), Value::from(3)];
        let result = host.dispatch("add", args).unwrap().await.unwrap();
        assert_eq!(result, Some(Value::from(8)));
    }

    #[tokio::test]
    async fn unknown_method_yields_none() {
        let host = HostedService::new(Adder);
        assert!(host.dispatch("absent", Vec::new()).is_none());
    }

    #[tokio::test]
    async fn valueless_method_resolves_to_absent() {
        let host = HostedService::new(Adder);
        let result = host.dispatch("nothing", Vec::new()).unwrap().await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn missing_argument_reports_its_index() {
        let host = HostedService::new(Adder);
        let err = host
            .dispatch("add", vec![Value::from(1)])
            .unwrap()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("argument 1"));
    }

    #[test]
    fn catalog_rejects_unknown_identifiers() {
        let mut catalog = ServiceCatalog::new();
        catalog.register("adder", |_events| {
            Ok(Box::new(HostedService::new(Adder)) as Box<dyn ServiceHost>)
        });
        assert!(catalog.construct("adder", EventSink::new(writer_stub())).is_ok());
        let err = catalog
            .construct("missing", EventSink::new(writer_stub()))
            .unwrap_err();
        assert!(err.to_string().contains("unknown service identifier"));
    }
}
