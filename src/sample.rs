//! Bundled sample service and its typed manager-side facade.
//!
//! The sample doubles as the demo-mode workload and as the hosted end of
//! the end-to-end tests: a tiny arithmetic/echo worker exercising every
//! call shape the bridge supports: valued results, raised events,
//! propagated failures, and abrupt process death.

use async_trait::async_trait;
use rmpv::Value;
use tracing::info;

use crate::error::BridgeError;
use crate::manager::{EventSubscription, ManagerConfig, ServiceManager};
use crate::service::{
    arg, BridgedService, EventSink, HostedService, MethodTable, ServiceCatalog, ServiceHost,
};

/// Identifier the sample service is registered under.
pub const SAMPLE_SERVICE_ID: &str = "sample-worker";

/// Event raised by [`echo`](SampleClient::echo) before it returns.
pub const MESSAGE_EVENT: &str = "on_message";

/// The hosted side of the sample.
pub struct SampleWorker {
    events: EventSink,
}

impl SampleWorker {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

#[async_trait]
impl BridgedService for SampleWorker {
    fn methods(table: &mut MethodTable<Self>) {
        table.register("add", |_svc, args| async move {
            let a: i64 = arg(&args, 0)?;
            let b: i64 = arg(&args, 1)?;
            Ok(Some(Value::from(a + b)))
        });

        // Raises the message event before returning, so a subscribed
        // manager observes the event no later than the reply.
        table.register("echo", |svc, args| async move {
            let text: String = arg(&args, 0)?;
            let message = format!("Echoed: {text}");
            svc.events.emit(MESSAGE_EVENT, &message).await?;
            Ok(Some(Value::from(message)))
        });

        table.register("throw_exception", |_svc, _args| async move {
            Err(anyhow::anyhow!("Test exception"))
        });

        table.register("hard_exit", |_svc, _args| async move { std::process::exit(1) });

        table.register("no_op", |_svc, _args| async move { Ok(None) });
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!("sample worker started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        info!("sample worker stopping");
        Ok(())
    }
}

/// Catalog holding every service this binary can host.
pub fn built_in_catalog() -> ServiceCatalog {
    let mut catalog = ServiceCatalog::new();
    catalog.register(SAMPLE_SERVICE_ID, |events| {
        Ok(Box::new(HostedService::new(SampleWorker::new(events))) as Box<dyn ServiceHost>)
    });
    catalog
}

/// Typed facade over a session hosting the sample service.
///
/// Each method delegates to the generic `invoke`; this is the shape a
/// code generator or macro would produce for a user-declared service
/// trait. `stop` routes through the manager's graceful shutdown rather
/// than a plain call.
pub struct SampleClient {
    manager: ServiceManager,
}

impl SampleClient {
    /// Spawn a runner hosting the sample service.
    pub async fn spawn(mut config: ManagerConfig) -> Result<Self, BridgeError> {
        config.service_id = SAMPLE_SERVICE_ID.to_string();
        let manager = ServiceManager::spawn(config).await?;
        Ok(Self { manager })
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    pub async fn add(&self, a: i64, b: i64) -> Result<i64, BridgeError> {
        self.manager
            .invoke_typed("add", vec![Value::from(a), Value::from(b)])
            .await
    }

    pub async fn echo(&self, text: &str) -> Result<String, BridgeError> {
        self.manager
            .invoke_typed("echo", vec![Value::from(text)])
            .await
    }

    pub async fn throw_exception(&self) -> Result<(), BridgeError> {
        self.manager.invoke_unit("throw_exception", Vec::new()).await
    }

    pub async fn hard_exit(&self) -> Result<(), BridgeError> {
        self.manager.invoke_unit("hard_exit", Vec::new()).await
    }

    pub async fn no_op(&self) -> Result<(), BridgeError> {
        self.manager.invoke_unit("no_op", Vec::new()).await
    }

    /// Subscribe to the message event raised by `echo`.
    pub fn on_message<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.manager.subscribe::<String, _>(MESSAGE_EVENT, callback)
    }

    pub fn unsubscribe(&self, subscription: &EventSubscription) {
        self.manager.unsubscribe(subscription);
    }

    /// Graceful stop: tears the whole session down.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.manager.shutdown().await
    }
}
