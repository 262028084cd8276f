//! Log plumbing for both ends of a session.
//!
//! The runner forwards its structured log records to the manager inside
//! Log frames; the manager replays them into its own `tracing`
//! subscriber at the decoded severity. Severities use the wire spellings
//! `Trace|Debug|Information|Warning|Error|Critical|None`; an unknown
//! spelling degrades to Information on the manager side, and `None`
//! records are dropped entirely.

use std::fmt::Write as _;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{debug, error, info, trace, warn, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::service::SharedWriter;
use crate::wire::Frame;

/// Wire spelling for a `tracing` level.
pub fn severity_for_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "Trace",
        Level::DEBUG => "Debug",
        Level::INFO => "Information",
        Level::WARN => "Warning",
        Level::ERROR => "Error",
    }
}

/// Replay a forwarded record into the manager's subscriber.
///
/// The dedicated target keeps forwarded records distinguishable from the
/// manager's own diagnostics.
pub fn forward_to_tracing(severity: &str, message: &str) {
    match severity {
        "Trace" => trace!(target: "ipc_bridge::runner", "{message}"),
        "Debug" => debug!(target: "ipc_bridge::runner", "{message}"),
        "Information" => info!(target: "ipc_bridge::runner", "{message}"),
        "Warning" => warn!(target: "ipc_bridge::runner", "{message}"),
        "Error" | "Critical" => error!(target: "ipc_bridge::runner", "{message}"),
        "None" => {}
        _ => info!(target: "ipc_bridge::runner", "{message}"),
    }
}

/// Runner-side `tracing` layer that turns records into Log frames.
///
/// The layer only buffers the formatted fields and hands them to an
/// unbounded channel; a separate writer task drains the channel and
/// writes frames under the response stream's shared write lock. The
/// writer task emits no tracing records of its own.
pub struct ForwardLayer {
    tx: mpsc::UnboundedSender<(String, String)>,
}

/// Install the forwarding machinery over `writer`.
///
/// Returns the layer (to be composed into the runner's subscriber) and
/// the drain task's handle. The task ends on its own once the channel or
/// the stream closes.
pub fn spawn_forwarder(writer: SharedWriter) -> (ForwardLayer, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
    let handle = tokio::spawn(async move {
        while let Some((severity, message)) = rx.recv().await {
            let frame = Frame::Log { severity, message };
            let mut stream = writer.lock().await;
            if frame.write_to(&mut *stream).await.is_err() {
                break;
            }
        }
    });
    (ForwardLayer { tx }, handle)
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let severity = severity_for_level(event.metadata().level());
        let _ = self.tx.send((severity.to_string(), visitor.rendered));
    }
}

/// Buffers an event's fields into one display line, `message` first and
/// the remaining fields appended as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    rendered: String,
}

impl MessageVisitor {
    fn push_message(&mut self, text: &str) {
        if self.rendered.is_empty() {
            self.rendered.push_str(text);
        } else {
            let fields = std::mem::take(&mut self.rendered);
            self.rendered.push_str(text);
            self.rendered.push(' ');
            self.rendered.push_str(&fields);
        }
    }

    fn push_field(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.rendered.is_empty() {
            self.rendered.push(' ');
        }
        let _ = write!(self.rendered, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.push_message(&format!("{value:?}"));
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.push_message(value);
        } else {
            self.push_field(field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWrite;
    use tokio::sync::Mutex;
    use tracing_subscriber::prelude::*;

    #[test]
    fn severity_spellings_match_wire_contract() {
        assert_eq!(severity_for_level(&Level::TRACE), "Trace");
        assert_eq!(severity_for_level(&Level::DEBUG), "Debug");
        assert_eq!(severity_for_level(&Level::INFO), "Information");
        assert_eq!(severity_for_level(&Level::WARN), "Warning");
        assert_eq!(severity_for_level(&Level::ERROR), "Error");
    }

    #[tokio::test]
    async fn forward_layer_emits_log_frames() {
        let (near, mut far) = tokio::io::duplex(4096);
        let writer: SharedWriter = Arc::new(Mutex::new(
            Box::new(near) as Box<dyn AsyncWrite + Send + Unpin>
        ));
        let (layer, _task) = spawn_forwarder(writer);

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("buffer nearly full");
        });

        let frame = Frame::read_from(&mut far).await.unwrap();
        match frame {
            Frame::Log { severity, message } => {
                assert_eq!(severity, "Warning");
                assert!(message.contains("buffer nearly full"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
