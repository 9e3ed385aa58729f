//! Progress and status reporting for sync sessions.
//!
//! The engine never prints. It reports through an [`EventSink`], which front
//! ends implement (console spinner, tray notifications). Two bindings ship
//! with the core: [`TracingSink`] for logs and [`ChannelSink`] for async
//! consumers.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::ErrorKind;
use crate::models::{SyncPhase, SyncSummary};

/// Consumer of session events. Called from the session's worker thread.
pub trait EventSink: Send + Sync {
    fn on_phase(&self, phase: SyncPhase, detail: &str);

    fn on_warning(&self, message: &str, path: Option<&str>);

    /// Informational messages such as "nothing to commit".
    fn on_info(&self, message: &str) {
        let _ = message;
    }

    fn on_error(&self, kind: ErrorKind, message: &str);

    fn on_complete(&self, summary: &SyncSummary);
}

/// Serializable form of every sink callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Phase { phase: SyncPhase, detail: String },
    Warning { message: String, path: Option<String> },
    Info { message: String },
    Error { kind: ErrorKind, message: String },
    Complete { summary: SyncSummary },
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_phase(&self, phase: SyncPhase, detail: &str) {
        info!(%phase, detail, "sync phase");
    }

    fn on_warning(&self, message: &str, path: Option<&str>) {
        warn!(path, "{}", message);
    }

    fn on_info(&self, message: &str) {
        info!("{}", message);
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        error!(%kind, "{}", message);
    }

    fn on_complete(&self, summary: &SyncSummary) {
        info!(
            session = %summary.session_id,
            direction = %summary.direction,
            changed = summary.changed_paths.len(),
            conflicts = summary.conflicted_paths.len(),
            no_changes = summary.no_changes,
            commit = summary.commit.as_deref().unwrap_or("-"),
            "sync complete"
        );
    }
}

/// Forwards events to an unbounded tokio channel. Sends after the receiver
/// is dropped are ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_phase(&self, phase: SyncPhase, detail: &str) {
        self.send(SyncEvent::Phase {
            phase,
            detail: detail.to_string(),
        });
    }

    fn on_warning(&self, message: &str, path: Option<&str>) {
        self.send(SyncEvent::Warning {
            message: message.to_string(),
            path: path.map(str::to_string),
        });
    }

    fn on_info(&self, message: &str) {
        self.send(SyncEvent::Info {
            message: message.to_string(),
        });
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.send(SyncEvent::Error {
            kind,
            message: message.to_string(),
        });
    }

    fn on_complete(&self, summary: &SyncSummary) {
        self.send(SyncEvent::Complete {
            summary: summary.clone(),
        });
    }
}

/// Fans events out to several sinks in order.
pub struct MultiSink(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for MultiSink {
    fn on_phase(&self, phase: SyncPhase, detail: &str) {
        self.0.iter().for_each(|s| s.on_phase(phase, detail));
    }

    fn on_warning(&self, message: &str, path: Option<&str>) {
        self.0.iter().for_each(|s| s.on_warning(message, path));
    }

    fn on_info(&self, message: &str) {
        self.0.iter().for_each(|s| s.on_info(message));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.0.iter().for_each(|s| s.on_error(kind, message));
    }

    fn on_complete(&self, summary: &SyncSummary) {
        self.0.iter().for_each(|s| s.on_complete(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncDirection;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.on_phase(SyncPhase::Scanning, "scanning root");
        sink.on_warning("conflict resolved", Some("retail/WTF/config.wtf"));
        sink.on_info("no changes");
        sink.on_error(ErrorKind::AuthRequired, "no credentials");
        sink.on_complete(&SyncSummary::new(Uuid::new_v4(), SyncDirection::Push));
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 5);
        assert!(matches!(
            events[0],
            SyncEvent::Phase {
                phase: SyncPhase::Scanning,
                ..
            }
        ));
        assert!(matches!(
            &events[1],
            SyncEvent::Warning { path: Some(p), .. } if p == "retail/WTF/config.wtf"
        ));
        assert!(matches!(events[4], SyncEvent::Complete { .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let event = SyncEvent::Error {
            kind: ErrorKind::MergeConflict,
            message: "merge conflict".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "merge_conflict");

        let phase = serde_json::to_value(SyncEvent::Phase {
            phase: SyncPhase::Transferring,
            detail: String::new(),
        })
        .unwrap();
        assert_eq!(phase["phase"], "transferring");
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        sink.on_info("nobody listening");
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let (a, mut rx_a) = ChannelSink::channel();
        let (b, mut rx_b) = ChannelSink::channel();
        let multi = MultiSink(vec![std::sync::Arc::new(a), std::sync::Arc::new(b)]);
        multi.on_info("hello");
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
