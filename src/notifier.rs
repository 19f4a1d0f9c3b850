//! Notifications for sessions that need a human
//!
//! Driven entirely by the registry's event bus: a `WaitingForInput` event
//! raises a notification, a `NotificationCancelled` event retracts it.

use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::registry::SessionEvent;
use crate::session::{GroupId, SessionId};

pub trait NotificationSink: Send + Sync {
    fn notify_waiting(&self, id: &SessionId, display_name: &str, group: Option<&GroupId>);
    fn cancel(&self, id: &SessionId);
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify_waiting(&self, id: &SessionId, display_name: &str, group: Option<&GroupId>) {
        match group {
            Some(group) => tracing::info!("{} ({}, group {}) is waiting for input", display_name, id, group),
            None => tracing::info!("{} ({}) is waiting for input", display_name, id),
        }
    }

    fn cancel(&self, id: &SessionId) {
        tracing::debug!("Notification for {} cancelled", id);
    }
}

/// Native desktop notifications via `osascript` (macOS) or `notify-send`
#[derive(Debug, Default)]
pub struct DesktopNotifier {
    shown: Mutex<HashSet<SessionId>>,
}

impl DesktopNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn show(title: &str, body: &str) {
        let mut cmd = if cfg!(target_os = "macos") {
            let script = format!(
                "display notification {:?} with title {:?}",
                body, title
            );
            let mut cmd = Command::new("osascript");
            cmd.arg("-e").arg(script);
            cmd
        } else {
            let mut cmd = Command::new("notify-send");
            cmd.args(["--app-name=agentdeck", title, body]);
            cmd
        };

        // Fire and forget; the child is reaped on a helper thread
        match cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => tracing::debug!("Desktop notification unavailable: {}", e),
        }
    }
}

impl NotificationSink for DesktopNotifier {
    fn notify_waiting(&self, id: &SessionId, display_name: &str, group: Option<&GroupId>) {
        let newly_shown = self
            .shown
            .lock()
            .map(|mut shown| shown.insert(id.clone()))
            .unwrap_or(true);
        if !newly_shown {
            return;
        }
        let body = match group {
            Some(_) => format!("{} (group session) is waiting for input", display_name),
            None => format!("{} is waiting for input", display_name),
        };
        Self::show("agentdeck", &body);
    }

    fn cancel(&self, id: &SessionId) {
        // Delivered notifications can't be retracted portably; forgetting the
        // id lets the next wait notify again.
        if let Ok(mut shown) = self.shown.lock() {
            shown.remove(id);
        }
    }
}

/// Forward registry events to `sink` until the bus closes.
pub async fn run_notifier(
    mut events: broadcast::Receiver<SessionEvent>,
    sink: Arc<dyn NotificationSink>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::WaitingForInput {
                id,
                display_name,
                group,
            }) => sink.notify_waiting(&id, &display_name, group.as_ref()),
            Ok(SessionEvent::NotificationCancelled { id }) => sink.cancel(&id),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Notifier lagged behind by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Notifier stopped");
}
