//! User notification port.
//!
//! Playback failures surface as fire-and-forget notifications (toasts in
//! a GUI, log lines in the CLI). The engine never waits on the notifier.

use serde::Serialize;

/// Notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Port for showing notifications to the user.
///
/// Implementations must not block; the engine calls this from its
/// control path.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Info => tracing::info!(title = %notification.title, "{}", notification.message),
            Severity::Warning => {
                tracing::warn!(title = %notification.title, "{}", notification.message);
            }
            Severity::Error => {
                tracing::error!(title = %notification.title, "{}", notification.message);
            }
        }
    }
}

/// Notifier that discards everything. Useful for tests and headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}
