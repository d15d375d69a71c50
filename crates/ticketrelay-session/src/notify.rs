// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator notifications (connection changes, failed tickets).

use std::fmt;

use tracing::{error, info, warn};

use ticketrelay_core::human_errors::{HumanError, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

impl From<Severity> for NotifyLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Transient => NotifyLevel::Warning,
            Severity::ActionRequired | Severity::Permanent => NotifyLevel::Error,
        }
    }
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Warning => "warning",
            NotifyLevel::Error => "error",
        })
    }
}

/// Fire-and-forget user notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str, level: NotifyLevel);

    /// Notify with a humanized error: its message and suggestion.
    fn notify_error(&self, title: &str, human: &HumanError) {
        let message = format!("{} {}", human.message, human.suggestion);
        self.notify(title, &message, human.severity.into());
    }
}

/// Notifier that writes to the log. Used when no desktop notifier is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info => info!(title, "{message}"),
            NotifyLevel::Warning => warn!(title, "{message}"),
            NotifyLevel::Error => error!(title, "{message}"),
        }
    }
}
