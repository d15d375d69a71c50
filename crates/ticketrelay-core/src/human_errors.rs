// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for restaurant staff.
//
// Operators see these in desktop notifications when a ticket fails or the
// agent loses its server. Every technical error maps to a plain sentence
// plus a concrete thing to try.

use crate::error::RelayError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip or timeout; the next job or reconnect may succeed.
    Transient,
    /// Someone has to act (power on the printer, add paper, fix settings).
    ActionRequired,
    /// Retrying will not help.
    Permanent,
}

/// A human-readable error with a plain message and an actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain summary (notification title body).
    pub message: String,
    /// What the operator should try.
    pub suggestion: String,
    /// Whether simply trying again may succeed.
    pub retriable: bool,
    pub severity: Severity,
}

/// Convert a `RelayError` into a `HumanError` suitable for front-of-house staff.
pub fn humanize_error(err: &RelayError) -> HumanError {
    match err {
        RelayError::ConfigIncomplete(missing) => HumanError {
            message: "The print agent is not set up yet.".into(),
            suggestion: format!(
                "Fill in {} in the agent settings file, then restart the agent.",
                missing.join(", ")
            ),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RelayError::InvalidPrinterConfig { name, reason } => HumanError {
            message: format!("Printer \"{name}\" is not configured correctly."),
            suggestion: format!("Check the printer settings in the back office ({reason})."),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RelayError::Settings(_) => HumanError {
            message: "The agent could not read or save its settings.".into(),
            suggestion: "Check that the settings file exists and is writable.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RelayError::PrinterNotFound(name) => HumanError {
            message: format!("There is no printer called \"{name}\" on this computer."),
            suggestion: "Check the printer name in the back office matches the agent's printer list.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RelayError::Network(detail) => humanize_network_error(detail),

        RelayError::Timeout(_) => HumanError {
            message: "The printer took too long to answer.".into(),
            suggestion: "Check the printer is switched on and has paper, then print again.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RelayError::DeviceNotFound(_) => HumanError {
            message: "The USB printer isn't connected.".into(),
            suggestion: "Check the USB cable at both ends and that the printer is switched on.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        RelayError::PrinterRejected(detail) => HumanError {
            message: "The printer refused the ticket.".into(),
            suggestion: format!("The printer may be busy or in an error state. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },

        RelayError::Spooler(_) => HumanError {
            message: "The computer's print queue had a problem.".into(),
            suggestion: "Open the printer queue on this computer and clear any stuck documents.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },

        RelayError::Discovery(_) => HumanError {
            message: "We couldn't search for printers.".into(),
            suggestion: "Make sure this computer is on the same network as the printers.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RelayError::Protocol(_) => HumanError {
            message: "The server sent a message the agent didn't understand.".into(),
            suggestion: "Update the print agent to the latest version.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },

        RelayError::Connection(_) => HumanError {
            message: "The connection to the server dropped.".into(),
            suggestion: "The agent will reconnect by itself. Check the internet connection if this keeps happening.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RelayError::ReconnectExhausted(attempts) => HumanError {
            message: "The print agent lost its connection to the server.".into(),
            suggestion: format!(
                "It stopped retrying after {attempts} attempts. Check the internet connection and restart the agent."
            ),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RelayError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::PermissionDenied => HumanError {
                message: "The agent doesn't have permission to do that.".into(),
                suggestion: "Run the agent as a user allowed to print on this computer.".into(),
                retriable: false,
                severity: Severity::ActionRequired,
            },
            _ => HumanError {
                message: "Something went wrong on this computer.".into(),
                suggestion: format!("Try again. If it keeps happening, restart the agent. ({io_err})"),
                retriable: true,
                severity: Severity::Transient,
            },
        },

        RelayError::Serialization(_) => HumanError {
            message: "Some data couldn't be read.".into(),
            suggestion: "The settings file may be damaged. Check it is valid JSON.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },
    }
}

/// Network error details carry the OS reason; pick out the common ones.
fn humanize_network_error(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("refused") {
        return HumanError {
            message: "The printer refused the connection.".into(),
            suggestion: "Check the printer's IP address and port in the settings.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        };
    }

    if lower.contains("unreachable") || lower.contains("no route") {
        return HumanError {
            message: "The printer can't be reached on the network.".into(),
            suggestion: "Check the network cable and that the printer is switched on.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        };
    }

    HumanError {
        message: "A network problem stopped the ticket from printing.".into(),
        suggestion: format!("Check the printer is on and connected, then try again. ({detail})"),
        retriable: true,
        severity: Severity::Transient,
    }
}
