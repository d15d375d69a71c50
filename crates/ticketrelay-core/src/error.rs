// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Ticketrelay.

use thiserror::Error;

/// Top-level error type for all Ticketrelay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    // -- Configuration --
    #[error("configuration incomplete: missing {}", .0.join(", "))]
    ConfigIncomplete(Vec<&'static str>),

    #[error("invalid printer configuration '{name}': {reason}")]
    InvalidPrinterConfig { name: String, reason: String },

    #[error("settings error: {0}")]
    Settings(String),

    // -- Printer routing --
    #[error("printer not found: {0}")]
    PrinterNotFound(String),

    // -- Transport --
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("printer rejected the job: {0}")]
    PrinterRejected(String),

    #[error("print spooler error: {0}")]
    Spooler(String),

    #[error("printer discovery failed: {0}")]
    Discovery(String),

    // -- Session --
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    // -- Plumbing --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RelayError>;
