// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Domain types shared between the print and session crates.

use std::fmt;

use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{RelayError, Result};

/// Default raw TCP port for thermal printers (JetDirect).
pub const RAW_PORT: u16 = 9100;

/// Default IPP port.
pub const IPP_PORT: u16 = 631;

/// Resource path used when an IPP printer config does not name one.
pub const DEFAULT_IPP_PATH: &str = "/ipp/print";

/// Printer name that resolves to the registry's default printer.
pub const DEFAULT_PRINTER_SENTINEL: &str = "default";

// ---------------------------------------------------------------------------
// Printer configuration
// ---------------------------------------------------------------------------

/// Physical connection kind of a configured printer.
///
/// The serialized names are the ones the back office already stores; the
/// aliases accept the longer descriptive spellings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[default]
    #[serde(rename = "network", alias = "network-raw", alias = "raw")]
    NetworkRaw,
    #[serde(rename = "ipp", alias = "network-ipp")]
    Ipp,
    #[serde(rename = "windows", alias = "spooler", alias = "os-spooler")]
    Spooler,
    #[serde(rename = "usb")]
    Usb,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::NetworkRaw => "network",
            TransportKind::Ipp => "ipp",
            TransportKind::Spooler => "windows",
            TransportKind::Usb => "usb",
        }
    }

    /// Whether the device understands the thermal command stream.
    pub fn is_thermal(self) -> bool {
        matches!(self, TransportKind::NetworkRaw | TransportKind::Usb)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one printer, as configured in the back office.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default, alias = "host", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// OS print queue name for spooler printers.
    #[serde(
        default,
        rename = "windowsName",
        alias = "queueName",
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_usb_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub vendor_id: Option<u16>,
    #[serde(
        default,
        deserialize_with = "deserialize_usb_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub product_id: Option<u16>,
    #[serde(default, alias = "isDefault")]
    pub default: bool,
}

impl PrinterConfig {
    /// Validate the transport-specific fields into a typed address.
    pub fn address(&self) -> Result<PrinterAddress> {
        match self.kind {
            TransportKind::NetworkRaw => Ok(PrinterAddress::Network {
                host: self.required_host()?,
                port: self.port.unwrap_or(RAW_PORT),
            }),
            TransportKind::Ipp => {
                let path = match self.path.as_deref().map(str::trim) {
                    None | Some("") => DEFAULT_IPP_PATH.to_string(),
                    Some(p) if p.starts_with('/') => p.to_string(),
                    Some(p) => format!("/{p}"),
                };
                Ok(PrinterAddress::Ipp {
                    host: self.required_host()?,
                    port: self.port.unwrap_or(IPP_PORT),
                    path,
                })
            }
            TransportKind::Spooler => {
                // Queue names usually match the printer name; only insist
                // on an explicit one when the name is blank too.
                let queue = self
                    .queue_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .unwrap_or(self.name.trim());
                if queue.is_empty() {
                    return Err(self.invalid("missing print queue name"));
                }
                Ok(PrinterAddress::Spooler {
                    queue: queue.to_string(),
                })
            }
            TransportKind::Usb => Ok(PrinterAddress::Usb {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
            }),
        }
    }

    fn required_host(&self) -> Result<String> {
        match self.ip.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => Ok(host.to_string()),
            _ => Err(self.invalid("missing ip address")),
        }
    }

    fn invalid(&self, reason: &str) -> RelayError {
        RelayError::InvalidPrinterConfig {
            name: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Validated, transport-specific address of a printer.
///
/// Serializes to the address shape reported in status snapshots, e.g.
/// `{"ip": "10.0.0.5", "port": 9100}` or `{"windowsName": "Bar"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PrinterAddress {
    Network {
        #[serde(rename = "ip")]
        host: String,
        port: u16,
    },
    Ipp {
        #[serde(rename = "ip")]
        host: String,
        port: u16,
        path: String,
    },
    Spooler {
        #[serde(rename = "windowsName")]
        queue: String,
    },
    Usb {
        #[serde(rename = "vendorId", skip_serializing_if = "Option::is_none")]
        vendor_id: Option<u16>,
        #[serde(rename = "productId", skip_serializing_if = "Option::is_none")]
        product_id: Option<u16>,
    },
}

impl fmt::Display for PrinterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrinterAddress::Network { host, port } => write!(f, "{host}:{port}"),
            PrinterAddress::Ipp { host, port, path } => write!(f, "ipp://{host}:{port}{path}"),
            PrinterAddress::Spooler { queue } => write!(f, "queue {queue}"),
            PrinterAddress::Usb {
                vendor_id,
                product_id,
            } => match (vendor_id, product_id) {
                (Some(v), Some(p)) => write!(f, "usb {v:04x}:{p:04x}"),
                (Some(v), None) => write!(f, "usb {v:04x}:*"),
                _ => f.write_str("usb (first printer)"),
            },
        }
    }
}

/// USB ids arrive as numbers, decimal strings or `0x`-prefixed hex strings.
pub fn parse_usb_id(raw: &str) -> std::result::Result<Option<u16>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    parsed
        .map(Some)
        .map_err(|e| format!("invalid USB id '{trimmed}': {e}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UsbIdRepr {
    Number(u16),
    Text(String),
}

fn deserialize_usb_id<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<UsbIdRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(UsbIdRepr::Number(n)) => Ok(Some(n)),
        Some(UsbIdRepr::Text(s)) => parse_usb_id(&s).map_err(D::Error::custom),
    }
}

/// Read a printer list entry by entry. An entry that does not parse is
/// logged and skipped; the rest of the list still applies.
pub fn deserialize_printer_list<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<PrinterConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    let printers = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let name = entry
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();
            match serde_json::from_value::<PrinterConfig>(entry) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(index, printer = %name, error = %e, "skipping unreadable printer entry");
                    None
                }
            }
        })
        .collect();
    Ok(printers)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// How a job's payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Printer-native bytes, sent untouched.
    #[serde(alias = "escpos")]
    Raw,
    Text,
    #[serde(alias = "html")]
    Markup,
}

/// Opaque job id assigned by the server. Servers send either a string or a
/// number; the result carries it back in the same form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobId {
    Text(String),
    Number(serde_json::Number),
}

impl JobId {
    /// Recover an id from an arbitrary JSON value, if it has a usable shape.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(JobId::Text(s.clone())),
            serde_json::Value::Number(n) => Some(JobId::Number(n.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Text(s) => f.write_str(s),
            JobId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId::Text(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId::Text(value)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        JobId::Number(value.into())
    }
}

impl PartialEq<&str> for JobId {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, JobId::Text(s) if s == other)
    }
}

/// One job received from the server. Lives for a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub job_id: JobId,
    /// Empty or `"default"` targets the default printer.
    pub printer_name: String,
    pub content_kind: ContentKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Error,
}

/// Outcome of one job, reported back exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl JobResult {
    pub fn success(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Success,
            error_message: None,
            timestamp: now_millis(),
        }
    }

    pub fn failure(job_id: impl Into<JobId>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Error,
            error_message: Some(message.into()),
            timestamp: now_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Status and discovery
// ---------------------------------------------------------------------------

/// One registry entry as reported in `AGENT_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub connected: bool,
    #[serde(rename = "config")]
    pub address: PrinterAddress,
}

/// Where a discovered printer was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Mdns,
    Spooler,
    Usb,
}

/// A printer found by discovery, shaped so the back office can turn it
/// straight into a `PrinterConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPrinter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    #[serde(flatten)]
    pub address: PrinterAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_and_model: Option<String>,
    pub source: DiscoverySource,
}

/// Current wall-clock time as Unix milliseconds, the wire timestamp format.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
