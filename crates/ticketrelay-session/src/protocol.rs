// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Wire envelopes exchanged with the job-issuing server.
//
// Every message is a JSON object `{"type": "...", "payload": {...}}`.
// Timestamps are Unix milliseconds.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ticketrelay_core::error::{RelayError, Result};
use ticketrelay_core::types::{
    ContentKind, DiscoveredPrinter, JobId, JobResult, JobStatus, PrintJob, PrinterConfig,
    PrinterStatus, deserialize_printer_list, now_millis,
};

/// Envelope as it arrives, before the payload is interpreted.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    PrintJob(PrintJobPayload),
    /// A PRINT_JOB whose payload did not parse but whose id did. Still
    /// answered with an error result.
    RejectedJob { job_id: JobId, reason: String },
    Ping,
    ConfigUpdate(ConfigUpdatePayload),
    PrinterTest(PrinterTestPayload),
    DiscoverPrinters(DiscoverPayload),
    /// A kind this agent does not know. Ignored.
    Unknown(String),
}

impl Inbound {
    pub fn kind(&self) -> &str {
        match self {
            Inbound::PrintJob(_) | Inbound::RejectedJob { .. } => "PRINT_JOB",
            Inbound::Ping => "PING",
            Inbound::ConfigUpdate(_) => "CONFIG_UPDATE",
            Inbound::PrinterTest(_) => "PRINTER_TEST",
            Inbound::DiscoverPrinters(_) => "DISCOVER_PRINTERS",
            Inbound::Unknown(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJobPayload {
    pub job_id: JobId,
    #[serde(default)]
    pub printer_name: Option<String>,
    /// Kept as a string so an unsupported value still yields a job result.
    #[serde(default)]
    pub content_type: String,
    /// Base64 of the document.
    #[serde(default)]
    pub content: String,
}

impl PrintJobPayload {
    /// Validate the content type and decode the payload.
    pub fn into_job(self) -> Result<PrintJob> {
        let content_kind = parse_content_kind(&self.content_type)?;
        let payload = decode_content(content_kind, &self.content)?;
        Ok(PrintJob {
            job_id: self.job_id,
            printer_name: self.printer_name.unwrap_or_default(),
            content_kind,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigUpdatePayload {
    #[serde(default, deserialize_with = "deserialize_printer_list")]
    pub printers: Vec<PrinterConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterTestPayload {
    #[serde(default)]
    pub printer_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverPayload {
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let envelope: RawEnvelope = serde_json::from_str(text)
        .map_err(|e| RelayError::Protocol(format!("malformed envelope: {e}")))?;

    // PING and DISCOVER_PRINTERS may omit the payload entirely.
    let payload = match envelope.payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    let inbound = match envelope.kind.as_str() {
        "PRINT_JOB" => {
            let job_id = payload.get("jobId").and_then(JobId::from_value);
            match (payload_of(&envelope.kind, payload), job_id) {
                (Ok(job), _) => Inbound::PrintJob(job),
                (Err(e), Some(job_id)) => Inbound::RejectedJob {
                    job_id,
                    reason: e.to_string(),
                },
                (Err(e), None) => return Err(e),
            }
        }
        "PING" => Inbound::Ping,
        "CONFIG_UPDATE" => Inbound::ConfigUpdate(payload_of(&envelope.kind, payload)?),
        "PRINTER_TEST" => Inbound::PrinterTest(payload_of(&envelope.kind, payload)?),
        "DISCOVER_PRINTERS" => Inbound::DiscoverPrinters(payload_of(&envelope.kind, payload)?),
        _ => Inbound::Unknown(envelope.kind),
    };
    Ok(inbound)
}

fn payload_of<T: for<'de> Deserialize<'de>>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| RelayError::Protocol(format!("bad {kind} payload: {e}")))
}

fn parse_content_kind(raw: &str) -> Result<ContentKind> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| RelayError::Protocol(format!("unsupported content type '{raw}'")))
}

/// Decode job content. Raw content must be base64. Text and markup are
/// decoded only when they are the exact base64 of readable text, so a
/// literal word that happens to be valid base64 survives untouched.
fn decode_content(kind: ContentKind, content: &str) -> Result<Vec<u8>> {
    let trimmed = content.trim();
    match kind {
        ContentKind::Raw => STANDARD
            .decode(trimmed)
            .map_err(|e| RelayError::Protocol(format!("raw content is not valid base64: {e}"))),
        ContentKind::Text | ContentKind::Markup => {
            Ok(decode_text(trimmed).unwrap_or_else(|| content.as_bytes().to_vec()))
        }
    }
}

fn decode_text(encoded: &str) -> Option<Vec<u8>> {
    let bytes = STANDARD.decode(encoded).ok()?;
    let text = std::str::from_utf8(&bytes).ok()?;
    let readable = text
        .chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'));
    (readable && STANDARD.encode(&bytes) == encoded).then_some(bytes)
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub printer_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResult {
    pub printers: Vec<DiscoveredPrinter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub version: String,
    pub platform: String,
    pub printers: Vec<PrinterStatus>,
    pub timestamp: i64,
}

impl AgentStatus {
    pub fn new(printers: Vec<PrinterStatus>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            printers,
            timestamp: now_millis(),
        }
    }
}

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    PrintResult(JobResult),
    Pong { timestamp: i64 },
    TestResult(TestResult),
    DiscoverResult(DiscoverResult),
    AgentStatus(AgentStatus),
    Heartbeat { timestamp: i64 },
}

impl Outbound {
    pub fn pong() -> Self {
        Outbound::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn heartbeat() -> Self {
        Outbound::Heartbeat {
            timestamp: now_millis(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_job_decodes_base64_text() {
        let inbound = parse_inbound(
            r#"{"type":"PRINT_JOB","payload":{"jobId":"j1","printerName":"Kitchen","contentType":"text","content":"SGVsbG8="}}"#,
        )
        .expect("parsed");
        let Inbound::PrintJob(payload) = inbound else {
            panic!("expected PRINT_JOB");
        };
        let job = payload.into_job().expect("job");
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.printer_name, "Kitchen");
        assert_eq!(job.content_kind, ContentKind::Text);
        assert_eq!(job.payload, b"Hello");
    }

    #[test]
    fn escpos_alias_and_missing_printer_name() {
        let payload = PrintJobPayload {
            job_id: "j2".into(),
            printer_name: None,
            content_type: "ESCPOS".into(),
            content: STANDARD.encode([0x1b, 0x40]),
        };
        let job = payload.into_job().expect("job");
        assert_eq!(job.content_kind, ContentKind::Raw);
        assert_eq!(job.printer_name, "");
        assert_eq!(job.payload, vec![0x1b, 0x40]);
    }

    #[test]
    fn plain_text_content_is_accepted_literally() {
        let payload = PrintJobPayload {
            job_id: "j3".into(),
            printer_name: None,
            content_type: "html".into(),
            content: "<p>Soup!</p>".into(),
        };
        assert_eq!(payload.into_job().expect("job").payload, b"<p>Soup!</p>");
    }

    #[test]
    fn plain_words_that_look_like_base64_stay_literal() {
        for word in ["Beer", "Soup", "Table12"] {
            let payload = PrintJobPayload {
                job_id: "j3".into(),
                printer_name: None,
                content_type: "text".into(),
                content: word.into(),
            };
            assert_eq!(payload.into_job().expect("job").payload, word.as_bytes(), "{word}");
        }

        let encoded = PrintJobPayload {
            job_id: "j3".into(),
            printer_name: None,
            content_type: "text".into(),
            content: STANDARD.encode("Beer x2\nSoup x1\n"),
        };
        assert_eq!(encoded.into_job().expect("job").payload, b"Beer x2\nSoup x1\n");
    }

    #[test]
    fn raw_content_must_be_base64() {
        let payload = PrintJobPayload {
            job_id: "j4".into(),
            printer_name: None,
            content_type: "raw".into(),
            content: "not base64!".into(),
        };
        assert!(matches!(payload.into_job(), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn unsupported_content_type_is_an_error() {
        let payload = PrintJobPayload {
            job_id: "j5".into(),
            printer_name: None,
            content_type: "pdf".into(),
            content: String::new(),
        };
        let err = payload.into_job().expect_err("pdf unsupported");
        assert!(err.to_string().contains("'pdf'"));
    }

    #[test]
    fn numeric_job_id_is_accepted() {
        let inbound = parse_inbound(
            r#"{"type":"PRINT_JOB","payload":{"jobId":42,"contentType":"escpos","content":"SGVsbG8="}}"#,
        )
        .expect("parsed");
        let Inbound::PrintJob(payload) = inbound else {
            panic!("expected PRINT_JOB");
        };
        assert_eq!(payload.job_id, JobId::from(42u64));
        assert_eq!(payload.into_job().expect("job").payload, b"Hello");
    }

    #[test]
    fn malformed_job_with_an_id_is_still_answered() {
        let inbound = parse_inbound(
            r#"{"type":"PRINT_JOB","payload":{"jobId":"j8","printerName":7,"content":"SGVsbG8="}}"#,
        )
        .expect("parsed");
        match inbound {
            Inbound::RejectedJob { job_id, reason } => {
                assert_eq!(job_id, "j8");
                assert!(reason.starts_with("protocol error: bad PRINT_JOB payload"), "{reason}");
            }
            other => panic!("expected RejectedJob, got {other:?}"),
        }
    }

    #[test]
    fn ping_without_payload() {
        assert_eq!(parse_inbound(r#"{"type":"PING"}"#).expect("ping"), Inbound::Ping);
    }

    #[test]
    fn discover_echoes_request_id() {
        let inbound =
            parse_inbound(r#"{"type":"DISCOVER_PRINTERS","payload":{"requestId":"r9"}}"#).expect("parsed");
        assert_eq!(
            inbound,
            Inbound::DiscoverPrinters(DiscoverPayload {
                request_id: Some("r9".into())
            })
        );
        assert_eq!(
            parse_inbound(r#"{"type":"DISCOVER_PRINTERS"}"#).expect("parsed"),
            Inbound::DiscoverPrinters(DiscoverPayload::default())
        );
    }

    #[test]
    fn config_update_carries_printers() {
        let inbound = parse_inbound(
            r#"{"type":"CONFIG_UPDATE","payload":{"printers":[{"name":"Bar","type":"network","ip":"10.0.0.6"}]}}"#,
        )
        .expect("parsed");
        let Inbound::ConfigUpdate(update) = inbound else {
            panic!("expected CONFIG_UPDATE");
        };
        assert_eq!(update.printers.len(), 1);
        assert_eq!(update.printers[0].name, "Bar");
    }

    #[test]
    fn config_update_keeps_good_printers_beside_a_bad_one() {
        let inbound = parse_inbound(
            r#"{"type":"CONFIG_UPDATE","payload":{"printers":[
                {"name":"A","type":"network","ip":"10.0.0.5"},
                {"name":"B","type":"usb","vendorId":"0xZZ"}
            ]}}"#,
        )
        .expect("parsed");
        let Inbound::ConfigUpdate(update) = inbound else {
            panic!("expected CONFIG_UPDATE");
        };
        let names: Vec<_> = update.printers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        assert_eq!(
            parse_inbound(r#"{"type":"REBOOT","payload":{}}"#).expect("parsed"),
            Inbound::Unknown("REBOOT".into())
        );
    }

    #[test]
    fn malformed_envelopes_are_protocol_errors() {
        for text in [
            "not json",
            r#"{"payload":{}}"#,
            r#"{"type":"PRINT_JOB","payload":{}}"#,
            r#"{"type":"PRINT_JOB","payload":{"jobId":true}}"#,
        ] {
            assert!(matches!(parse_inbound(text), Err(RelayError::Protocol(_))), "{text}");
        }
    }

    #[test]
    fn outbound_envelope_shapes() {
        let result = serde_json::to_value(Outbound::PrintResult(JobResult::failure("j1", "network error: x")))
            .expect("json");
        assert_eq!(result["type"], "PRINT_RESULT");
        assert_eq!(result["payload"]["jobId"], "j1");
        assert_eq!(result["payload"]["status"], "ERROR");

        let pong = serde_json::to_value(Outbound::pong()).expect("json");
        assert_eq!(pong["type"], "PONG");
        assert!(pong["payload"]["timestamp"].is_i64());

        let status = serde_json::to_value(Outbound::AgentStatus(AgentStatus::new(Vec::new()))).expect("json");
        assert_eq!(status["type"], "AGENT_STATUS");
        assert_eq!(status["payload"]["version"], env!("CARGO_PKG_VERSION"));

        let test = serde_json::to_value(Outbound::TestResult(TestResult {
            printer_name: "Bar".into(),
            status: JobStatus::Success,
            error: None,
        }))
        .expect("json");
        assert_eq!(test["type"], "TEST_RESULT");
        assert_eq!(test["payload"]["printerName"], "Bar");
        assert!(test["payload"].get("error").is_none());

        let heartbeat = Outbound::heartbeat().to_text().expect("text");
        assert!(heartbeat.starts_with(r#"{"type":"HEARTBEAT","payload":{"timestamp":"#));
    }
}
