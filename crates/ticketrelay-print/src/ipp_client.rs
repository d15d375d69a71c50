// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Minimal IPP client.
//
// Print-Job requests are encoded by hand and POSTed over a plain HTTP/1.1
// connection, one connection per job. Only the four operation attributes a
// printer needs to accept a document are sent; this is not a conformant
// IPP implementation. The `ipp` crate is used only for the optional
// Get-Printer-Attributes lookup during discovery.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use ticketrelay_core::error::{RelayError, Result};

/// Overall timeout for one Print-Job round trip.
pub const IPP_TIMEOUT: Duration = Duration::from_secs(10);

// -- Wire constants (RFC 8010) --

const IPP_VERSION_MAJOR: u8 = 0x01;
const IPP_VERSION_MINOR: u8 = 0x01;

const OP_PRINT_JOB: u16 = 0x0002;

const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;
const TAG_END_OF_ATTRIBUTES: u8 = 0x03;

const VALUE_TAG_MIME_MEDIA_TYPE: u8 = 0x49;
const VALUE_TAG_URI: u8 = 0x45;
const VALUE_TAG_CHARSET: u8 = 0x47;
const VALUE_TAG_NATURAL_LANGUAGE: u8 = 0x48;

/// HTTP status codes accepted as "printer took the job".
const ACCEPTED_HTTP_STATUS: [u16; 2] = [200, 202];

pub const FORMAT_TEXT: &str = "text/plain";
pub const FORMAT_OCTET_STREAM: &str = "application/octet-stream";

/// Upper bound on the response we are willing to buffer.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Builder for the binary IPP request body.
struct IppRequest {
    buf: Vec<u8>,
}

impl IppRequest {
    fn new(operation: u16, request_id: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.push(IPP_VERSION_MAJOR);
        buf.push(IPP_VERSION_MINOR);
        buf.extend_from_slice(&operation.to_be_bytes());
        buf.extend_from_slice(&request_id.to_be_bytes());
        Self { buf }
    }

    fn group(&mut self, tag: u8) -> &mut Self {
        self.buf.push(tag);
        self
    }

    fn attr(&mut self, value_tag: u8, name: &str, value: &str) -> &mut Self {
        self.buf.push(value_tag);
        self.buf
            .extend_from_slice(&(name.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    fn finish(&mut self, document: &[u8]) -> Vec<u8> {
        self.buf.push(TAG_END_OF_ATTRIBUTES);
        self.buf.extend_from_slice(document);
        std::mem::take(&mut self.buf)
    }
}

/// `ipp://host:port/path` as sent in the `printer-uri` attribute.
pub fn printer_uri(host: &str, port: u16, path: &str) -> String {
    format!("ipp://{host}:{port}{path}")
}

/// Encode a Print-Job request: header, charset, natural-language,
/// printer-uri, document-format, end tag, then the document bytes.
pub fn encode_print_job(uri: &str, document_format: &str, document: &[u8]) -> Vec<u8> {
    IppRequest::new(OP_PRINT_JOB, 1)
        .group(TAG_OPERATION_ATTRIBUTES)
        .attr(VALUE_TAG_CHARSET, "attributes-charset", "utf-8")
        .attr(VALUE_TAG_NATURAL_LANGUAGE, "attributes-natural-language", "en")
        .attr(VALUE_TAG_URI, "printer-uri", uri)
        .attr(VALUE_TAG_MIME_MEDIA_TYPE, "document-format", document_format)
        .finish(document)
}

/// Submit one document to an IPP printer.
#[instrument(skip(document), fields(bytes = document.len()))]
pub async fn print_job(
    host: &str,
    port: u16,
    path: &str,
    document_format: &str,
    document: &[u8],
) -> Result<()> {
    print_job_with_timeout(host, port, path, document_format, document, IPP_TIMEOUT).await
}

pub async fn print_job_with_timeout(
    host: &str,
    port: u16,
    path: &str,
    document_format: &str,
    document: &[u8],
    timeout: Duration,
) -> Result<()> {
    let uri = printer_uri(host, port, path);
    tokio::time::timeout(timeout, post(host, port, path, &uri, document_format, document))
        .await
        .map_err(|_| {
            RelayError::Timeout(format!(
                "IPP printer {uri} did not answer within {}s",
                timeout.as_secs()
            ))
        })?
}

async fn post(
    host: &str,
    port: u16,
    path: &str,
    uri: &str,
    document_format: &str,
    document: &[u8],
) -> Result<()> {
    let body = encode_print_job(uri, document_format, document);
    let head = format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Content-Type: application/ipp\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );

    let addr = format!("{host}:{port}");
    info!(uri = %uri, format = document_format, "sending IPP Print-Job");
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| RelayError::Network(format!("connect to {addr}: {e}")))?;

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| RelayError::Network(format!("send to {addr}: {e}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| RelayError::Network(format!("send to {addr}: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| RelayError::Network(format!("flush to {addr}: {e}")))?;

    let response = read_response(&mut stream, &addr).await?;
    let status = parse_status_line(&response).ok_or_else(|| {
        RelayError::Protocol(format!("malformed HTTP response from {addr}"))
    })?;

    if !ACCEPTED_HTTP_STATUS.contains(&status) {
        warn!(uri = %uri, status, "IPP printer rejected request");
        return Err(RelayError::PrinterRejected(format!("HTTP status {status}")));
    }

    // The IPP status sits in bytes 2..4 of the body when one is sent.
    if let Some(ipp_status) = ipp_status_code(&response)
        && ipp_status > 0x00FF
    {
        warn!(uri = %uri, ipp_status, "IPP printer returned error status");
        return Err(RelayError::PrinterRejected(format!(
            "IPP status 0x{ipp_status:04x}"
        )));
    }

    info!(uri = %uri, status, "IPP job accepted");
    Ok(())
}

async fn read_response(stream: &mut TcpStream, addr: &str) -> Result<Vec<u8>> {
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| RelayError::Network(format!("read from {addr}: {e}")))?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() >= MAX_RESPONSE_BYTES || response_complete(&response) {
            break;
        }
    }
    debug!(bytes = response.len(), "IPP response received");
    Ok(response)
}

/// A response is complete once the headers and `Content-Length` bytes of
/// body have arrived. Without a length we read to end-of-stream.
fn response_complete(data: &[u8]) -> bool {
    let Some(header_end) = find_subsequence(data, b"\r\n\r\n") else {
        return false;
    };
    match content_length(&data[..header_end]) {
        Some(len) => data.len() >= header_end + 4 + len,
        None => false,
    }
}

fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|val| val.trim().parse::<usize>().ok())
}

/// `HTTP/1.1 200 OK` → 200.
fn parse_status_line(data: &[u8]) -> Option<u16> {
    let line_end = find_subsequence(data, b"\r\n").unwrap_or(data.len());
    let line = std::str::from_utf8(&data[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn ipp_status_code(data: &[u8]) -> Option<u16> {
    let body = &data[find_subsequence(data, b"\r\n\r\n")? + 4..];
    (body.len() >= 4).then(|| u16::from_be_bytes([body[2], body[3]]))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Ask a printer for its make-and-model via Get-Printer-Attributes.
///
/// Used to label discovered printers whose mDNS record does not carry one.
pub async fn query_make_and_model(uri: &str, timeout: Duration) -> Result<Option<String>> {
    use ipp::prelude::*;

    let parsed: Uri = uri
        .parse()
        .map_err(|e| RelayError::Discovery(format!("invalid URI '{uri}': {e}")))?;
    let operation = IppOperationBuilder::get_printer_attributes(parsed.clone()).build();
    let client = AsyncIppClient::new(parsed);

    let response = tokio::time::timeout(timeout, client.send(operation))
        .await
        .map_err(|_| RelayError::Timeout(format!("Get-Printer-Attributes on {uri}")))?
        .map_err(|e| RelayError::Discovery(format!("Get-Printer-Attributes on {uri}: {e}")))?;

    if !response.header().status_code().is_success() {
        return Err(RelayError::PrinterRejected(format!(
            "Get-Printer-Attributes on {uri}: {:?}",
            response.header().status_code()
        )));
    }

    for group in response.attributes().groups_of(DelimiterTag::PrinterAttributes) {
        if let Some(attr) = group.attributes().get("printer-make-and-model") {
            return Ok(Some(attr.value().to_string()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn read_attr(body: &[u8], at: usize) -> (u8, String, String, usize) {
        let tag = body[at];
        let name_len = u16::from_be_bytes([body[at + 1], body[at + 2]]) as usize;
        let name = String::from_utf8(body[at + 3..at + 3 + name_len].to_vec()).expect("name");
        let v = at + 3 + name_len;
        let value_len = u16::from_be_bytes([body[v], body[v + 1]]) as usize;
        let value = String::from_utf8(body[v + 2..v + 2 + value_len].to_vec()).expect("value");
        (tag, name, value, v + 2 + value_len)
    }

    #[test]
    fn print_job_layout() {
        let uri = printer_uri("10.0.0.3", 631, "/ipp/print");
        let body = encode_print_job(&uri, FORMAT_TEXT, b"Hello");

        assert_eq!(&body[..2], &[1, 1]);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), OP_PRINT_JOB);
        assert_eq!(u32::from_be_bytes([body[4], body[5], body[6], body[7]]), 1);
        assert_eq!(body[8], TAG_OPERATION_ATTRIBUTES);

        let mut at = 9;
        let mut names = Vec::new();
        for _ in 0..4 {
            let (tag, name, value, next) = read_attr(&body, at);
            names.push((tag, name, value));
            at = next;
        }
        assert_eq!(
            names,
            vec![
                (VALUE_TAG_CHARSET, "attributes-charset".into(), "utf-8".into()),
                (VALUE_TAG_NATURAL_LANGUAGE, "attributes-natural-language".into(), "en".into()),
                (VALUE_TAG_URI, "printer-uri".into(), "ipp://10.0.0.3:631/ipp/print".into()),
                (VALUE_TAG_MIME_MEDIA_TYPE, "document-format".into(), "text/plain".into()),
            ]
        );
        assert_eq!(body[at], TAG_END_OF_ATTRIBUTES);
        assert_eq!(&body[at + 1..], b"Hello");
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line(b"HTTP/1.1 202 Accepted\r\n\r\n"), Some(202));
        assert_eq!(parse_status_line(b"HTTP/1.0 500 Oops"), Some(500));
        assert_eq!(parse_status_line(b"garbage"), None);
    }

    #[test]
    fn completeness_follows_content_length() {
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab"));
        assert!(response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nabcd"));
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\n"));
    }

    async fn fake_printer(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !response_complete(&request) {
                let n = sock.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            sock.write_all(response).await.expect("write");
            request
        });
        (port, handle)
    }

    #[tokio::test]
    async fn accepted_job_resolves() {
        let (port, server) = fake_printer(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/ipp\r\nContent-Length: 8\r\n\r\n\x01\x01\x00\x00\x00\x00\x00\x01",
        )
        .await;
        print_job("127.0.0.1", port, "/ipp/print", FORMAT_TEXT, b"Hello")
            .await
            .expect("accepted");
        let request = server.await.expect("join");
        assert!(request.starts_with(b"POST /ipp/print HTTP/1.1\r\n"));
        assert!(request.ends_with(b"Hello"));
    }

    #[tokio::test]
    async fn http_error_is_rejection() {
        let (port, _server) =
            fake_printer(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
        let err = print_job("127.0.0.1", port, "/ipp/print", FORMAT_TEXT, b"x")
            .await
            .expect_err("rejected");
        assert!(matches!(err, RelayError::PrinterRejected(_)));
    }

    #[tokio::test]
    async fn ipp_error_status_is_rejection() {
        let (port, _server) = fake_printer(
            b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\n\x01\x01\x04\x0a\x00\x00\x00\x01",
        )
        .await;
        let err = print_job("127.0.0.1", port, "/ipp/print", FORMAT_TEXT, b"x")
            .await
            .expect_err("rejected");
        assert!(err.to_string().contains("0x040a"));
    }
}
