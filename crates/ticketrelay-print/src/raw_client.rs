// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP print client (JetDirect, port 9100).
//
// Opens a fresh socket per job, writes the payload, half-closes and then
// waits for the printer to close its side. Many thermal controllers only
// start printing once they see end-of-stream, so the job is not reported as
// delivered until the peer hangs up. That relies on the device closing
// promptly after accepting data; a device that never closes hits the
// inactivity timeout and the job is reported as failed.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use ticketrelay_core::error::{RelayError, Result};

/// Inactivity timeout for a raw job.
pub const RAW_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect-only reachability timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const CHUNK_SIZE: usize = 8192;

/// Send `payload` to `host:port` and wait for the printer to close.
pub async fn send_raw(host: &str, port: u16, payload: &[u8]) -> Result<()> {
    send_raw_with_timeout(host, port, payload, RAW_TIMEOUT).await
}

/// Like [`send_raw`], with `idle` bounding each connect, write, flush and
/// read on its own. A slow but steady printer never trips it.
#[instrument(skip(payload), fields(bytes = payload.len()))]
pub async fn send_raw_with_timeout(
    host: &str,
    port: u16,
    payload: &[u8],
    idle: Duration,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    info!(addr = %addr, total = payload.len(), "connecting via raw TCP");

    let mut stream = step(idle, &addr, "connect", TcpStream::connect(&addr))
        .await
        .map_err(|e| e.context(format!("connect to {addr}")))?;

    let mut sent = 0usize;
    for chunk in payload.chunks(CHUNK_SIZE) {
        step(idle, &addr, "send", stream.write_all(chunk))
            .await
            .map_err(|e| e.context(format!("send to {addr} failed at byte {sent}")))?;
        sent += chunk.len();
        debug!(sent, total = payload.len(), "raw TCP progress");
    }

    step(idle, &addr, "flush", stream.flush())
        .await
        .map_err(|e| e.context(format!("flush to {addr}")))?;
    // Half-close: the printer sees end-of-stream but can still talk back.
    step(idle, &addr, "shutdown", stream.shutdown())
        .await
        .map_err(|e| e.context(format!("shutdown to {addr}")))?;

    // Drain until the printer closes. Some devices send status bytes first.
    let mut scratch = [0u8; 256];
    loop {
        match step(idle, &addr, "close", stream.read(&mut scratch)).await {
            Ok(0) => break,
            Ok(n) => debug!(n, "printer sent status bytes"),
            Err(StepError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e.context(format!("waiting for {addr} to close"))),
        }
    }

    info!(addr = %addr, total = payload.len(), "raw TCP job delivered");
    Ok(())
}

enum StepError {
    Idle { addr: String, what: &'static str, idle: Duration },
    Io(std::io::Error),
}

impl StepError {
    fn context(self, doing: String) -> RelayError {
        match self {
            StepError::Idle { addr, what, idle } => RelayError::Timeout(format!(
                "printer at {addr} made no progress on {what} for {}ms",
                idle.as_millis()
            )),
            StepError::Io(e) => RelayError::Network(format!("{doing}: {e}")),
        }
    }
}

/// One socket operation, bounded by the inactivity timeout.
async fn step<T>(
    idle: Duration,
    addr: &str,
    what: &'static str,
    op: impl Future<Output = std::io::Result<T>>,
) -> std::result::Result<T, StepError> {
    match tokio::time::timeout(idle, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StepError::Io(e)),
        Err(_) => Err(StepError::Idle {
            addr: addr.to_owned(),
            what,
            idle,
        }),
    }
}

/// Connect-only probe; the socket is dropped immediately on success.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(addr = %addr, error = %e, "raw TCP probe refused");
            false
        }
        Err(_) => {
            debug!(addr = %addr, "raw TCP probe timed out");
            false
        }
    }
}
