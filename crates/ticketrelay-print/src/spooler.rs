// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// OS print spooler submission.
//
// Documents are written to a temporary file and handed to the platform's
// queue tool: `lp`/`lpstat` (CUPS) on Unix, PowerShell `Out-Printer` /
// `Get-Printer` on Windows. The temporary file is removed when the
// submission finishes, whether it succeeded or not.

use std::io::Write;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use ticketrelay_core::error::{RelayError, Result};

/// Timeout for handing a document to the spooler.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for queue status queries.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// What to hand to the spooler.
#[derive(Debug, Clone, Copy)]
pub enum SpoolDocument<'a> {
    /// Plain text; the spooler lays it out.
    Text(&'a str),
    /// Printer-native bytes, passed through untouched where the platform allows.
    Raw(&'a [u8]),
}

impl SpoolDocument<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            SpoolDocument::Text(text) => text.as_bytes(),
            SpoolDocument::Raw(bytes) => bytes,
        }
    }

    fn is_raw(&self) -> bool {
        matches!(self, SpoolDocument::Raw(_))
    }
}

/// Submit a document to the named queue.
#[instrument(skip(document), fields(bytes = document.bytes().len(), raw = document.is_raw()))]
pub async fn submit(queue: &str, document: SpoolDocument<'_>) -> Result<()> {
    submit_via(queue, document, submit_command).await
}

async fn submit_via(
    queue: &str,
    document: SpoolDocument<'_>,
    command_for: impl FnOnce(&str, &Path, bool) -> Command,
) -> Result<()> {
    let bytes = document.bytes().to_vec();
    // Dropping the handle deletes the file on every exit path below.
    let file = tokio::task::spawn_blocking(move || write_spool_file(&bytes))
        .await
        .map_err(|e| RelayError::Spooler(format!("writing spool file: {e}")))??;

    info!(queue, path = %file.path().display(), "submitting to print spooler");
    let command = command_for(queue, file.path(), document.is_raw());
    let output = run(command, SUBMIT_TIMEOUT, "print submission").await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(queue, status = %output.status, "spooler refused document");
        return Err(RelayError::Spooler(format!(
            "queue '{queue}' refused the document: {}",
            stderr.trim()
        )));
    }

    info!(queue, "document queued");
    Ok(())
}

fn write_spool_file(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ticketrelay-")
        .suffix(".txt")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// Whether the queue exists and is not offline, errored, jammed or out of
/// paper. Command failures count as unreachable.
pub async fn probe(queue: &str) -> bool {
    match run(status_command(queue), STATUS_TIMEOUT, "queue status").await {
        Ok(output) if output.status.success() => {
            let status = String::from_utf8_lossy(&output.stdout);
            let connected = status_is_connected(&status);
            debug!(queue, status = %status.trim(), connected, "spooler queue status");
            connected
        }
        Ok(output) => {
            debug!(queue, status = %output.status, "queue status query failed");
            false
        }
        Err(e) => {
            debug!(queue, error = %e, "queue status query failed");
            false
        }
    }
}

/// Names of the print queues installed on this machine.
pub async fn list_queues() -> Result<Vec<String>> {
    let output = run(list_command(), STATUS_TIMEOUT, "queue listing").await?;
    if !output.status.success() {
        return Err(RelayError::Spooler(format!(
            "listing queues failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(parse_queue_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Interpret queue status output.
///
/// Matches the PowerShell `PrinterStatus` names and CUPS `lpstat -p` wording.
pub fn status_is_connected(status: &str) -> bool {
    let lower = status.to_ascii_lowercase();
    const BAD: [&str; 8] = [
        "offline",
        "error",
        "paperjam",
        "paper jam",
        "paperout",
        "paper out",
        "out of paper",
        "disabled",
    ];
    !BAD.iter().any(|needle| lower.contains(needle))
}

fn parse_queue_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

async fn run(mut command: Command, timeout: Duration, what: &str) -> Result<Output> {
    command.kill_on_drop(true);
    tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| RelayError::Timeout(format!("{what} took longer than {}s", timeout.as_secs())))?
        .map_err(|e| RelayError::Spooler(format!("{what}: could not run spooler command: {e}")))
}

// -- Platform commands --

#[cfg(windows)]
fn powershell(script: String) -> Command {
    let mut command = Command::new("powershell");
    command.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
    command
}

/// Single-quoted PowerShell literal.
#[cfg(windows)]
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(windows)]
fn submit_command(queue: &str, path: &Path, _raw: bool) -> Command {
    powershell(format!(
        "Get-Content -Path {} -Raw | Out-Printer -Name {}",
        ps_quote(&path.display().to_string()),
        ps_quote(queue)
    ))
}

#[cfg(windows)]
fn status_command(queue: &str) -> Command {
    powershell(format!(
        "Get-Printer -Name {} | Select-Object -ExpandProperty PrinterStatus",
        ps_quote(queue)
    ))
}

#[cfg(windows)]
fn list_command() -> Command {
    powershell("Get-Printer | Select-Object -ExpandProperty Name".into())
}

#[cfg(not(windows))]
fn submit_command(queue: &str, path: &Path, raw: bool) -> Command {
    let mut command = Command::new("lp");
    command.arg("-d").arg(queue);
    if raw {
        command.args(["-o", "raw"]);
    }
    command.arg(path);
    command
}

#[cfg(not(windows))]
fn status_command(queue: &str) -> Command {
    let mut command = Command::new("lpstat");
    command.arg("-p").arg(queue);
    command
}

#[cfg(not(windows))]
fn list_command() -> Command {
    let mut command = Command::new("lpstat");
    command.arg("-e");
    command
}
