// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Inbound message handlers.
//
// Each handler turns one server request into at most one reply. A print
// job always gets exactly one PRINT_RESULT, whatever happens on the way.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use ticketrelay_core::SettingsProvider;
use ticketrelay_core::error::{RelayError, Result};
use ticketrelay_core::human_errors::humanize_error;
use ticketrelay_core::types::{
    ContentKind, DEFAULT_PRINTER_SENTINEL, DiscoveredPrinter, JobResult, JobStatus, PrinterConfig,
    now_millis,
};
use ticketrelay_print::{PrinterDiscovery, PrinterRegistry};

use crate::notify::{Notifier, NotifyLevel};
use crate::protocol::{
    AgentStatus, DiscoverPayload, DiscoverResult, Inbound, Outbound, PrintJobPayload,
    PrinterTestPayload, TestResult,
};

/// Printer discovery as the dispatcher needs it.
#[async_trait]
pub trait FindPrinters: Send + Sync {
    async fn find_printers(&self) -> Result<Vec<DiscoveredPrinter>>;
}

#[async_trait]
impl FindPrinters for PrinterDiscovery {
    async fn find_printers(&self) -> Result<Vec<DiscoveredPrinter>> {
        self.discover().await
    }
}

pub struct Dispatcher {
    registry: Arc<PrinterRegistry>,
    settings: Arc<dyn SettingsProvider>,
    notifier: Arc<dyn Notifier>,
    discovery: Arc<dyn FindPrinters>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PrinterRegistry>,
        settings: Arc<dyn SettingsProvider>,
        notifier: Arc<dyn Notifier>,
        discovery: Arc<dyn FindPrinters>,
    ) -> Self {
        Self {
            registry,
            settings,
            notifier,
            discovery,
        }
    }

    pub fn registry(&self) -> &Arc<PrinterRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Route one inbound message to its handler.
    pub async fn handle(self: Arc<Self>, inbound: Inbound) -> Option<Outbound> {
        match inbound {
            Inbound::PrintJob(payload) => Some(Outbound::PrintResult(self.guarded_print_job(payload).await)),
            Inbound::RejectedJob { job_id, reason } => {
                warn!(job_id = %job_id, error = %reason, "rejecting malformed print job");
                Some(Outbound::PrintResult(JobResult::failure(job_id, reason)))
            }
            Inbound::Ping => Some(Outbound::pong()),
            Inbound::ConfigUpdate(update) => {
                Some(Outbound::AgentStatus(self.apply_printer_config(update.printers).await))
            }
            Inbound::PrinterTest(payload) => Some(Outbound::TestResult(self.test_printer(payload).await)),
            Inbound::DiscoverPrinters(payload) => {
                Some(Outbound::DiscoverResult(self.discover(payload).await))
            }
            Inbound::Unknown(kind) => {
                debug!(kind = %kind, "ignoring unknown message type");
                None
            }
        }
    }

    /// Run the job on its own task so that even a panicking transport
    /// still produces a result.
    async fn guarded_print_job(self: Arc<Self>, payload: PrintJobPayload) -> JobResult {
        let job_id = payload.job_id.clone();
        let this = Arc::clone(&self);
        match tokio::spawn(async move { this.print_job(payload).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "print task aborted");
                JobResult::failure(job_id, format!("print task aborted: {e}"))
            }
        }
    }

    /// Deliver a job and report the outcome.
    #[instrument(skip(self, payload), fields(job_id = %payload.job_id))]
    pub async fn print_job(&self, payload: PrintJobPayload) -> JobResult {
        let job_id = payload.job_id.clone();
        let printer_name = payload
            .printer_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PRINTER_SENTINEL.to_string());

        match self.run_print_job(payload).await {
            Ok(()) => {
                info!(printer = %printer_name, "job printed");
                JobResult::success(job_id)
            }
            Err(e) => {
                warn!(printer = %printer_name, error = %e, "job failed");
                self.notifier
                    .notify_error(&format!("Ticket for {printer_name} failed"), &humanize_error(&e));
                JobResult::failure(job_id, e.to_string())
            }
        }
    }

    async fn run_print_job(&self, payload: PrintJobPayload) -> Result<()> {
        let requested = payload.printer_name.clone().unwrap_or_default();
        let printer = self
            .registry
            .resolve(&requested)
            .await
            .ok_or_else(|| RelayError::PrinterNotFound(display_name(&requested)))?;

        let job = payload.into_job()?;
        match job.content_kind {
            ContentKind::Raw => printer.submit_raw(&job.payload).await,
            ContentKind::Text => printer.submit_text(&String::from_utf8_lossy(&job.payload)).await,
            ContentKind::Markup => printer.submit_markup(&String::from_utf8_lossy(&job.payload)).await,
        }
    }

    /// Persist a new printer list, rebuild the registry and report status.
    #[instrument(skip(self, printers), fields(count = printers.len()))]
    pub async fn apply_printer_config(&self, printers: Vec<PrinterConfig>) -> AgentStatus {
        if let Err(e) = self.settings.update_printers(&printers) {
            warn!(error = %e, "could not persist printer configuration");
            self.notifier
                .notify_error("Printer settings not saved", &humanize_error(&e));
        }
        let registered = self.registry.initialize(&printers).await;
        info!(registered, "printer configuration applied");
        self.agent_status().await
    }

    /// Print the diagnostic ticket on the named printer.
    #[instrument(skip(self))]
    pub async fn test_printer(&self, payload: PrinterTestPayload) -> TestResult {
        let name = payload.printer_name;
        let outcome = match self.registry.resolve(&name).await {
            Some(printer) => printer.run_self_test().await,
            None => Err(RelayError::PrinterNotFound(display_name(&name))),
        };
        match outcome {
            Ok(()) => TestResult {
                printer_name: name,
                status: JobStatus::Success,
                error: None,
            },
            Err(e) => {
                warn!(printer = %name, error = %e, "self-test failed");
                TestResult {
                    printer_name: name,
                    status: JobStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn discover(&self, payload: DiscoverPayload) -> DiscoverResult {
        let (printers, error) = match self.discovery.find_printers().await {
            Ok(found) => (found, None),
            Err(e) => {
                warn!(error = %e, "printer discovery failed");
                (Vec::new(), Some(e.to_string()))
            }
        };
        DiscoverResult {
            printers,
            error,
            request_id: payload.request_id,
            timestamp: now_millis(),
        }
    }

    pub async fn agent_status(&self) -> AgentStatus {
        AgentStatus::new(self.registry.status_snapshot().await)
    }

    /// Tell the operator the link is back.
    pub fn announce_connected(&self) {
        self.notifier
            .notify("Print agent online", "Connected to the order server.", NotifyLevel::Info);
    }
}

fn display_name(requested: &str) -> String {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        DEFAULT_PRINTER_SENTINEL.to_string()
    } else {
        trimmed.to_string()
    }
}
