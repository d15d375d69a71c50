// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// One configured printer: a config, a transport, and a connectivity flag.
//
// Every printer offers the same operations whatever it is attached by;
// the transport enum decides how each one is carried out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use tracing::{info, instrument, warn};

use ticketrelay_core::error::{RelayError, Result};
use ticketrelay_core::types::{PrinterAddress, PrinterConfig, PrinterStatus, TransportKind};

use crate::escpos;
use crate::ipp_client;
use crate::raw_client;
use crate::spooler::{self, SpoolDocument};
use crate::usb::{UsbBackend, UsbTransport};

/// Timeouts applied by the network transports.
#[derive(Debug, Clone, Copy)]
pub struct TransportTimeouts {
    /// Raw socket: longest stall allowed on any single socket operation.
    pub raw: Duration,
    /// Connect-only reachability probe.
    pub probe: Duration,
    /// IPP request round trip.
    pub ipp: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            raw: raw_client::RAW_TIMEOUT,
            probe: raw_client::PROBE_TIMEOUT,
            ipp: ipp_client::IPP_TIMEOUT,
        }
    }
}

/// How bytes reach the device.
enum Transport {
    NetworkRaw { host: String, port: u16 },
    Ipp { host: String, port: u16, path: String },
    Spooler { queue: String },
    Usb(UsbTransport),
}

pub struct Printer {
    config: PrinterConfig,
    address: PrinterAddress,
    transport: Transport,
    timeouts: TransportTimeouts,
    connected: AtomicBool,
}

impl Printer {
    /// Validate `config` and build the matching transport. Does no I/O.
    pub fn from_config(
        config: PrinterConfig,
        usb_backend: &Arc<dyn UsbBackend>,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        let address = config.address()?;
        let transport = match &address {
            PrinterAddress::Network { host, port } => Transport::NetworkRaw {
                host: host.clone(),
                port: *port,
            },
            PrinterAddress::Ipp { host, port, path } => Transport::Ipp {
                host: host.clone(),
                port: *port,
                path: path.clone(),
            },
            PrinterAddress::Spooler { queue } => Transport::Spooler {
                queue: queue.clone(),
            },
            PrinterAddress::Usb {
                vendor_id,
                product_id,
            } => Transport::Usb(UsbTransport::new(
                *vendor_id,
                *product_id,
                Arc::clone(usb_backend),
            )),
        };
        Ok(Self {
            config,
            address,
            transport,
            timeouts,
            connected: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> TransportKind {
        self.config.kind
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    pub fn address(&self) -> &PrinterAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PrinterStatus {
        PrinterStatus {
            name: self.config.name.clone(),
            kind: self.config.kind,
            connected: self.is_connected(),
            address: self.address.clone(),
        }
    }

    // -- Capabilities --

    /// Deliver printer-native bytes. Resolves once the device has taken them.
    #[instrument(skip(self, bytes), fields(printer = %self.config.name, bytes = bytes.len()))]
    pub async fn submit_raw(&self, bytes: &[u8]) -> Result<()> {
        let outcome = match &self.transport {
            Transport::NetworkRaw { host, port } => {
                raw_client::send_raw_with_timeout(host, *port, bytes, self.timeouts.raw).await
            }
            Transport::Ipp { host, port, path } => {
                ipp_client::print_job_with_timeout(
                    host,
                    *port,
                    path,
                    ipp_client::FORMAT_OCTET_STREAM,
                    bytes,
                    self.timeouts.ipp,
                )
                .await
            }
            Transport::Spooler { queue } => spooler::submit(queue, SpoolDocument::Raw(bytes)).await,
            Transport::Usb(usb) => usb.submit(bytes.to_vec()).await,
        };
        self.record(outcome)
    }

    /// Thermal printers get the encoded command stream; IPP and spooler
    /// printers receive the text as-is and format it themselves.
    #[instrument(skip(self, text), fields(printer = %self.config.name, chars = text.len()))]
    pub async fn submit_text(&self, text: &str) -> Result<()> {
        match &self.transport {
            Transport::NetworkRaw { .. } | Transport::Usb(_) => {
                self.submit_raw(&escpos::encode_text(text)).await
            }
            Transport::Ipp { host, port, path } => {
                let outcome = ipp_client::print_job_with_timeout(
                    host,
                    *port,
                    path,
                    ipp_client::FORMAT_TEXT,
                    text.as_bytes(),
                    self.timeouts.ipp,
                )
                .await;
                self.record(outcome)
            }
            Transport::Spooler { queue } => {
                let outcome = spooler::submit(queue, SpoolDocument::Text(text)).await;
                self.record(outcome)
            }
        }
    }

    pub async fn submit_markup(&self, markup: &str) -> Result<()> {
        self.submit_text(&escpos::markup_to_text(markup)).await
    }

    /// Print a diagnostic ticket suited to the device.
    pub async fn run_self_test(&self) -> Result<()> {
        info!(printer = %self.config.name, kind = %self.config.kind, "printing self-test");
        if self.config.kind.is_thermal() {
            let ticket = escpos::encode_self_test(&self.config.name, self.config.kind);
            self.submit_raw(&ticket).await
        } else {
            let listing = escpos::self_test_text(&self.config.name, self.config.kind, Local::now());
            self.submit_text(&listing).await
        }
    }

    /// Non-destructive liveness probe. Updates and returns `connected`.
    pub async fn check_reachability(&self) -> bool {
        let reachable = match &self.transport {
            Transport::NetworkRaw { host, port } | Transport::Ipp { host, port, .. } => {
                raw_client::probe(host, *port, self.timeouts.probe).await
            }
            Transport::Spooler { queue } => spooler::probe(queue).await,
            Transport::Usb(usb) => usb.probe().await,
        };
        self.connected.store(reachable, Ordering::SeqCst);
        if !reachable {
            warn!(printer = %self.config.name, address = %self.address, "printer unreachable");
        }
        reachable
    }

    /// A delivered job proves the device is reachable; a transport failure
    /// proves it is not. Rejections leave the flag alone.
    fn record(&self, outcome: Result<()>) -> Result<()> {
        match &outcome {
            Ok(()) => self.connected.store(true, Ordering::SeqCst),
            Err(RelayError::Network(_) | RelayError::Timeout(_) | RelayError::DeviceNotFound(_)) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!(printer = %self.config.name, address = %self.address, "printer went offline");
                }
            }
            Err(_) => {}
        }
        outcome
    }
}
