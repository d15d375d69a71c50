// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer discovery: mDNS on the local network, OS print queues, and USB.
//
// We browse for `_ipp._tcp.local.` (IPP printers) and
// `_pdl-datastream._tcp.local.` (raw port-9100 printers, which is how most
// networked thermal printers advertise) for a bounded window using the
// `mdns-sd` crate. Each source is independent: one failing is logged and
// the others are still reported.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use ticketrelay_core::error::{RelayError, Result};
use ticketrelay_core::types::{
    DEFAULT_IPP_PATH, DiscoveredPrinter, DiscoverySource, PrinterAddress, TransportKind,
};

use crate::ipp_client;
use crate::spooler;
use crate::usb::UsbBackend;

/// mDNS service type for IPP.
const IPP_SERVICE: &str = "_ipp._tcp.local.";

/// mDNS service type for raw page-description-language printers.
const PDL_SERVICE: &str = "_pdl-datastream._tcp.local.";

/// Default browse window.
pub const DEFAULT_BROWSE_WINDOW: Duration = Duration::from_secs(3);

/// Timeout for the Get-Printer-Attributes lookup on each IPP hit.
const ATTRIBUTE_TIMEOUT: Duration = Duration::from_secs(2);

/// One-shot discovery across every source.
pub struct PrinterDiscovery {
    usb_backend: Arc<dyn UsbBackend>,
    browse_window: Duration,
}

impl PrinterDiscovery {
    pub fn new(usb_backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            usb_backend,
            browse_window: DEFAULT_BROWSE_WINDOW,
        }
    }

    pub fn with_browse_window(mut self, window: Duration) -> Self {
        self.browse_window = window;
        self
    }

    /// Run every source and merge the results.
    ///
    /// Fails only when every source failed.
    pub async fn discover(&self) -> Result<Vec<DiscoveredPrinter>> {
        let window = self.browse_window;
        let backend = Arc::clone(&self.usb_backend);

        let (network, queues, usb) = tokio::join!(
            discover_network(window),
            discover_queues(),
            discover_usb(backend),
        );

        merge_sources(vec![("mdns", network), ("spooler", queues), ("usb", usb)])
    }
}

/// Concatenate per-source results, first occurrence of a name wins.
fn merge_sources(
    sources: Vec<(&'static str, Result<Vec<DiscoveredPrinter>>)>,
) -> Result<Vec<DiscoveredPrinter>> {
    let total = sources.len();
    let mut seen = HashSet::new();
    let mut printers = Vec::new();
    let mut failures = Vec::new();

    for (source, outcome) in sources {
        match outcome {
            Ok(found) => {
                debug!(source, count = found.len(), "discovery source finished");
                for printer in found {
                    if seen.insert(printer.name.clone()) {
                        printers.push(printer);
                    }
                }
            }
            Err(e) => {
                warn!(source, error = %e, "discovery source failed");
                failures.push(format!("{source}: {e}"));
            }
        }
    }

    if total > 0 && failures.len() == total {
        return Err(RelayError::Discovery(failures.join("; ")));
    }
    info!(count = printers.len(), "printer discovery finished");
    Ok(printers)
}

// -- mDNS --

async fn discover_network(window: Duration) -> Result<Vec<DiscoveredPrinter>> {
    let mut printers = tokio::task::spawn_blocking(move || browse(window))
        .await
        .map_err(|e| RelayError::Discovery(format!("mDNS task failed: {e}")))??;

    // Fill in make-and-model for IPP hits whose TXT record lacked it.
    for printer in printers.iter_mut().filter(|p| p.make_and_model.is_none()) {
        if let PrinterAddress::Ipp { host, port, path } = &printer.address {
            let uri = ipp_client::printer_uri(host, *port, path);
            match ipp_client::query_make_and_model(&uri, ATTRIBUTE_TIMEOUT).await {
                Ok(model) => printer.make_and_model = model,
                Err(e) => debug!(uri = %uri, error = %e, "printer attributes unavailable"),
            }
        }
    }
    Ok(printers)
}

/// Browse both service types for `window`, then shut the daemon down.
fn browse(window: Duration) -> Result<Vec<DiscoveredPrinter>> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| RelayError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
    let ipp = daemon
        .browse(IPP_SERVICE)
        .map_err(|e| RelayError::Discovery(format!("browse {IPP_SERVICE}: {e}")))?;
    let pdl = daemon
        .browse(PDL_SERVICE)
        .map_err(|e| RelayError::Discovery(format!("browse {PDL_SERVICE}: {e}")))?;

    let deadline = Instant::now() + window;
    let mut printers = Vec::new();
    for (service_type, kind, receiver) in [
        (IPP_SERVICE, TransportKind::Ipp, &ipp),
        (PDL_SERVICE, TransportKind::NetworkRaw, &pdl),
    ] {
        // Both browses run concurrently inside the daemon; the second
        // drain starts with whatever the first left of the window.
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(event) = receiver.recv_timeout(remaining) else {
                break;
            };
            if let ServiceEvent::ServiceResolved(info) = event {
                match service_info_to_printer(&info, service_type, kind) {
                    Ok(printer) => {
                        info!(name = %printer.name, address = %printer.address, "printer resolved");
                        printers.push(printer);
                    }
                    Err(e) => {
                        warn!(fullname = %info.get_fullname(), error = %e, "unusable mDNS record");
                    }
                }
            }
        }
        // Drain whatever arrived for this type while we waited on the other.
        while let Ok(event) = receiver.try_recv() {
            if let ServiceEvent::ServiceResolved(info) = event
                && let Ok(printer) = service_info_to_printer(&info, service_type, kind)
            {
                printers.push(printer);
            }
        }
    }

    let _ = daemon.stop_browse(IPP_SERVICE);
    let _ = daemon.stop_browse(PDL_SERVICE);
    if let Err(e) = daemon.shutdown() {
        debug!(error = %e, "mDNS daemon shutdown");
    }
    Ok(printers)
}

/// Convert a resolved service into a discovered printer.
///
/// TXT keys used: `rp` (IPP resource path), `ty` and
/// `printer-make-and-model` (model name).
fn service_info_to_printer(
    info: &ServiceInfo,
    service_type: &str,
    kind: TransportKind,
) -> Result<DiscoveredPrinter> {
    let fullname = info.get_fullname();
    let port = info.get_port();

    // Prefer IPv4 for wider printer compatibility.
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()
        .ok_or_else(|| RelayError::Discovery(format!("no address for service {fullname}")))?;

    let address = match kind {
        TransportKind::Ipp => {
            let path = info
                .get_property_val_str("rp")
                .map(|rp| format!("/{}", rp.trim_start_matches('/')))
                .unwrap_or_else(|| DEFAULT_IPP_PATH.to_string());
            PrinterAddress::Ipp {
                host: ip.to_string(),
                port,
                path,
            }
        }
        _ => PrinterAddress::Network {
            host: ip.to_string(),
            port,
        },
    };

    let make_and_model = info
        .get_property_val_str("printer-make-and-model")
        .or_else(|| info.get_property_val_str("ty"))
        .map(String::from);

    Ok(DiscoveredPrinter {
        name: instance_name(fullname, service_type).to_string(),
        kind,
        address,
        make_and_model,
        source: DiscoverySource::Mdns,
    })
}

/// `"EPSON TM-m30._pdl-datastream._tcp.local."` → `"EPSON TM-m30"`.
fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
}

// -- OS queues --

async fn discover_queues() -> Result<Vec<DiscoveredPrinter>> {
    let queues = spooler::list_queues().await?;
    Ok(queues
        .into_iter()
        .map(|queue| DiscoveredPrinter {
            name: queue.clone(),
            kind: TransportKind::Spooler,
            address: PrinterAddress::Spooler { queue },
            make_and_model: None,
            source: DiscoverySource::Spooler,
        })
        .collect())
}

// -- USB --

async fn discover_usb(backend: Arc<dyn UsbBackend>) -> Result<Vec<DiscoveredPrinter>> {
    let devices = tokio::task::spawn_blocking(move || backend.list_printers())
        .await
        .map_err(|e| RelayError::Discovery(format!("USB task failed: {e}")))??;
    Ok(devices
        .into_iter()
        .map(|device| DiscoveredPrinter {
            name: device.product.clone().unwrap_or_else(|| {
                format!("USB printer {:04x}:{:04x}", device.vendor_id, device.product_id)
            }),
            kind: TransportKind::Usb,
            address: PrinterAddress::Usb {
                vendor_id: Some(device.vendor_id),
                product_id: Some(device.product_id),
            },
            make_and_model: device.product,
            source: DiscoverySource::Usb,
        })
        .collect())
}
