// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer registry: the set of configured printers and the default choice.
//
// `initialize` builds a complete new set (constructing and probing every
// printer) before swapping it in, so concurrent lookups see either the old
// set or the new one, never a mix. Jobs already running keep their `Arc`
// to the printer they resolved.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

use ticketrelay_core::types::{DEFAULT_PRINTER_SENTINEL, PrinterConfig, PrinterStatus};

use crate::printer::{Printer, TransportTimeouts};
use crate::usb::{UsbBackend, default_backend};

#[derive(Default)]
struct PrinterSet {
    /// In configuration order.
    printers: Vec<Arc<Printer>>,
    default: Option<Arc<Printer>>,
}

pub struct PrinterRegistry {
    state: RwLock<PrinterSet>,
    usb_backend: Arc<dyn UsbBackend>,
    timeouts: TransportTimeouts,
}

impl Default for PrinterRegistry {
    fn default() -> Self {
        Self::new(default_backend(), TransportTimeouts::default())
    }
}

impl PrinterRegistry {
    pub fn new(usb_backend: Arc<dyn UsbBackend>, timeouts: TransportTimeouts) -> Self {
        Self {
            state: RwLock::new(PrinterSet::default()),
            usb_backend,
            timeouts,
        }
    }

    /// Replace the whole printer set with `configs`.
    ///
    /// Invalid or duplicate entries are logged and skipped; printers that
    /// fail their probe are registered as disconnected. Returns the number
    /// of printers registered.
    pub async fn initialize(&self, configs: &[PrinterConfig]) -> usize {
        let mut printers = Vec::with_capacity(configs.len());
        let mut seen = HashSet::new();

        for config in configs {
            if !seen.insert(config.name.clone()) {
                warn!(printer = %config.name, "duplicate printer name, keeping the first");
                continue;
            }
            match Printer::from_config(config.clone(), &self.usb_backend, self.timeouts) {
                Ok(printer) => printers.push(Arc::new(printer)),
                Err(e) => warn!(printer = %config.name, error = %e, "skipping printer"),
            }
        }

        // Probe everything at once; one slow printer must not hold up the rest.
        let mut probes = JoinSet::new();
        for printer in &printers {
            let printer = Arc::clone(printer);
            probes.spawn(async move {
                let reachable = printer.check_reachability().await;
                (printer.name().to_string(), reachable)
            });
        }
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((name, reachable)) => {
                    info!(printer = %name, connected = reachable, "printer registered");
                }
                Err(e) => warn!(error = %e, "printer probe task failed"),
            }
        }

        let default = pick_default(&printers);
        if let Some(printer) = &default {
            info!(printer = %printer.name(), "default printer");
        }

        let count = printers.len();
        *self.state.write().await = PrinterSet { printers, default };
        count
    }

    /// Look up a printer. Empty or `"default"` yields the default printer.
    pub async fn resolve(&self, name: &str) -> Option<Arc<Printer>> {
        let state = self.state.read().await;
        let name = name.trim();
        if name.is_empty() || name == DEFAULT_PRINTER_SENTINEL {
            return state.default.clone();
        }
        state.printers.iter().find(|p| p.name() == name).cloned()
    }

    pub async fn default_printer(&self) -> Option<Arc<Printer>> {
        self.state.read().await.default.clone()
    }

    /// Name, kind, connectivity and address of every registered printer.
    pub async fn status_snapshot(&self) -> Vec<PrinterStatus> {
        self.state
            .read()
            .await
            .printers
            .iter()
            .map(|p| p.status())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.printers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every printer (used at shutdown).
    pub async fn clear(&self) {
        *self.state.write().await = PrinterSet::default();
    }
}

/// First flagged printer, else the first registered one.
fn pick_default(printers: &[Arc<Printer>]) -> Option<Arc<Printer>> {
    let mut flagged = printers.iter().filter(|p| p.config().default);
    let chosen = flagged.next().or_else(|| printers.first()).cloned();
    for extra in flagged {
        warn!(printer = %extra.name(), "more than one default printer, ignoring flag");
    }
    chosen
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::simulator::SimulatedPrinter;
    use ticketrelay_core::types::TransportKind;

    fn fast() -> TransportTimeouts {
        TransportTimeouts {
            raw: Duration::from_secs(2),
            probe: Duration::from_millis(500),
            ipp: Duration::from_secs(2),
        }
    }

    fn registry() -> PrinterRegistry {
        PrinterRegistry::new(default_backend(), fast())
    }

    fn network(name: &str, port: u16, default: bool) -> PrinterConfig {
        PrinterConfig {
            name: name.into(),
            kind: TransportKind::NetworkRaw,
            ip: Some("127.0.0.1".into()),
            port: Some(port),
            default,
            ..Default::default()
        }
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[tokio::test]
    async fn first_printer_is_default_when_none_flagged() {
        let registry = registry();
        let port = closed_port().await;
        registry
            .initialize(&[network("A", port, false), network("B", port, false)])
            .await;

        let resolved = registry.resolve("default").await.expect("default");
        assert_eq!(resolved.name(), "A");
        assert_eq!(registry.resolve("").await.expect("empty").name(), "A");
    }

    #[tokio::test]
    async fn flagged_printer_is_default() {
        let registry = registry();
        let port = closed_port().await;
        registry
            .initialize(&[network("A", port, false), network("B", port, true)])
            .await;
        assert_eq!(registry.resolve(DEFAULT_PRINTER_SENTINEL).await.expect("default").name(), "B");
    }

    #[tokio::test]
    async fn unknown_name_resolves_to_none() {
        let registry = registry();
        registry.initialize(&[network("A", 9100, false)]).await;
        assert!(registry.resolve("Patio").await.is_none());
    }

    #[tokio::test]
    async fn unreachable_printer_does_not_block_the_next() {
        let sim = SimulatedPrinter::start().await.expect("simulator");
        let registry = registry();
        let dead = closed_port().await;

        let count = registry
            .initialize(&[network("Dead", dead, false), network("Live", sim.port(), false)])
            .await;
        assert_eq!(count, 2);

        let statuses = registry.status_snapshot().await;
        let dead_status = statuses.iter().find(|s| s.name == "Dead").expect("dead");
        let live_status = statuses.iter().find(|s| s.name == "Live").expect("live");
        assert!(!dead_status.connected);
        assert!(live_status.connected);
    }

    #[tokio::test]
    async fn failed_delivery_marks_printer_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let registry = registry();
        registry.initialize(&[network("Bar", port, false)]).await;
        assert!(registry.status_snapshot().await[0].connected);

        drop(listener);
        let printer = registry.resolve("Bar").await.expect("registered");
        let err = printer.submit_raw(b"\x1b@").await.expect_err("nothing listening");
        assert!(err.to_string().starts_with("network error:"));

        let status = registry.status_snapshot().await;
        assert!(!status[0].connected);
    }

    #[tokio::test]
    async fn invalid_and_duplicate_entries_are_skipped() {
        let registry = registry();
        let port = closed_port().await;
        let no_ip = PrinterConfig {
            name: "Broken".into(),
            ..Default::default()
        };
        let count = registry
            .initialize(&[no_ip, network("A", port, false), network("A", port, true)])
            .await;
        assert_eq!(count, 1);
        assert!(registry.resolve("Broken").await.is_none());
        // The duplicate's flag was dropped with it.
        assert_eq!(registry.resolve("default").await.expect("default").name(), "A");
    }

    #[tokio::test]
    async fn initialize_replaces_previous_set() {
        let registry = registry();
        let port = closed_port().await;
        registry.initialize(&[network("Old", port, true)]).await;
        let held = registry.resolve("Old").await.expect("old");

        registry.initialize(&[network("New", port, false)]).await;
        assert!(registry.resolve("Old").await.is_none());
        assert_eq!(registry.resolve("default").await.expect("default").name(), "New");
        // A job holding the old printer still has it.
        assert_eq!(held.name(), "Old");
    }

    #[tokio::test]
    async fn empty_registry_has_no_default() {
        let registry = registry();
        registry.initialize(&[]).await;
        assert!(registry.resolve("").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn usb_printer_without_device_registers_disconnected() {
        use crate::usb::fake::{FakeBackend, FakeUsb};

        let registry = PrinterRegistry::new(Arc::new(FakeBackend(Arc::new(FakeUsb::default()))), fast());
        let usb = PrinterConfig {
            name: "Till".into(),
            kind: TransportKind::Usb,
            ..Default::default()
        };
        assert_eq!(registry.initialize(&[usb]).await, 1);
        let status = registry.status_snapshot().await;
        assert_eq!(status.len(), 1);
        assert!(!status[0].connected);
    }

    #[tokio::test]
    async fn clear_empties_registry() {
        let registry = registry();
        registry.initialize(&[network("A", 9100, false)]).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
        assert!(registry.default_printer().await.is_none());
    }
}
