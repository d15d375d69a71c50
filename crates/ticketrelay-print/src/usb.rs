// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// USB bulk printer transport.
//
// A printer is located once (by vendor/product id, or the first device with
// a printer-class interface) and the binding is kept across jobs. Each job
// opens the device, claims the interface, writes, and releases it again.
// Overlapping submissions to the same USB printer are the caller's problem;
// nothing here serializes them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use ticketrelay_core::error::{RelayError, Result};

/// Timeout for each bulk OUT transfer.
pub const BULK_TIMEOUT: Duration = Duration::from_secs(5);

/// USB interface class for printers.
pub const PRINTER_CLASS: u8 = 0x07;

/// A located device that can accept print jobs.
pub trait UsbTarget: Send + Sync {
    /// Open, write all of `data`, close. Blocking.
    fn write_job(&self, data: &[u8]) -> Result<()>;
    fn describe(&self) -> String;
}

/// Summary of an attached printer, for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPrinterInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
}

/// Access to the host's USB devices. Blocking.
pub trait UsbBackend: Send + Sync {
    fn find(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> Result<Arc<dyn UsbTarget>>;
    fn list_printers(&self) -> Result<Vec<UsbPrinterInfo>>;
}

/// The platform backend: libusb when the `usb` feature is on.
pub fn default_backend() -> Arc<dyn UsbBackend> {
    #[cfg(feature = "usb")]
    let backend: Arc<dyn UsbBackend> = Arc::new(rusb_backend::RusbBackend);
    #[cfg(not(feature = "usb"))]
    let backend: Arc<dyn UsbBackend> = Arc::new(Unsupported);
    backend
}

/// A USB printer with a lazily bound device.
pub struct UsbTransport {
    vendor_id: Option<u16>,
    product_id: Option<u16>,
    backend: Arc<dyn UsbBackend>,
    bound: Mutex<Option<Arc<dyn UsbTarget>>>,
}

impl UsbTransport {
    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>, backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            vendor_id,
            product_id,
            backend,
            bound: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<Arc<dyn UsbTarget>> {
        self.bound.lock().ok().and_then(|slot| slot.clone())
    }

    fn store(&self, target: Option<Arc<dyn UsbTarget>>) {
        if let Ok(mut slot) = self.bound.lock() {
            *slot = target;
        }
    }

    /// Return the bound device, locating it first if necessary.
    pub async fn bind(&self) -> Result<Arc<dyn UsbTarget>> {
        if let Some(target) = self.current() {
            return Ok(target);
        }

        let backend = Arc::clone(&self.backend);
        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        let target = tokio::task::spawn_blocking(move || backend.find(vendor_id, product_id))
            .await
            .map_err(|e| RelayError::DeviceNotFound(format!("USB lookup task failed: {e}")))??;

        info!(device = %target.describe(), "USB printer bound");
        self.store(Some(Arc::clone(&target)));
        Ok(target)
    }

    pub fn is_bound(&self) -> bool {
        self.current().is_some()
    }

    pub async fn submit(&self, data: Vec<u8>) -> Result<()> {
        let target = self.bind().await?;
        let writer = Arc::clone(&target);
        let outcome = tokio::task::spawn_blocking(move || writer.write_job(&data))
            .await
            .map_err(|e| RelayError::Network(format!("USB write task failed: {e}")))?;

        if let Err(e) = &outcome {
            // The device may have been unplugged; look it up again next time.
            warn!(device = %target.describe(), error = %e, "USB write failed, dropping binding");
            self.store(None);
        }
        outcome
    }

    /// Available iff a device can be bound. Never writes.
    pub async fn probe(&self) -> bool {
        match self.bind().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "USB printer unavailable");
                false
            }
        }
    }
}

#[cfg(not(feature = "usb"))]
struct Unsupported;

#[cfg(not(feature = "usb"))]
impl UsbBackend for Unsupported {
    fn find(&self, _vendor_id: Option<u16>, _product_id: Option<u16>) -> Result<Arc<dyn UsbTarget>> {
        Err(RelayError::DeviceNotFound(
            "USB support is not compiled into this agent".into(),
        ))
    }

    fn list_printers(&self) -> Result<Vec<UsbPrinterInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "usb")]
mod rusb_backend {
    use std::sync::Arc;

    use rusb::{Device, Direction, GlobalContext, TransferType};
    use tracing::debug;

    use super::{BULK_TIMEOUT, PRINTER_CLASS, UsbBackend, UsbPrinterInfo, UsbTarget};
    use ticketrelay_core::error::{RelayError, Result};

    pub struct RusbBackend;

    #[derive(Debug, Clone, Copy)]
    struct BulkOut {
        interface: u8,
        address: u8,
    }

    struct RusbTarget {
        device: Device<GlobalContext>,
        endpoint: BulkOut,
        vendor_id: u16,
        product_id: u16,
    }

    /// First bulk OUT endpoint, optionally only on printer-class interfaces.
    fn bulk_out(device: &Device<GlobalContext>, printer_class_only: bool) -> Option<BulkOut> {
        let config = device
            .active_config_descriptor()
            .or_else(|_| device.config_descriptor(0))
            .ok()?;
        for interface in config.interfaces() {
            for setting in interface.descriptors() {
                if printer_class_only && setting.class_code() != PRINTER_CLASS {
                    continue;
                }
                for endpoint in setting.endpoint_descriptors() {
                    if endpoint.direction() == Direction::Out
                        && endpoint.transfer_type() == TransferType::Bulk
                    {
                        return Some(BulkOut {
                            interface: setting.interface_number(),
                            address: endpoint.address(),
                        });
                    }
                }
            }
        }
        None
    }

    impl UsbBackend for RusbBackend {
        fn find(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> Result<Arc<dyn UsbTarget>> {
            let devices = rusb::devices()
                .map_err(|e| RelayError::DeviceNotFound(format!("enumerating USB devices: {e}")))?;

            // An explicit vendor id may point at a vendor-class interface.
            let printer_class_only = vendor_id.is_none();
            for device in devices.iter() {
                let Ok(desc) = device.device_descriptor() else {
                    continue;
                };
                if vendor_id.is_some_and(|v| v != desc.vendor_id())
                    || product_id.is_some_and(|p| p != desc.product_id())
                {
                    continue;
                }
                if let Some(endpoint) = bulk_out(&device, printer_class_only) {
                    return Ok(Arc::new(RusbTarget {
                        device,
                        endpoint,
                        vendor_id: desc.vendor_id(),
                        product_id: desc.product_id(),
                    }));
                }
            }

            Err(RelayError::DeviceNotFound(match (vendor_id, product_id) {
                (Some(v), Some(p)) => format!("no USB printer {v:04x}:{p:04x}"),
                (Some(v), None) => format!("no USB printer from vendor {v:04x}"),
                _ => "no USB printer attached".into(),
            }))
        }

        fn list_printers(&self) -> Result<Vec<UsbPrinterInfo>> {
            let devices = rusb::devices()
                .map_err(|e| RelayError::Discovery(format!("enumerating USB devices: {e}")))?;
            let mut printers = Vec::new();
            for device in devices.iter() {
                let Ok(desc) = device.device_descriptor() else {
                    continue;
                };
                if bulk_out(&device, true).is_none() {
                    continue;
                }
                // The product string needs an open handle; not every device allows it.
                let product = device
                    .open()
                    .ok()
                    .and_then(|handle| handle.read_product_string_ascii(&desc).ok());
                printers.push(UsbPrinterInfo {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    product,
                });
            }
            Ok(printers)
        }
    }

    impl UsbTarget for RusbTarget {
        fn write_job(&self, data: &[u8]) -> Result<()> {
            let device = self.describe();
            let handle = self
                .device
                .open()
                .map_err(|e| RelayError::DeviceNotFound(format!("opening {device}: {e}")))?;
            // Not supported on every platform; claiming still works without it.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle
                .claim_interface(self.endpoint.interface)
                .map_err(|e| RelayError::Network(format!("claiming {device}: {e}")))?;

            let mut written = 0;
            let outcome = loop {
                if written >= data.len() {
                    break Ok(());
                }
                match handle.write_bulk(self.endpoint.address, &data[written..], BULK_TIMEOUT) {
                    Ok(0) => {
                        break Err(RelayError::Network(format!(
                            "{device} accepted no data at byte {written}"
                        )));
                    }
                    Ok(n) => {
                        written += n;
                        debug!(written, total = data.len(), "USB bulk progress");
                    }
                    Err(rusb::Error::Timeout) => {
                        break Err(RelayError::Timeout(format!(
                            "{device} stopped accepting data at byte {written}"
                        )));
                    }
                    Err(e) => {
                        break Err(RelayError::Network(format!(
                            "writing to {device} at byte {written}: {e}"
                        )));
                    }
                }
            };

            let _ = handle.release_interface(self.endpoint.interface);
            outcome
        }

        fn describe(&self) -> String {
            format!("usb {:04x}:{:04x}", self.vendor_id, self.product_id)
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::fake::{FakeBackend, FakeUsb};
    use super::*;

    fn transport(state: &Arc<FakeUsb>) -> UsbTransport {
        UsbTransport::new(Some(0x04b8), None, Arc::new(FakeBackend(Arc::clone(state))))
    }

    #[tokio::test]
    async fn unplugged_printer_is_unavailable_not_fatal() {
        let state = Arc::new(FakeUsb::default());
        let usb = transport(&state);

        assert!(!usb.probe().await);
        let err = usb.submit(b"x".to_vec()).await.expect_err("no device");
        assert!(matches!(err, RelayError::DeviceNotFound(_)));
        assert!(!usb.is_bound());
    }

    #[tokio::test]
    async fn binds_lazily_and_keeps_binding() {
        let state = Arc::new(FakeUsb::default());
        let usb = transport(&state);
        assert!(!usb.probe().await);

        state.attached.store(true, Ordering::SeqCst);
        usb.submit(b"one".to_vec()).await.expect("first job");
        usb.submit(b"two".to_vec()).await.expect("second job");

        // One failed probe, one successful bind, then reuse.
        assert_eq!(state.finds.load(Ordering::SeqCst), 2);
        assert_eq!(*state.written.lock().expect("lock"), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn failed_write_drops_binding() {
        let state = Arc::new(FakeUsb::default());
        state.attached.store(true, Ordering::SeqCst);
        let usb = transport(&state);
        assert!(usb.probe().await);

        state.fail_writes.store(true, Ordering::SeqCst);
        assert!(usb.submit(b"x".to_vec()).await.is_err());
        assert!(!usb.is_bound());
    }
}
