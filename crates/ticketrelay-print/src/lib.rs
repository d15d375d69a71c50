// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Ticketrelay Print — thermal command codec, the four printer transports
// (raw TCP, IPP, OS spooler, USB), the printer registry and discovery.

pub mod discovery;
pub mod escpos;
pub mod ipp_client;
pub mod printer;
pub mod raw_client;
pub mod registry;
pub mod simulator;
pub mod spooler;
pub mod trace;
pub mod usb;

pub use discovery::PrinterDiscovery;
pub use escpos::{TicketBuilder, encode_markup, encode_self_test, encode_text, markup_to_text};
pub use printer::{Printer, TransportTimeouts};
pub use registry::PrinterRegistry;
pub use simulator::SimulatedPrinter;
pub use trace::decode_trace;
