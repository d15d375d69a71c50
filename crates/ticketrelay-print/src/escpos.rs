// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thermal command stream encoder.
//
// Turns text, markup and self-test requests into the escape-prefixed byte
// stream understood by receipt printers. Everything here is pure: no I/O,
// no failure paths, and the same input always produces the same bytes.

use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;

use ticketrelay_core::types::TransportKind;

/// Escape prefix.
pub const ESC: u8 = 0x1B;
/// Group-separator prefix.
pub const GS: u8 = 0x1D;
pub const LF: u8 = 0x0A;

/// `ESC @`: reset the printer to power-on state.
pub const INIT: [u8; 2] = [ESC, b'@'];
/// `GS V 0`: full cut.
pub const FULL_CUT: [u8; 3] = [GS, b'V', 0x00];
/// `GS V 1`: partial cut.
pub const PARTIAL_CUT: [u8; 3] = [GS, b'V', 0x01];

/// Characters per line on 80 mm paper.
pub const DEFAULT_WIDTH: usize = 48;

/// Agent version printed on self-test tickets.
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Justification values for `ESC a n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left = 0,
    Center = 1,
    Right = 2,
}

/// Fluent builder for thermal command streams.
///
/// Starts with an initialize command; text is written as UTF-8 without any
/// escaping.
pub struct TicketBuilder {
    buf: Vec<u8>,
    width: usize,
}

impl TicketBuilder {
    pub fn new(width: usize) -> Self {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&INIT);
        Self { buf, width }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    // -- Text --

    pub fn text(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn line(&mut self, s: &str) -> &mut Self {
        self.text(s);
        self.buf.push(LF);
        self
    }

    pub fn newline(&mut self) -> &mut Self {
        self.buf.push(LF);
        self
    }

    /// `ESC d n`: print and feed `lines` lines.
    pub fn feed(&mut self, lines: u8) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, b'd', lines]);
        self
    }

    /// A full-width line of `ch`.
    pub fn rule(&mut self, ch: char) -> &mut Self {
        let rule: String = std::iter::repeat_n(ch, self.width).collect();
        self.line(&rule)
    }

    // -- Layout and style --

    pub fn align(&mut self, align: Align) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, b'a', align as u8]);
        self
    }

    pub fn left(&mut self) -> &mut Self {
        self.align(Align::Left)
    }

    pub fn center(&mut self) -> &mut Self {
        self.align(Align::Center)
    }

    pub fn right(&mut self) -> &mut Self {
        self.align(Align::Right)
    }

    pub fn bold(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, b'E', 0x01]);
        self
    }

    pub fn bold_off(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[ESC, b'E', 0x00]);
        self
    }

    /// `GS ! n`: double width and height.
    pub fn double_size(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[GS, b'!', 0x11]);
        self
    }

    pub fn reset_size(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&[GS, b'!', 0x00]);
        self
    }

    // -- Barcodes --

    /// `GS k m d1..dk NUL`: CODE39 barcode, NUL-terminated form.
    ///
    /// Interior NUL bytes would end the barcode early, so they are dropped.
    pub fn barcode_code39(&mut self, data: &str) -> &mut Self {
        self.buf.extend_from_slice(&[GS, b'k', 0x04]);
        self.buf.extend(data.bytes().filter(|&b| b != 0));
        self.buf.push(0x00);
        self
    }

    // -- Paper --

    pub fn cut(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&FULL_CUT);
        self
    }

    pub fn cut_partial(&mut self) -> &mut Self {
        self.buf.extend_from_slice(&PARTIAL_CUT);
        self
    }

    /// Append raw printer-native bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Default for TicketBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH)
    }
}

/// Initialize, the text verbatim, full cut.
pub fn encode_text(text: &str) -> Vec<u8> {
    TicketBuilder::default().text(text).cut().build()
}

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern"));
static NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n+").expect("newline pattern"));

/// Flatten markup to lines: every tag becomes a newline, runs of newlines
/// collapse to one. Entities and structure are not interpreted.
pub fn markup_to_text(markup: &str) -> String {
    let untagged = TAG.replace_all(markup, "\n");
    NEWLINES.replace_all(&untagged, "\n").into_owned()
}

pub fn encode_markup(markup: &str) -> Vec<u8> {
    encode_text(&markup_to_text(markup))
}

/// Thermal self-test ticket stamped with the current local time.
pub fn encode_self_test(printer_name: &str, kind: TransportKind) -> Vec<u8> {
    encode_self_test_at(printer_name, kind, Local::now())
}

/// Thermal self-test ticket with an explicit timestamp.
pub fn encode_self_test_at(
    printer_name: &str,
    kind: TransportKind,
    printed_at: DateTime<Local>,
) -> Vec<u8> {
    let mut ticket = TicketBuilder::default();
    ticket
        .center()
        .bold()
        .line("=== PRINT TEST ===")
        .bold_off()
        .left()
        .newline();
    for line in self_test_lines(printer_name, kind, printed_at) {
        ticket.line(&line);
    }
    ticket
        .newline()
        .center()
        .line("========================")
        .newline()
        .newline()
        .cut()
        .build()
}

/// Plain-text self-test listing for printers that do their own formatting.
pub fn self_test_text(printer_name: &str, kind: TransportKind, printed_at: DateTime<Local>) -> String {
    let mut text = String::from("=== PRINT TEST ===\n\n");
    for line in self_test_lines(printer_name, kind, printed_at) {
        text.push_str(&line);
        text.push('\n');
    }
    text
}

fn self_test_lines(printer_name: &str, kind: TransportKind, printed_at: DateTime<Local>) -> Vec<String> {
    vec![
        format!("Ticketrelay agent v{AGENT_VERSION}"),
        format!("Printer: {printer_name}"),
        format!("Type: {kind}"),
        format!("Date: {}", printed_at.format("%Y-%m-%d %H:%M:%S")),
        String::new(),
        "If you can read this, the".into(),
        "printer is working".into(),
        "correctly.".into(),
    ]
}
