// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thermal command stream decoder, for diagnostics.
//
// Renders a captured byte stream as readable text with bracketed markers for
// the commands that shape a ticket. Lossy: size, font and drawer commands are
// consumed silently.

use crate::escpos::{ESC, GS, LF};

pub const START_MARKER: &str = "\n--- TICKET START ---\n";
pub const CUT_MARKER: &str = "\n========== CUT ==========\n";
pub const PARTIAL_CUT_MARKER: &str = "\n---------- PARTIAL CUT ----------\n";
pub const LEFT_MARKER: &str = "[LEFT]";
pub const CENTER_MARKER: &str = "[CENTER]";
pub const RIGHT_MARKER: &str = "[RIGHT]";
pub const BOLD_MARKER: &str = "[BOLD]";
pub const BOLD_OFF_MARKER: &str = "[/BOLD]";
pub const BARCODE_MARKER: &str = "[BARCODE]";

const CR: u8 = 0x0D;

/// Decode a captured command stream into a trace.
///
/// Always terminates: every step advances the cursor by at least one byte,
/// and commands cut off by the end of the buffer are consumed as far as
/// they go.
pub fn decode_trace(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let byte = bytes[i];
        let step = match byte {
            ESC => decode_esc(bytes, i, &mut out),
            GS => decode_gs(bytes, i, &mut out),
            LF => {
                out.push('\n');
                1
            }
            CR => 1,
            0x20..=0x7E => {
                out.push(byte as char);
                1
            }
            // Single-byte passthrough; no multi-byte decoding.
            0x80..=0xFF => {
                out.push(char::from(byte));
                1
            }
            _ => 1,
        };
        i += step.max(1);
    }

    out
}

fn arg(bytes: &[u8], at: usize) -> Option<u8> {
    bytes.get(at).copied()
}

/// Returns the number of bytes consumed starting at the ESC.
fn decode_esc(bytes: &[u8], i: usize, out: &mut String) -> usize {
    let Some(cmd) = arg(bytes, i + 1) else {
        return 1;
    };
    match cmd {
        b'@' => {
            out.push_str(START_MARKER);
            2
        }
        b'a' => {
            match arg(bytes, i + 2) {
                Some(0) | Some(b'0') => out.push_str(LEFT_MARKER),
                Some(1) | Some(b'1') => out.push_str(CENTER_MARKER),
                Some(2) | Some(b'2') => out.push_str(RIGHT_MARKER),
                _ => {}
            }
            3
        }
        b'E' => {
            match arg(bytes, i + 2) {
                Some(0) => out.push_str(BOLD_OFF_MARKER),
                Some(_) => out.push_str(BOLD_MARKER),
                None => {}
            }
            3
        }
        b'd' => {
            if let Some(n) = arg(bytes, i + 2) {
                let lines = if n == 0 { 1 } else { n as usize };
                out.extend(std::iter::repeat_n('\n', lines));
            }
            3
        }
        // ESC p m t1 t2 (drawer kick)
        b'p' => 5,
        // One-argument commands: print mode, underline, line spacing,
        // emphasis, double-strike, feed dots, font, code table, rotation,
        // upside-down.
        b'!' | b'-' | b'3' | b'G' | b'J' | b'M' | b't' | b'V' | b'{' | b'R' | b' ' => 3,
        // Argument-less commands (default line spacing, ...).
        _ => 2,
    }
}

/// Returns the number of bytes consumed starting at the GS.
fn decode_gs(bytes: &[u8], i: usize, out: &mut String) -> usize {
    let Some(cmd) = arg(bytes, i + 1) else {
        return 1;
    };
    match cmd {
        b'V' => match arg(bytes, i + 2) {
            Some(0) | Some(b'0') => {
                out.push_str(CUT_MARKER);
                3
            }
            Some(1) | Some(b'1') => {
                out.push_str(PARTIAL_CUT_MARKER);
                3
            }
            // GS V 65 n / GS V 66 n: feed then cut.
            Some(65) => {
                out.push_str(CUT_MARKER);
                4
            }
            Some(66) => {
                out.push_str(PARTIAL_CUT_MARKER);
                4
            }
            _ => {
                out.push_str(CUT_MARKER);
                3
            }
        },
        // Character size: acknowledged, not rendered.
        b'!' => 3,
        b'k' => {
            out.push_str(BARCODE_MARKER);
            // Prefix is GS k m; data runs to and including the first NUL.
            let data_start = i + 3;
            match bytes.get(data_start..) {
                Some(rest) => match rest.iter().position(|&b| b == 0) {
                    Some(nul) => 3 + nul + 1,
                    None => 3 + rest.len(),
                },
                None => bytes.len() - i,
            }
        }
        // One-argument commands: barcode height, width, HRI position and
        // font, reverse printing.
        b'h' | b'w' | b'H' | b'f' | b'B' => 3,
        // GS L nL nH (left margin), GS W nL nH (print area width).
        b'L' | b'W' => 4,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escpos::{TicketBuilder, encode_markup, encode_self_test_at, encode_text};
    use chrono::{Local, TimeZone};
    use ticketrelay_core::types::TransportKind;

    #[test]
    fn text_round_trips_between_markers() {
        for text in ["Hello", "2x Soup, 1x Bread", "", "~!@#$%^&*()"] {
            assert_eq!(
                decode_trace(&encode_text(text)),
                format!("{START_MARKER}{text}{CUT_MARKER}")
            );
        }
    }

    #[test]
    fn markup_round_trip_keeps_lines() {
        let trace = decode_trace(&encode_markup("<p>Soup</p><p>Bread</p>"));
        assert_eq!(trace, format!("{START_MARKER}\nSoup\nBread\n{CUT_MARKER}"));
    }

    #[test]
    fn self_test_structure_survives_decoding() {
        let at = Local
            .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
            .single()
            .expect("local time");
        let trace = decode_trace(&encode_self_test_at("Kitchen", TransportKind::Usb, at));
        assert!(trace.starts_with(&format!(
            "{START_MARKER}{CENTER_MARKER}{BOLD_MARKER}=== PRINT TEST ===\n{BOLD_OFF_MARKER}{LEFT_MARKER}"
        )));
        assert!(trace.contains("Printer: Kitchen\n"));
        assert!(trace.ends_with(CUT_MARKER));
    }

    #[test]
    fn barcode_skips_exactly_to_first_nul_after_prefix() {
        // ESC E 0 carries an earlier zero byte that must not end the barcode.
        let bytes = [
            ESC, b'E', 0x00, GS, b'k', 0x04, b'1', b'2', b'3', 0x00, b'X', 0x00, b'Y',
        ];
        assert_eq!(
            decode_trace(&bytes),
            format!("{BOLD_OFF_MARKER}{BARCODE_MARKER}XY")
        );
    }

    #[test]
    fn barcode_zero_mode_byte_is_part_of_prefix() {
        // m = 0 (UPC-A) must not be mistaken for the terminator.
        let bytes = [GS, b'k', 0x00, b'0', b'1', 0x00, b'Z'];
        assert_eq!(decode_trace(&bytes), format!("{BARCODE_MARKER}Z"));
    }

    #[test]
    fn truncated_commands_terminate() {
        for bytes in [
            &[ESC][..],
            &[GS][..],
            &[ESC, b'a'][..],
            &[ESC, b'E'][..],
            &[ESC, b'd'][..],
            &[GS, b'V'][..],
            &[GS, b'k'][..],
            &[GS, b'k', 0x04, b'1', b'2'][..],
            &[ESC, b'p', 0x00][..],
        ] {
            let _ = decode_trace(bytes);
        }
        assert_eq!(decode_trace(&[b'A', GS, b'k', 0x04, b'9']), format!("A{BARCODE_MARKER}"));
    }

    #[test]
    fn unknown_commands_use_their_width() {
        // ESC p m t1 t2 is five bytes; the text after it must survive.
        let bytes = [ESC, b'p', 0x00, 0x19, 0xFA, b'o', b'k'];
        assert_eq!(decode_trace(&bytes), "ok");
        // Unknown command letters skip prefix plus command byte.
        assert_eq!(decode_trace(&[ESC, b'z', b'q']), "q");
        assert_eq!(decode_trace(&[GS, b'z', b'q']), "q");
    }

    #[test]
    fn feed_repeats_newlines() {
        assert_eq!(decode_trace(&[ESC, b'd', 3]), "\n\n\n");
        assert_eq!(decode_trace(&[ESC, b'd', 0]), "\n");
    }

    #[test]
    fn carriage_return_dropped_and_high_bytes_pass_through() {
        assert_eq!(decode_trace(b"a\r\nb"), "a\nb");
        assert_eq!(decode_trace(&[0xE9]), "\u{e9}");
        assert_eq!(decode_trace(&[0x07, b'x']), "x");
    }

    #[test]
    fn cuts_are_distinguished() {
        let bytes = TicketBuilder::new(32).cut_partial().raw(&[GS, b'V', 65, 3]).build();
        assert_eq!(
            decode_trace(&bytes),
            format!("{START_MARKER}{PARTIAL_CUT_MARKER}{CUT_MARKER}")
        );
    }

    #[test]
    fn size_select_is_silent() {
        let bytes = TicketBuilder::new(32).double_size().text("BIG").reset_size().build();
        assert_eq!(decode_trace(&bytes), format!("{START_MARKER}BIG"));
    }
}
