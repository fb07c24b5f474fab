//! Response Decoding
//!
//! Turns the raw text an ELM327 returns for a PID request into a
//! [`ParsedReading`]. Every failure is a value on the reading, never a panic:
//! one garbled line must not take the session down with it.

use crate::registry::PidDefinition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a reading carries no usable value (or a suspect one)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingIssue {
    /// No line carried the expected acknowledgement
    NoData,
    /// Acknowledgement present but the payload was short or not hex
    Malformed,
    /// Formula could not be evaluated
    DecodeError,
    /// Value decoded but outside the declared range
    OutOfRange,
}

impl ReadingIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingIssue::NoData => "no data",
            ReadingIssue::Malformed => "malformed",
            ReadingIssue::DecodeError => "decode error",
            ReadingIssue::OutOfRange => "out of range",
        }
    }
}

impl fmt::Display for ReadingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded PID sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedReading {
    /// PID code that was requested
    pub pid: String,
    /// Decoded value, `None` when nothing could be decoded
    pub value: Option<f64>,
    /// Unit of `value`
    pub unit: String,
    /// Data bytes the value was computed from
    pub raw_bytes: Vec<u8>,
    /// Timestamp (Unix ms)
    pub timestamp_ms: u64,
    /// Whether the value can be trusted
    pub valid: bool,
    /// Reason when `valid` is false
    pub reason: Option<ReadingIssue>,
}

impl ParsedReading {
    fn failed(def: &PidDefinition, issue: ReadingIssue, raw_bytes: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            pid: def.code().to_string(),
            value: None,
            unit: def.unit().to_string(),
            raw_bytes,
            timestamp_ms,
            valid: false,
            reason: Some(issue),
        }
    }

    pub(crate) fn unknown(code: &str, timestamp_ms: u64) -> Self {
        Self {
            pid: code.to_string(),
            value: None,
            unit: String::new(),
            raw_bytes: Vec::new(),
            timestamp_ms,
            valid: false,
            reason: Some(ReadingIssue::DecodeError),
        }
    }
}

/// Adapter status lines that never carry data
const SENTINELS: &[&str] = &[
    "NODATA",
    "SEARCHING",
    "STOPPED",
    "?",
    "OK",
    "UNABLETOCONNECT",
    "CANERROR",
    "BUSERROR",
    "BUSBUSY",
    "BUFFERFULL",
    "DATAERROR",
    "FBERROR",
    "ERROR",
    "ACTALERT",
    "LVRESET",
];

/// Header widths (hex chars) that may precede the acknowledgement when
/// headers are on: none, 11-bit CAN id + PCI, J1850/ISO 3-byte header,
/// 29-bit CAN id + PCI.
const HEADER_OFFSETS: [usize; 4] = [0, 5, 6, 10];

/// Whether a normalized line is an adapter status message
pub(crate) fn is_sentinel(line: &str) -> bool {
    let trimmed = line.trim_end_matches('.');
    trimmed.starts_with("BUSINIT") || SENTINELS.contains(&trimmed)
}

/// Split raw adapter output into normalized candidate lines.
///
/// Prompt markers and whitespace are removed, text is upper-cased, empty
/// lines, sentinels and the echoed `command` are dropped.
pub(crate) fn response_lines(raw: &str, command: Option<&str>) -> Vec<String> {
    let echo = command.map(|c| {
        c.chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase()
    });

    raw.split(['\r', '\n'])
        .map(|line| {
            line.chars()
                .filter(|c| !c.is_whitespace() && *c != '>')
                .collect::<String>()
                .to_ascii_uppercase()
        })
        .filter(|line| !line.is_empty())
        .filter(|line| echo.as_deref() != Some(line.as_str()))
        .filter(|line| !is_sentinel(line))
        .collect()
}

/// Find the payload following `prefix`, allowing for a leading header
pub(crate) fn locate_payload<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    HEADER_OFFSETS
        .iter()
        .find_map(|&offset| line.get(offset..).and_then(|rest| rest.strip_prefix(prefix)))
}

/// Parse hex pairs; `None` on odd length or non-hex digits
pub(crate) fn hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Exactly `count` bytes from the front of `payload`
fn take_bytes(payload: &str, count: usize) -> Option<Vec<u8>> {
    count
        .checked_mul(2)
        .and_then(|len| payload.get(..len))
        .and_then(hex_bytes)
}

/// Decode a raw adapter response for one PID.
///
/// Candidate lines are scanned from the last to the first; the first one
/// carrying the acknowledgement and enough bytes wins. Pure: the same input
/// always yields the same reading.
pub fn decode(def: &PidDefinition, raw: &str, timestamp_ms: u64) -> ParsedReading {
    let prefix = def.ack_prefix();
    let mut saw_ack = false;

    for line in response_lines(raw, Some(def.code())).iter().rev() {
        let Some(payload) = locate_payload(line, &prefix) else {
            continue;
        };
        saw_ack = true;

        let Some(bytes) = take_bytes(payload, def.byte_count()) else {
            continue;
        };

        return match def.formula().evaluate(&bytes) {
            Ok(value) => {
                let valid = def.in_range(value);
                ParsedReading {
                    pid: def.code().to_string(),
                    value: Some(value),
                    unit: def.unit().to_string(),
                    raw_bytes: bytes,
                    timestamp_ms,
                    valid,
                    reason: (!valid).then_some(ReadingIssue::OutOfRange),
                }
            }
            Err(_) => ParsedReading::failed(def, ReadingIssue::DecodeError, bytes, timestamp_ms),
        };
    }

    let issue = if saw_ack {
        ReadingIssue::Malformed
    } else {
        ReadingIssue::NoData
    };
    ParsedReading::failed(def, issue, Vec::new(), timestamp_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PidRegistry;
    use proptest::prelude::*;

    fn registry() -> PidRegistry {
        PidRegistry::standard()
    }

    #[test]
    fn test_rpm_with_spaces_and_prompt() {
        let reading = registry().decode("010C", "41 0C 1A F8\r\r>", 7);
        assert_eq!(reading.value, Some(1726.0));
        assert!(reading.valid);
        assert_eq!(reading.reason, None);
        assert_eq!(reading.raw_bytes, vec![0x1A, 0xF8]);
        assert_eq!(reading.unit, "rpm");
        assert_eq!(reading.timestamp_ms, 7);
    }

    #[test]
    fn test_no_data_sentinel() {
        let reading = registry().decode("010D", "NO DATA\r\r>", 0);
        assert_eq!(reading.value, None);
        assert!(!reading.valid);
        assert_eq!(reading.reason, Some(ReadingIssue::NoData));
        assert_eq!(reading.reason.unwrap().as_str(), "no data");
    }

    #[test]
    fn test_echo_and_searching_are_stripped() {
        let raw = "010D\rSEARCHING...\r41 0D 55\r\r>";
        let reading = registry().decode("010D", raw, 0);
        assert_eq!(reading.value, Some(85.0));
    }

    #[test]
    fn test_last_valid_line_wins() {
        // Two ECUs answer; the later line is authoritative
        let raw = "410D10\r410D20\r>";
        assert_eq!(registry().decode("010D", raw, 0).value, Some(32.0));

        // A short trailing line falls back to the earlier complete one
        let raw = "410C1AF8\r410C1A\r>";
        assert_eq!(registry().decode("010C", raw, 0).value, Some(1726.0));
    }

    #[test]
    fn test_headers_are_skipped() {
        let reading = registry().decode("010C", "7E8 04 41 0C 1A F8\r>", 0);
        assert_eq!(reading.value, Some(1726.0));

        let reading = registry().decode("010C", "18DAF110 04 41 0C 1A F8\r>", 0);
        assert_eq!(reading.value, Some(1726.0));
    }

    #[test]
    fn test_insufficient_bytes_is_malformed() {
        let reading = registry().decode("010C", "41 0C 1A\r>", 0);
        assert_eq!(reading.reason, Some(ReadingIssue::Malformed));
        assert_eq!(reading.value, None);

        let reading = registry().decode("010C", "41 0C 1A ZZ\r>", 0);
        assert_eq!(reading.reason, Some(ReadingIssue::Malformed));
    }

    #[test]
    fn test_wrong_pid_is_no_data() {
        let reading = registry().decode("010C", "41 0D 55\r>", 0);
        assert_eq!(reading.reason, Some(ReadingIssue::NoData));
    }

    #[test]
    fn test_out_of_range_is_flagged_not_clamped() {
        // 0xFFFF / 4 = 16383.75 rpm, above the 8000 plausibility limit
        let reading = registry().decode("010C", "410CFFFF", 0);
        assert_eq!(reading.value, Some(16383.75));
        assert!(!reading.valid);
        assert_eq!(reading.reason, Some(ReadingIssue::OutOfRange));
    }

    #[test]
    fn test_formula_failure_is_decode_error() {
        use crate::registry::{PidEntry, Profile};
        let profile = Profile::from_entries(
            "div",
            vec![PidEntry {
                code: "2201".into(),
                name: "ratio".into(),
                byte_count: 2,
                formula: "A / B".into(),
                unit: String::new(),
                min: 0.0,
                max: 10.0,
            }],
        )
        .unwrap();
        let registry = PidRegistry::standard().with_profile(profile);
        let reading = registry.decode("2201", "62 01 05 00", 0);
        assert_eq!(reading.reason, Some(ReadingIssue::DecodeError));
        assert_eq!(reading.value, None);
    }

    #[test]
    fn test_unknown_pid_is_decode_error() {
        let reading = registry().decode("01FF", "41FF00", 0);
        assert_eq!(reading.reason, Some(ReadingIssue::DecodeError));
    }

    #[test]
    fn test_oversized_byte_count_does_not_overflow() {
        assert_eq!(take_bytes("0105", usize::MAX / 2 + 1), None);
        assert_eq!(take_bytes("0105", usize::MAX), None);
        assert_eq!(take_bytes("0105", 2), Some(vec![0x01, 0x05]));
    }

    #[test]
    fn test_non_ascii_noise_does_not_panic() {
        let reading = registry().decode("010C", "\u{FFFD}\u{FFFD}41\r410C1AF8\r>", 0);
        assert_eq!(reading.value, Some(1726.0));
    }

    fn encode_rpm(rpm: f64) -> (u8, u8) {
        let raw = (rpm * 4.0).round() as u16;
        ((raw >> 8) as u8, (raw & 0xFF) as u8)
    }

    proptest! {
        #[test]
        fn prop_rpm_round_trip(rpm in 0.0f64..8000.0) {
            let (a, b) = encode_rpm(rpm);
            let raw = format!("41 0C {a:02X} {b:02X}\r\r>");
            let reading = registry().decode("010C", &raw, 0);
            prop_assert!((reading.value.unwrap() - rpm).abs() <= 0.125);
        }

        #[test]
        fn prop_decode_is_pure(raw in "[0-9A-F \r>]{0,24}") {
            let registry = registry();
            let first = registry.decode("010C", &raw, 42);
            let second = registry.decode("010C", &raw, 42);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_short_payload_is_malformed(
            bytes in proptest::collection::vec(any::<u8>(), 32),
            cut in any::<proptest::sample::Index>(),
        ) {
            let registry = registry();
            for code in registry.codes() {
                let def = registry.get(&code).unwrap();
                let short = cut.index(def.byte_count());
                let payload: String = bytes[..short].iter().map(|b| format!("{b:02X}")).collect();
                let reading = registry.decode(&code, &format!("{}{payload}\r>", def.ack_prefix()), 0);
                prop_assert_eq!(reading.reason, Some(ReadingIssue::Malformed), "{} with {} bytes", code, short);
                prop_assert!(reading.value.is_none());
            }
        }
    }
}
