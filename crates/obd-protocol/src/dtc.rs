//! Diagnostic trouble codes (modes 03, 04, 07, 0A)

use crate::decoder::{hex_bytes, locate_payload, response_lines};
use crate::error::ObdError;
use crate::session::AdapterSession;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// System a trouble code belongs to (top two bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn bits(&self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }
}

/// A five-character trouble code such as `P0133`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DtcCode {
    category: DtcCategory,
    /// Remaining 14 bits
    number: u16,
}

impl DtcCode {
    /// Decode the two raw bytes of one code
    pub fn from_bytes(first: u8, second: u8) -> Self {
        Self {
            category: DtcCategory::from_bits(first >> 6),
            number: (u16::from(first & 0x3F) << 8) | u16::from(second),
        }
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [
            (self.category.bits() << 6) | (self.number >> 8) as u8,
            (self.number & 0xFF) as u8,
        ]
    }

    pub fn category(&self) -> DtcCategory {
        self.category
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.category.letter(), self.number)
    }
}

impl FromStr for DtcCode {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ObdError::Dtc(format!("invalid trouble code {s:?}"));
        let s = s.trim();
        if s.len() != 5 || !s.is_ascii() {
            return Err(invalid());
        }

        let category = match s.as_bytes()[0].to_ascii_uppercase() {
            b'P' => DtcCategory::Powertrain,
            b'C' => DtcCategory::Chassis,
            b'B' => DtcCategory::Body,
            b'U' => DtcCategory::Network,
            _ => return Err(invalid()),
        };
        let number = u16::from_str_radix(&s[1..], 16).map_err(|_| invalid())?;
        if number > 0x3FFF {
            return Err(invalid());
        }
        Ok(Self { category, number })
    }
}

/// Which trouble-code list to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcKind {
    /// Confirmed codes (mode 03)
    Stored,
    /// Pending codes (mode 07)
    Pending,
    /// Permanent codes (mode 0A)
    Permanent,
}

impl DtcKind {
    pub fn command(&self) -> &'static str {
        match self {
            DtcKind::Stored => "03",
            DtcKind::Pending => "07",
            DtcKind::Permanent => "0A",
        }
    }

    /// Positive acknowledgement byte
    pub fn ack(&self) -> u8 {
        match self {
            DtcKind::Stored => 0x43,
            DtcKind::Pending => 0x47,
            DtcKind::Permanent => 0x4A,
        }
    }
}

/// ISO-TP first-frame length line (`00A`)
fn is_length_line(line: &str) -> bool {
    line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit())
}

/// ISO-TP indexed frame (`0:4304...`)
fn frame_data(line: &str) -> Option<&str> {
    let (index, data) = line.split_once(':')?;
    (index.len() == 1 && index.chars().all(|c| c.is_ascii_hexdigit())).then_some(data)
}

/// Close an ISO-TP message in progress
fn finish(pending: &mut Option<(usize, Vec<u8>)>, payloads: &mut Vec<Vec<u8>>) {
    if let Some((length, mut bytes)) = pending.take() {
        bytes.truncate(length);
        payloads.push(bytes);
    }
}

/// Reassemble response lines into whole payloads
fn payloads(lines: &[String], ack: &str) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut pending: Option<(usize, Vec<u8>)> = None;

    for line in lines {
        if is_length_line(line) {
            finish(&mut pending, &mut payloads);
            let length = usize::from_str_radix(line, 16).unwrap_or(0);
            pending = Some((length, Vec::new()));
            continue;
        }

        if let Some(data) = frame_data(line) {
            if let Some((_, bytes)) = pending.as_mut() {
                bytes.extend(hex_bytes(data).unwrap_or_default());
                continue;
            }
        }

        if let Some(data) = locate_payload(line, ack).and_then(hex_bytes) {
            finish(&mut pending, &mut payloads);
            let mut bytes = hex_bytes(ack).unwrap_or_default();
            bytes.extend(data);
            payloads.push(bytes);
        }
    }
    finish(&mut pending, &mut payloads);
    payloads
}

/// Decode a mode 03/07/0A response into codes.
///
/// Payloads from several ECUs are merged; duplicates and zero padding are
/// dropped. `NO DATA` means no codes.
pub fn parse_dtc_response(kind: DtcKind, raw: &str) -> Result<Vec<DtcCode>, ObdError> {
    let lines = response_lines(raw, Some(kind.command()));
    let ack = format!("{:02X}", kind.ack());

    let mut codes = Vec::new();
    let mut matched = false;
    for payload in payloads(&lines, &ack) {
        let Some((&first, data)) = payload.split_first() else {
            continue;
        };
        if first != kind.ack() {
            continue;
        }
        matched = true;

        // Odd length after the ack: leading count byte (CAN)
        let pairs = if data.len() % 2 == 1 { &data[1..] } else { data };
        for pair in pairs.chunks_exact(2) {
            if pair == [0, 0] {
                continue;
            }
            let code = DtcCode::from_bytes(pair[0], pair[1]);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }

    if matched {
        return Ok(codes);
    }

    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if compact.contains("NODATA") {
        Ok(Vec::new())
    } else {
        Err(ObdError::Dtc(raw.trim().to_string()))
    }
}

/// Reads and clears trouble codes through a session
pub struct DtcManager<'a> {
    session: &'a AdapterSession,
}

impl<'a> DtcManager<'a> {
    pub fn new(session: &'a AdapterSession) -> Self {
        Self { session }
    }

    /// Confirmed codes
    pub async fn read(&self) -> Result<Vec<DtcCode>, ObdError> {
        self.read_kind(DtcKind::Stored).await
    }

    pub async fn read_pending(&self) -> Result<Vec<DtcCode>, ObdError> {
        self.read_kind(DtcKind::Pending).await
    }

    pub async fn read_permanent(&self) -> Result<Vec<DtcCode>, ObdError> {
        self.read_kind(DtcKind::Permanent).await
    }

    pub async fn read_kind(&self, kind: DtcKind) -> Result<Vec<DtcCode>, ObdError> {
        let raw = self.session.execute(kind.command()).await?;
        let codes = parse_dtc_response(kind, &raw)?;
        debug!("{:?} trouble codes: {:?}", kind, codes);
        Ok(codes)
    }

    /// Clear codes and freeze frames; only a `44` acknowledgement counts
    pub async fn clear(&self) -> Result<(), ObdError> {
        let raw = self.session.execute("04").await?;
        let acknowledged = response_lines(&raw, Some("04"))
            .iter()
            .any(|line| locate_payload(line, "44").is_some());
        if acknowledged {
            info!("Trouble codes cleared");
            Ok(())
        } else {
            warn!("Clear codes not acknowledged: {:?}", raw);
            Err(ObdError::ClearRejected(raw.trim().to_string()))
        }
    }
}
