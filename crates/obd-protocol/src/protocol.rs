//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

const ALL: [ObdProtocol; 10] = [
    ObdProtocol::Auto,
    ObdProtocol::J1850Pwm,
    ObdProtocol::J1850Vpw,
    ObdProtocol::Iso9141_2,
    ObdProtocol::Iso14230_4Kwp,
    ObdProtocol::Iso14230_4KwpFast,
    ObdProtocol::Iso15765_4Can11bit500,
    ObdProtocol::Iso15765_4Can29bit500,
    ObdProtocol::Iso15765_4Can11bit250,
    ObdProtocol::Iso15765_4Can29bit250,
];

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// ELM327 protocol number (the digit after `ATSP`)
    pub fn number(&self) -> u8 {
        ALL.iter().position(|p| p == self).unwrap_or(0) as u8
    }

    /// Protocol for an ELM327 protocol number
    pub fn from_number(number: u8) -> Option<Self> {
        ALL.get(usize::from(number)).copied()
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// Map an `ATDP` descriptor to a protocol family.
    ///
    /// Accepts labels with or without the `AUTO, ` prefix, e.g.
    /// `"ISO 15765-4 (CAN 11/500)"` or `"SAE J1850 PWM"`.
    pub fn from_descriptor(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_uppercase();
        let label = label.strip_prefix("AUTO,").unwrap_or(&label).trim();

        let protocol = if label.contains("J1850") && label.contains("PWM") {
            ObdProtocol::J1850Pwm
        } else if label.contains("J1850") && label.contains("VPW") {
            ObdProtocol::J1850Vpw
        } else if label.contains("9141") {
            ObdProtocol::Iso9141_2
        } else if label.contains("14230") {
            if label.contains("FAST") {
                ObdProtocol::Iso14230_4KwpFast
            } else {
                ObdProtocol::Iso14230_4Kwp
            }
        } else if label.contains("15765") {
            match (label.contains("29"), label.contains("250")) {
                (false, false) => ObdProtocol::Iso15765_4Can11bit500,
                (true, false) => ObdProtocol::Iso15765_4Can29bit500,
                (false, true) => ObdProtocol::Iso15765_4Can11bit250,
                (true, true) => ObdProtocol::Iso15765_4Can29bit250,
            }
        } else {
            return None;
        };
        Some(protocol)
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObdProtocol::Auto => "AUTO",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 (KWP 5BAUD)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 (KWP FAST)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 (CAN 11/500)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 (CAN 29/500)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 (CAN 11/250)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 (CAN 29/250)",
        };
        f.write_str(label)
    }
}

/// Parses `"auto"`, a protocol number (`"6"`) or an `ATDP` label
impl FromStr for ObdProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(ObdProtocol::Auto);
        }
        if let Ok(number) = trimmed.parse::<u8>() {
            return ObdProtocol::from_number(number)
                .ok_or_else(|| format!("unknown protocol number {number}"));
        }
        ObdProtocol::from_descriptor(trimmed).ok_or_else(|| format!("unknown protocol {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_mapping() {
        assert_eq!(
            ObdProtocol::from_descriptor("AUTO, ISO 15765-4 (CAN 11/500)"),
            Some(ObdProtocol::Iso15765_4Can11bit500)
        );
        assert_eq!(
            ObdProtocol::from_descriptor("ISO 15765-4 (CAN 29/250)"),
            Some(ObdProtocol::Iso15765_4Can29bit250)
        );
        assert_eq!(
            ObdProtocol::from_descriptor("SAE J1850 VPW"),
            Some(ObdProtocol::J1850Vpw)
        );
        assert_eq!(
            ObdProtocol::from_descriptor("ISO 14230-4 (KWP FAST)"),
            Some(ObdProtocol::Iso14230_4KwpFast)
        );
        assert_eq!(ObdProtocol::from_descriptor("AUTO"), None);
    }

    #[test]
    fn test_display_round_trips_through_descriptor() {
        for protocol in ALL.iter().skip(1) {
            assert_eq!(ObdProtocol::from_descriptor(&protocol.to_string()), Some(*protocol));
        }
    }

    #[test]
    fn test_numbers_match_elm_commands() {
        for protocol in ALL {
            assert_eq!(
                protocol.to_elm_command(),
                format!("ATSP{}", protocol.number())
            );
        }
        assert_eq!("6".parse::<ObdProtocol>(), Ok(ObdProtocol::Iso15765_4Can11bit500));
        assert_eq!("auto".parse::<ObdProtocol>(), Ok(ObdProtocol::Auto));
        assert!("12".parse::<ObdProtocol>().is_err());
    }
}
