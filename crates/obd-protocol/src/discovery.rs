//! Protocol and PID capability discovery

use crate::decoder::{hex_bytes, locate_payload, response_lines};
use crate::error::ObdError;
use crate::session::{expect_ok, text_lines, AdapterSession};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Mode 01 capability queries, each covering the 32 PIDs above its base
pub const CAPABILITY_QUERIES: [&str; 7] = ["0100", "0120", "0140", "0160", "0180", "01A0", "01C0"];

/// PID codes advertised by a capability bitmask (MSB = `base + 1`)
pub fn decode_bitmask(base: u8, mask: u32) -> BTreeSet<String> {
    (0..32u16)
        .filter(|bit| mask & (0x8000_0000 >> bit) != 0)
        .map(|bit| format!("01{:02X}", u16::from(base) + bit + 1))
        .collect()
}

/// Extract the 4-byte bitmask answering `query`, if the response carries one
pub fn parse_capability_response(query: &str, raw: &str) -> Option<u32> {
    let query = query.trim().to_ascii_uppercase();
    let parameter = query.get(2..4)?;
    let prefix = format!("41{parameter}");

    response_lines(raw, Some(&query)).iter().rev().find_map(|line| {
        let payload = locate_payload(line, &prefix)?;
        let bytes = hex_bytes(payload.get(..8)?)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    })
}

/// Select the configured protocol and ask the adapter which one it is using.
///
/// Returns the descriptor without any `AUTO, ` prefix, or `None` when the
/// adapter has nothing usable to report.
pub async fn detect_protocol(session: &AdapterSession) -> Result<Option<String>, ObdError> {
    let config = session.config();
    let select = config.protocol.to_elm_command();
    let response = session.execute_with_timeout(select, Some(config.setup_timeout)).await?;
    expect_ok(select, &response)?;

    let mut descriptor = query_descriptor(session).await?;
    if descriptor.as_deref() == Some("AUTO") {
        debug!("No bus negotiated yet, probing with {}", config.probe_pid);
        session
            .execute_with_timeout(&config.probe_pid, Some(config.reset_timeout))
            .await?;
        descriptor = query_descriptor(session).await?;
    }

    let descriptor = descriptor.filter(|label| label != "AUTO");
    match &descriptor {
        Some(label) => info!("Adapter protocol: {}", label),
        None => debug!("Adapter reported no protocol descriptor"),
    }
    Ok(descriptor)
}

async fn query_descriptor(session: &AdapterSession) -> Result<Option<String>, ObdError> {
    let raw = session
        .execute_with_timeout("ATDP", Some(session.config().setup_timeout))
        .await?;
    Ok(parse_descriptor(&raw))
}

fn parse_descriptor(raw: &str) -> Option<String> {
    let line = text_lines(raw, Some("ATDP")).pop()?;
    let compact: String = line
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    if compact == "?" || crate::decoder::is_sentinel(&compact) {
        return None;
    }
    let label = match line.split_once(',') {
        Some((auto, rest)) if auto.trim().eq_ignore_ascii_case("AUTO") => rest.trim(),
        _ => line.trim(),
    };
    (!label.is_empty()).then(|| label.to_string())
}

/// Query every capability range and collect the advertised mode 01 PIDs.
///
/// Ranges that answer "no data" or garbage contribute nothing; transport
/// faults abort the scan.
pub async fn scan_supported_pids(session: &AdapterSession) -> Result<BTreeSet<String>, ObdError> {
    let mut supported = BTreeSet::new();
    let search_timeout = Some(session.config().reset_timeout);

    for query in CAPABILITY_QUERIES {
        let raw = session.execute_with_timeout(query, search_timeout).await?;
        match parse_capability_response(query, &raw) {
            Some(mask) => {
                let base = u8::from_str_radix(&query[2..4], 16).unwrap_or(0);
                let pids = decode_bitmask(base, mask);
                debug!("{} -> {:08X} ({} PIDs)", query, mask, pids.len());
                supported.extend(pids);
            }
            None => debug!("{} contributed no PIDs", query),
        }
    }

    info!("Capability scan found {} PIDs", supported.len());
    Ok(supported)
}
