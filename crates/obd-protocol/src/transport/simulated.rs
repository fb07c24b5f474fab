//! Loopback ELM327 emulator
//!
//! Stands in for an adapter when none is attached and drives the session in
//! tests. It keeps the adapter's echo/linefeed/space/header switches, answers
//! capability queries from its own PID set and serves slowly varying values.

use super::{LinkConfig, Pacer, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const BANNER: &str = "ELM327 v1.5";
const PROTOCOL_LABEL: &str = "AUTO, ISO 15765-4 (CAN 11/500)";
const PROTOCOL_NUMBER: &str = "A6";
const CAN_RESPONSE_HEADER: &str = "7E8";

/// Mode 01 PIDs the emulator can produce values for
const EMULATED_PIDS: &[u8] = &[
    0x04, 0x05, 0x06, 0x07, 0x0B, 0x0C, 0x0D, 0x0F, 0x10, 0x11, 0x1F, 0x2F, 0x33, 0x42, 0x46, 0x5C,
];

#[derive(Debug, Clone, Copy)]
struct AdapterSwitches {
    echo: bool,
    linefeeds: bool,
    spaces: bool,
    headers: bool,
}

impl Default for AdapterSwitches {
    fn default() -> Self {
        Self {
            echo: true,
            linefeeds: false,
            spaces: true,
            headers: false,
        }
    }
}

/// Simulated adapter transport
pub struct SimulatedTransport {
    open: bool,
    pacer: Pacer,
    switches: AdapterSwitches,
    started: Instant,
    supported: BTreeSet<u8>,
    overrides: HashMap<String, String>,
    stored_dtcs: Vec<[u8; 2]>,
    pending_dtcs: Vec<[u8; 2]>,
    battery_volts: f64,
    outbox: Option<Vec<u8>>,
    failing: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            open: false,
            pacer: Pacer::new(Duration::ZERO),
            switches: AdapterSwitches::default(),
            started: Instant::now(),
            supported: EMULATED_PIDS.iter().copied().collect(),
            overrides: HashMap::new(),
            stored_dtcs: vec![[0x01, 0x33], [0x03, 0x00]],
            pending_dtcs: Vec::new(),
            battery_volts: 12.6,
            outbox: None,
            failing: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Apply pacing from a link configuration
    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.pacer = Pacer::new(config.min_command_interval);
        self
    }

    /// Answer `command` with a fixed body instead of the emulation
    pub fn with_response(mut self, command: &str, body: &str) -> Self {
        self.overrides.insert(normalize(command), body.to_string());
        self
    }

    /// Replace the set of mode 01 PIDs reported as supported
    pub fn with_supported_pids(mut self, pids: &[u8]) -> Self {
        self.supported = pids.iter().copied().collect();
        self
    }

    /// Replace stored trouble codes (raw byte pairs)
    pub fn with_stored_dtcs(mut self, codes: &[[u8; 2]]) -> Self {
        self.stored_dtcs = codes.to_vec();
        self
    }

    /// Replace pending trouble codes (raw byte pairs)
    pub fn with_pending_dtcs(mut self, codes: &[[u8; 2]]) -> Self {
        self.pending_dtcs = codes.to_vec();
        self
    }

    /// Switch that makes every read and write fail while set
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }

    /// Shared log of every command received
    pub fn sent_commands(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }

    fn eol(&self) -> &'static str {
        if self.switches.linefeeds {
            "\r\n"
        } else {
            "\r"
        }
    }

    fn hex(&self, bytes: &[u8]) -> String {
        let parts: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
        if self.switches.spaces {
            parts.join(" ")
        } else {
            parts.concat()
        }
    }

    /// One response line, with a CAN header when headers are on
    fn frame(&self, bytes: &[u8]) -> String {
        if !self.switches.headers {
            return self.hex(bytes);
        }
        let pci = format!("{:02X}", bytes.len());
        let sep = if self.switches.spaces { " " } else { "" };
        format!("{CAN_RESPONSE_HEADER}{sep}{pci}{sep}{}", self.hex(bytes))
    }

    fn respond(&mut self, command: &str) -> String {
        if let Some(body) = self.overrides.get(command) {
            return body.clone();
        }
        if let Some(at) = command.strip_prefix("AT") {
            return self.respond_at(at);
        }
        self.respond_obd(command)
    }

    fn respond_at(&mut self, at: &str) -> String {
        let ok = "OK".to_string();
        match at {
            "Z" => {
                self.switches = AdapterSwitches::default();
                format!("{}{BANNER}", self.eol())
            }
            "I" => BANNER.to_string(),
            "E0" | "E1" => {
                self.switches.echo = at == "E1";
                ok
            }
            "L0" | "L1" => {
                self.switches.linefeeds = at == "L1";
                ok
            }
            "S0" | "S1" => {
                self.switches.spaces = at == "S1";
                ok
            }
            "H0" | "H1" => {
                self.switches.headers = at == "H1";
                ok
            }
            "DP" => PROTOCOL_LABEL.to_string(),
            "DPN" => PROTOCOL_NUMBER.to_string(),
            "RV" => format!("{:.1}V", self.battery_volts),
            sp if sp.starts_with("SP") => ok,
            _ => "?".to_string(),
        }
    }

    fn respond_obd(&mut self, command: &str) -> String {
        match command {
            "03" => return self.dtc_response(0x43, &self.stored_dtcs),
            "07" => return self.dtc_response(0x47, &self.pending_dtcs),
            "0A" => return self.dtc_response(0x4A, &[]),
            "04" => {
                self.stored_dtcs.clear();
                self.pending_dtcs.clear();
                return self.frame(&[0x44]);
            }
            _ => {}
        }

        let Some(pid) = command
            .strip_prefix("01")
            .filter(|p| p.len() == 2)
            .and_then(|p| u8::from_str_radix(p, 16).ok())
        else {
            return if command.chars().all(|c| c.is_ascii_hexdigit()) {
                "NO DATA".to_string()
            } else {
                "?".to_string()
            };
        };

        let data = if pid % 0x20 == 0 {
            self.capability_mask(pid).map(|mask| mask.to_be_bytes().to_vec())
        } else if self.supported.contains(&pid) {
            self.emulated_bytes(pid)
        } else {
            None
        };

        match data {
            Some(bytes) => {
                let mut payload = vec![0x41, pid];
                payload.extend(bytes);
                self.frame(&payload)
            }
            None => "NO DATA".to_string(),
        }
    }

    fn capability_mask(&self, base: u8) -> Option<u32> {
        let base = u16::from(base);
        let mut mask = 0u32;
        for &pid in &self.supported {
            let pid = u16::from(pid);
            if pid > base && pid <= base + 32 {
                mask |= 1 << (32 - (pid - base));
            }
        }
        if self.supported.iter().any(|&p| u16::from(p) > base + 32) {
            mask |= 1;
        }
        (mask != 0 || base == 0).then_some(mask)
    }

    fn emulated_bytes(&self, pid: u8) -> Option<Vec<u8>> {
        let t = self.started.elapsed().as_secs_f64();
        let byte = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        let word = |v: f64| {
            let w = v.round().clamp(0.0, 65535.0) as u16;
            vec![(w >> 8) as u8, (w & 0xFF) as u8]
        };
        let rpm = 1900.0 + (t * 0.5).sin() * 1100.0;
        let coolant = 90.0 - 70.0 * (-t / 120.0).exp();

        let bytes = match pid {
            0x04 => vec![byte((0.5 + 0.3 * (t / 3.0).sin()) * 255.0)],
            0x05 => vec![byte(coolant + 40.0)],
            0x06 | 0x07 => vec![byte(128.0 + 6.0 * (t / 7.0).sin())],
            0x0B => vec![byte(35.0 + 20.0 * (t * 0.5).sin().abs())],
            0x0C => word(rpm * 4.0),
            0x0D => vec![byte(40.0 + 30.0 * (t / 10.0).sin())],
            0x0F => vec![byte(25.0 + 40.0)],
            0x10 => word(rpm / 4.0 * 1.5),
            0x11 => vec![byte((0.15 + 0.1 * (t / 3.0).sin()) * 255.0)],
            0x1F => word(t),
            0x2F => vec![byte((0.75 - t / 36_000.0).max(0.0) * 255.0)],
            0x33 => vec![101],
            0x42 => word(14_100.0 + 100.0 * (t / 5.0).sin()),
            0x46 => vec![byte(22.0 + 40.0)],
            0x5C => vec![byte(coolant + 5.0 + 40.0)],
            _ => return None,
        };
        Some(bytes)
    }

    /// Count-prefixed DTC payload, split into ISO-TP frames when long
    fn dtc_response(&self, ack: u8, codes: &[[u8; 2]]) -> String {
        let mut payload = vec![ack, codes.len() as u8];
        for code in codes {
            payload.extend_from_slice(code);
        }

        if payload.len() <= 7 || self.switches.headers {
            return self.frame(&payload);
        }

        let eol = self.eol();
        let mut lines = vec![format!("{:03X}", payload.len())];
        let mut index = 0u8;
        let mut chunks = vec![&payload[..6]];
        chunks.extend(payload[6..].chunks(7));
        for chunk in chunks {
            let mut bytes = chunk.to_vec();
            bytes.resize(if index == 0 { 6 } else { 7 }, 0x00);
            lines.push(format!("{:X}: {}", index & 0x0F, self.hex(&bytes)));
            index = index.wrapping_add(1);
        }
        lines.join(eol)
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Open {
                target: "simulated".to_string(),
                reason: "simulated adapter unavailable".to_string(),
            });
        }
        if !self.open {
            debug!("Simulated adapter opened");
            self.open = true;
            self.switches = AdapterSwitches::default();
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Write("simulated I/O failure".to_string()));
        }
        self.pacer.wait().await;

        let received = String::from_utf8_lossy(bytes);
        let command = normalize(&received);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.clone());
        }

        let echo = self.switches.echo;
        let body = self.respond(&command);
        let eol = self.eol();

        let mut response = String::new();
        if echo {
            response.push_str(received.trim_end_matches(['\r', '\n']));
            response.push_str(eol);
        }
        response.push_str(&body);
        response.push_str(eol);
        response.push_str(eol);
        response.push('>');

        self.outbox = Some(response.into_bytes());
        self.pacer.mark_sent();
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Read("simulated I/O failure".to_string()));
        }
        self.outbox.take().ok_or(TransportError::Timeout(timeout))
    }

    async fn close(&mut self) {
        self.open = false;
        self.outbox = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
