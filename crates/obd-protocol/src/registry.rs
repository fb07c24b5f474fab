//! OBD-II PID Definitions and Profile Overlays
//!
//! The standard SAE J1979 mode 01 table is built once and shared. A
//! manufacturer profile is a second table consulted first; it never touches
//! the standard one.

use crate::decoder::{self, ParsedReading};
use crate::error::RegistryError;
use crate::formula::Formula;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Largest response length a definition may declare
pub const MAX_BYTE_COUNT: usize = 255;

/// One decodable parameter
#[derive(Debug, Clone)]
pub struct PidDefinition {
    code: String,
    name: String,
    byte_count: usize,
    formula: Formula,
    unit: String,
    min: f64,
    max: f64,
    proprietary: bool,
    source_profile: Option<String>,
}

impl PidDefinition {
    /// Build and validate a definition
    pub fn new(
        code: &str,
        name: &str,
        byte_count: usize,
        formula: &str,
        unit: &str,
        range: (f64, f64),
    ) -> Result<Self, RegistryError> {
        let code = normalize_code(code)?;
        if !(1..=MAX_BYTE_COUNT).contains(&byte_count) {
            return Err(RegistryError::InvalidByteCount {
                code,
                byte_count,
                max: MAX_BYTE_COUNT,
            });
        }
        let parsed = Formula::parse(formula).map_err(|source| RegistryError::Formula {
            code: code.clone(),
            source,
        })?;

        let required = parsed.bytes_required();
        if required > byte_count {
            return Err(RegistryError::VariableOutOfRange {
                code,
                variable: (b'A' + (required - 1) as u8) as char,
                byte_count,
            });
        }
        if range.0 > range.1 {
            return Err(RegistryError::InvalidRange {
                code,
                min: range.0,
                max: range.1,
            });
        }

        Ok(Self {
            code,
            name: name.to_string(),
            byte_count,
            formula: parsed,
            unit: unit.to_string(),
            min: range.0,
            max: range.1,
            proprietary: false,
            source_profile: None,
        })
    }

    fn with_profile(mut self, profile: &str) -> Self {
        self.proprietary = true;
        self.source_profile = Some(profile.to_string());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Declared plausible range `(min, max)`
    pub fn valid_range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn is_proprietary(&self) -> bool {
        self.proprietary
    }

    pub fn source_profile(&self) -> Option<&str> {
        self.source_profile.as_deref()
    }

    /// Request mode byte (`01` for `010C`, `22` for `22F190`)
    pub fn mode(&self) -> u8 {
        // Codes are validated hex at construction
        u8::from_str_radix(&self.code[..2], 16).unwrap_or(0)
    }

    /// Parameter id hex following the mode
    pub fn parameter(&self) -> &str {
        &self.code[2..]
    }

    /// Positive acknowledgement prefix the adapter answers with
    pub fn ack_prefix(&self) -> String {
        format!("{:02X}{}", self.mode().wrapping_add(0x40), self.parameter())
    }
}

/// Upper-case and validate a PID code
pub fn normalize_code(code: &str) -> Result<String, RegistryError> {
    let code: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    let code = code.to_ascii_uppercase();
    let valid = code.len() >= 4 && code.len() % 2 == 0 && code.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(code)
    } else {
        Err(RegistryError::InvalidCode(code))
    }
}

/// Declarative PID entry as found in profile files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidEntry {
    pub code: String,
    pub name: String,
    #[serde(alias = "byteCount")]
    pub byte_count: usize,
    pub formula: String,
    #[serde(default)]
    pub unit: String,
    pub min: f64,
    pub max: f64,
}

/// A named vehicle-specific PID table
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    pids: HashMap<String, PidDefinition>,
}

#[derive(Debug, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    name: Option<String>,
    pids: Vec<PidEntry>,
}

impl Profile {
    /// Build a profile from entries, rejecting duplicate codes
    pub fn from_entries(name: &str, entries: Vec<PidEntry>) -> Result<Self, RegistryError> {
        let mut pids = HashMap::with_capacity(entries.len());
        for entry in entries {
            let def = PidDefinition::new(
                &entry.code,
                &entry.name,
                entry.byte_count,
                &entry.formula,
                &entry.unit,
                (entry.min, entry.max),
            )?
            .with_profile(name);

            let code = def.code().to_string();
            if pids.insert(code.clone(), def).is_some() {
                return Err(RegistryError::DuplicateCode(code));
            }
        }
        Ok(Self {
            name: name.to_string(),
            pids,
        })
    }

    /// Parse a JSON profile document (`{"name": ..., "pids": [...]}` or a bare list)
    pub fn from_json(fallback_name: &str, json: &str) -> Result<Self, RegistryError> {
        let (name, entries) = match serde_json::from_str::<ProfileDocument>(json) {
            Ok(doc) => (doc.name.unwrap_or_else(|| fallback_name.to_string()), doc.pids),
            Err(_) => (fallback_name.to_string(), serde_json::from_str::<Vec<PidEntry>>(json)?),
        };
        Self::from_entries(&name, entries)
    }

    /// Load `<directory>/<name>.json`
    pub fn load(directory: impl AsRef<Path>, name: &str) -> Result<Self, RegistryError> {
        let path = directory.as_ref().join(format!("{name}.json"));
        let json = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let profile = Self::from_json(name, &json)?;
        info!("Loaded profile {} with {} PIDs", profile.name, profile.pids.len());
        Ok(profile)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// Standard table: (code, name, bytes, formula, unit, min, max)
const STANDARD_PIDS: &[(&str, &str, usize, &str, &str, f64, f64)] = &[
    ("0104", "Calculated engine load", 1, "A*100/255", "%", 0.0, 100.0),
    ("0105", "Engine coolant temperature", 1, "A-40", "°C", -40.0, 215.0),
    ("0106", "Short term fuel trim bank 1", 1, "(A-128)*100/128", "%", -100.0, 99.3),
    ("0107", "Long term fuel trim bank 1", 1, "(A-128)*100/128", "%", -100.0, 99.3),
    ("0108", "Short term fuel trim bank 2", 1, "(A-128)*100/128", "%", -100.0, 99.3),
    ("0109", "Long term fuel trim bank 2", 1, "(A-128)*100/128", "%", -100.0, 99.3),
    ("010A", "Fuel pressure", 1, "A*3", "kPa", 0.0, 765.0),
    ("010B", "Intake manifold absolute pressure", 1, "A", "kPa", 0.0, 255.0),
    ("010C", "Engine speed", 2, "((A*256)+B)/4", "rpm", 0.0, 8000.0),
    ("010D", "Vehicle speed", 1, "A", "km/h", 0.0, 300.0),
    ("010E", "Timing advance", 1, "A/2-64", "°", -64.0, 63.5),
    ("010F", "Intake air temperature", 1, "A-40", "°C", -40.0, 215.0),
    ("0110", "Mass air flow rate", 2, "((A*256)+B)/100", "g/s", 0.0, 655.35),
    ("0111", "Throttle position", 1, "A*100/255", "%", 0.0, 100.0),
    ("0114", "Oxygen sensor 1 voltage", 2, "A/200", "V", 0.0, 1.275),
    ("011F", "Run time since engine start", 2, "(A*256)+B", "s", 0.0, 65535.0),
    ("0121", "Distance traveled with MIL on", 2, "(A*256)+B", "km", 0.0, 65535.0),
    ("012C", "Commanded EGR", 1, "A*100/255", "%", 0.0, 100.0),
    ("012F", "Fuel tank level input", 1, "A*100/255", "%", 0.0, 100.0),
    ("0131", "Distance traveled since codes cleared", 2, "(A*256)+B", "km", 0.0, 65535.0),
    ("0133", "Absolute barometric pressure", 1, "A", "kPa", 0.0, 255.0),
    ("0142", "Control module voltage", 2, "((A*256)+B)/1000", "V", 0.0, 65.535),
    ("0143", "Absolute load value", 2, "((A*256)+B)*100/255", "%", 0.0, 25700.0),
    ("0144", "Commanded air-fuel equivalence ratio", 2, "((A*256)+B)*2/65536", "ratio", 0.0, 2.0),
    ("0145", "Relative throttle position", 1, "A*100/255", "%", 0.0, 100.0),
    ("0146", "Ambient air temperature", 1, "A-40", "°C", -40.0, 215.0),
    ("0149", "Accelerator pedal position D", 1, "A*100/255", "%", 0.0, 100.0),
    ("015C", "Engine oil temperature", 1, "A-40", "°C", -40.0, 210.0),
    ("015E", "Engine fuel rate", 2, "((A*256)+B)/20", "L/h", 0.0, 3276.75),
];

fn standard_table() -> Arc<HashMap<String, PidDefinition>> {
    static TABLE: OnceLock<Arc<HashMap<String, PidDefinition>>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            let table: HashMap<_, _> = STANDARD_PIDS
                .iter()
                .filter_map(|&(code, name, bytes, formula, unit, min, max)| {
                    match PidDefinition::new(code, name, bytes, formula, unit, (min, max)) {
                        Ok(def) => Some((def.code().to_string(), def)),
                        Err(e) => {
                            warn!("Built-in PID {} skipped: {}", code, e);
                            None
                        }
                    }
                })
                .collect();
            debug!("Standard PID table built with {} entries", table.len());
            Arc::new(table)
        })
        .clone()
}

/// Two-tier PID lookup: active profile first, then the standard table
#[derive(Debug, Clone)]
pub struct PidRegistry {
    standard: Arc<HashMap<String, PidDefinition>>,
    profile: Option<Profile>,
}

impl PidRegistry {
    /// Registry holding only the standard table
    pub fn standard() -> Self {
        Self {
            standard: standard_table(),
            profile: None,
        }
    }

    /// Overlay a profile; the standard table is shared, never edited
    pub fn with_profile(mut self, profile: Profile) -> Self {
        info!(
            "Activating profile {} ({} PIDs) over standard table",
            profile.name(),
            profile.len()
        );
        self.profile = Some(profile);
        self
    }

    /// Resolve a code
    pub fn get(&self, code: &str) -> Option<&PidDefinition> {
        let code = normalize_code(code).ok()?;
        self.profile
            .as_ref()
            .and_then(|p| p.pids.get(&code))
            .or_else(|| self.standard.get(&code))
    }

    /// Resolve a code in the standard table only
    pub fn standard_definition(&self, code: &str) -> Option<&PidDefinition> {
        let code = normalize_code(code).ok()?;
        self.standard.get(&code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.get(code).is_some()
    }

    pub fn active_profile(&self) -> Option<&str> {
        self.profile.as_ref().map(Profile::name)
    }

    /// Every effective code, sorted
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.standard.keys().cloned().collect();
        if let Some(profile) = &self.profile {
            codes.extend(
                profile
                    .pids
                    .keys()
                    .filter(|c| !self.standard.contains_key(*c))
                    .cloned(),
            );
        }
        codes.sort();
        codes
    }

    /// Decode a raw response for `code`; an unknown code is a decode error
    pub fn decode(&self, code: &str, raw: &str, timestamp_ms: u64) -> ParsedReading {
        match self.get(code) {
            Some(def) => decoder::decode(def, raw, timestamp_ms),
            None => ParsedReading::unknown(code, timestamp_ms),
        }
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str, formula: &str, bytes: usize) -> PidEntry {
        PidEntry {
            code: code.to_string(),
            name: format!("test {code}"),
            byte_count: bytes,
            formula: formula.to_string(),
            unit: "x".to_string(),
            min: 0.0,
            max: 1000.0,
        }
    }

    #[test]
    fn test_standard_table_is_complete() {
        let registry = PidRegistry::standard();
        assert_eq!(registry.codes().len(), STANDARD_PIDS.len());
        let rpm = registry.get("010c").unwrap();
        assert_eq!(rpm.code(), "010C");
        assert_eq!(rpm.byte_count(), 2);
        assert_eq!(rpm.ack_prefix(), "410C");
        assert_eq!(rpm.mode(), 0x01);
        assert!(!rpm.is_proprietary());
    }

    #[test]
    fn test_profile_overrides_without_mutating_standard() {
        let profile = Profile::from_entries(
            "acme",
            vec![entry("010C", "A*100", 1), entry("221234", "(A*256)+B", 2)],
        )
        .unwrap();
        let registry = PidRegistry::standard().with_profile(profile);

        let overridden = registry.get("010C").unwrap();
        assert!(overridden.is_proprietary());
        assert_eq!(overridden.source_profile(), Some("acme"));
        assert_eq!(overridden.byte_count(), 1);

        // Standard definition untouched, including for fresh registries
        assert_eq!(registry.standard_definition("010C").unwrap().byte_count(), 2);
        assert_eq!(PidRegistry::standard().get("010C").unwrap().byte_count(), 2);

        let extended = registry.get("221234").unwrap();
        assert_eq!(extended.ack_prefix(), "621234");
        assert!(registry.codes().contains(&"221234".to_string()));
    }

    #[test]
    fn test_profile_validation() {
        assert!(matches!(
            Profile::from_entries("dup", vec![entry("2201", "A", 1), entry("2201", "B", 2)]),
            Err(RegistryError::DuplicateCode(_))
        ));
        assert!(matches!(
            Profile::from_entries("bytes", vec![entry("2201", "A+B", 1)]),
            Err(RegistryError::VariableOutOfRange { variable: 'B', .. })
        ));
        assert!(matches!(
            Profile::from_entries("code", vec![entry("21X", "A", 1)]),
            Err(RegistryError::InvalidCode(_))
        ));
        assert!(matches!(
            Profile::from_entries("formula", vec![entry("2201", "eval(A)", 1)]),
            Err(RegistryError::Formula { .. })
        ));
    }

    #[test]
    fn test_byte_count_is_bounded() {
        assert!(matches!(
            Profile::from_entries("zero", vec![entry("2201", "42", 0)]),
            Err(RegistryError::InvalidByteCount { byte_count: 0, .. })
        ));
        assert!(matches!(
            PidDefinition::new("2201", "huge", usize::MAX / 2 + 1, "A", "x", (0.0, 1.0)),
            Err(RegistryError::InvalidByteCount { max: MAX_BYTE_COUNT, .. })
        ));
        assert!(PidDefinition::new("2201", "max", MAX_BYTE_COUNT, "A", "x", (0.0, 1.0)).is_ok());

        let doc = r#"[{"code": "2201", "name": "Huge", "byteCount": 9223372036854775808,
                       "formula": "A", "min": 0, "max": 1}]"#;
        assert!(matches!(
            Profile::from_json("huge", doc),
            Err(RegistryError::InvalidByteCount { .. })
        ));
    }

    #[test]
    fn test_profile_json_formats() {
        let doc = r#"{"name": "hybrid", "pids": [
            {"code": "221C02", "name": "Battery SOC", "byteCount": 1,
             "formula": "A*100/255", "unit": "%", "min": 0, "max": 100}
        ]}"#;
        let profile = Profile::from_json("fallback", doc).unwrap();
        assert_eq!(profile.name(), "hybrid");
        assert_eq!(profile.len(), 1);

        let list = r#"[{"code": "2101", "name": "Oil", "byte_count": 1,
                        "formula": "A-40", "min": -40, "max": 215}]"#;
        let profile = Profile::from_json("plain", list).unwrap();
        assert_eq!(profile.name(), "plain");
    }

    #[test]
    fn test_profile_load_from_directory() {
        let dir = std::env::temp_dir().join(format!("obd-profile-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("fleet.json"),
            r#"[{"code": "22F40D", "name": "Speed", "byteCount": 1, "formula": "A", "unit": "km/h", "min": 0, "max": 255}]"#,
        )
        .unwrap();

        let profile = Profile::load(&dir, "fleet").unwrap();
        assert_eq!(profile.len(), 1);
        assert!(matches!(
            Profile::load(&dir, "missing"),
            Err(RegistryError::Io { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" 01 0c ").unwrap(), "010C");
        assert!(normalize_code("01").is_err());
        assert!(normalize_code("01C").is_err());
    }
}
