use std::collections::HashMap;
use log::warn;

/// How the value group of a known OBIS line has to be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    /// `value*unit`, value is a decimal number
    Numeric,
    /// `YYMMDDhhmmssX`, kept as raw text
    Timestamp,
    /// hex encoded ASCII, e.g. the equipment identifier
    Serial,
}

impl DecodePolicy {
    /// Classify an OBIS code once, when it enters the registry.
    pub fn for_code(code: &str) -> Self {
        if code.contains("96.1.1") {
            DecodePolicy::Serial
        } else if code.ends_with(":1.0.0") {
            DecodePolicy::Timestamp
        } else {
            DecodePolicy::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObisEntry {
    pub description: String,
    pub policy: DecodePolicy,
}

/// Lookup table from OBIS code to a human readable label.
#[derive(Debug, Clone)]
pub struct ObisRegistry {
    entries: HashMap<String, ObisEntry>,
}

impl ObisRegistry {
    pub fn new(codes: &HashMap<String, String>) -> Self {
        let mut entries = HashMap::new();
        for (code, description) in codes {
            let code = normalize_obis_code(code);
            if !validate_obis_code(&code) {
                warn!("OBIS code '{}' does not look like A-B:C.D.E, keeping it anyway", code);
            }
            let policy = DecodePolicy::for_code(&code);
            entries.insert(code, ObisEntry { description: description.clone(), policy });
        }
        return ObisRegistry { entries };
    }

    pub fn lookup(&self, code: &str) -> Option<&ObisEntry> {
        self.entries.get(code)
    }

    pub fn description(&self, code: &str) -> Option<&str> {
        self.entries.get(code).map(|e| e.description.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObisRegistry {
    fn default() -> Self {
        ObisRegistry::new(&get_default_obis_codes())
    }
}

pub const TIMESTAMP: &str = "Timestamp";
pub const CONSUMPTION_DAY: &str = "Rate 1 (day) - total consumption";
pub const CONSUMPTION_NIGHT: &str = "Rate 2 (night) - total consumption";
pub const PRODUCTION_DAY: &str = "Rate 1 (day) - total production";
pub const PRODUCTION_NIGHT: &str = "Rate 2 (night) - total production";

/// Codes sent by Belgian/Dutch DSMR meters. Both gas codes share one label.
pub fn get_default_obis_codes() -> HashMap<String, String> {
    let mut map = HashMap::new();

    map.insert("0-0:1.0.0", TIMESTAMP);
    map.insert("0-0:96.3.10", "Switch electricity");
    map.insert("0-1:24.4.0", "Switch gas");
    map.insert("0-0:96.14.0", "Current rate (1=day,2=night)");

    // Energy totals
    map.insert("1-0:1.8.1", CONSUMPTION_DAY);
    map.insert("1-0:1.8.2", CONSUMPTION_NIGHT);
    map.insert("1-0:2.8.1", PRODUCTION_DAY);
    map.insert("1-0:2.8.2", PRODUCTION_NIGHT);

    // Instantaneous power
    map.insert("1-0:21.7.0", "L1 consumption");
    map.insert("1-0:41.7.0", "L2 consumption");
    map.insert("1-0:61.7.0", "L3 consumption");
    map.insert("1-0:1.7.0", "All phases consumption");
    map.insert("1-0:22.7.0", "L1 production");
    map.insert("1-0:42.7.0", "L2 production");
    map.insert("1-0:62.7.0", "L3 production");
    map.insert("1-0:2.7.0", "All phases production");

    // Voltage and current
    map.insert("1-0:32.7.0", "L1 voltage");
    map.insert("1-0:52.7.0", "L2 voltage");
    map.insert("1-0:72.7.0", "L3 voltage");
    map.insert("1-0:31.7.0", "L1 current");
    map.insert("1-0:51.7.0", "L2 current");
    map.insert("1-0:71.7.0", "L3 current");

    // Gas meter on M-Bus channel 1
    map.insert("0-1:24.2.3", "Gas consumption");
    map.insert("0-1:24.2.1", "Gas consumption");

    map.into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn validate_obis_code(code: &str) -> bool {
    // OBIS code format: A-B:C.D.E*F
    // A: Medium (0=abstract, 1=electricity, 6=heat, 7=gas, 8=water)
    // B: Channel (0-15)
    // C: Physical value (1-255)
    // D: Processing method (0-255)
    // E: Tariff/Time (0-255)
    // F: Storage (optional, 0-255)

    let parts: Vec<&str> = code.split(':').collect();
    if parts.len() != 2 {
        return false;
    }

    let ab_parts: Vec<&str> = parts[0].split('-').collect();
    if ab_parts.len() != 2 {
        return false;
    }

    let cde_part = parts[1];
    let cde_parts: Vec<&str> = cde_part.split('*').next().unwrap_or("").split('.').collect();

    if cde_parts.len() != 3 {
        return false;
    }

    ab_parts.iter().chain(cde_parts.iter()).all(|part| part.parse::<u8>().is_ok())
}

pub fn normalize_obis_code(code: &str) -> String {
    code.trim().to_string()
}
