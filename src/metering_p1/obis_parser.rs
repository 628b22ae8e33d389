use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::{structs::{FieldValue, Measurement}, P1Error};
use crate::obis_utils::{self, DecodePolicy, ObisRegistry};

lazy_static! {
    static ref VALUE_GROUP: Regex = Regex::new(r"\(.*?\)").unwrap();
}

/// Decode one telegram line.
///
/// Returns `Ok(None)` for lines whose code is not in the registry, this
/// includes the identification line, empty lines and the `!CRC` line.
pub fn parse_obis_line(line: &str, registry: &ObisRegistry) -> Result<Option<Measurement>, P1Error> {
    // Example formats:
    // 1-0:1.8.1(000123.456*kWh)
    // 0-0:1.0.0(230615123045S)
    // 0-1:24.2.3(230615120000S)(01234.567*m3)

    let line = line.trim_end_matches(['\r', '\n']);
    let code = obis_utils::normalize_obis_code(line.split('(').next().unwrap_or(""));

    let entry = match registry.lookup(&code) {
        Some(entry) => entry,
        None => return Ok(None),
    };

    let groups: Vec<&str> = VALUE_GROUP
        .find_iter(line)
        .map(|m| &m.as_str()[1..m.as_str().len() - 1])
        .collect();

    // Gas readings carry the capture time first and the value second
    let raw = match groups.as_slice() {
        [] => return Err(P1Error::Field { code, reason: "no value group".to_string() }),
        [value] => *value,
        [_, value, ..] => *value,
    };

    let (value, unit) = match entry.policy {
        DecodePolicy::Serial => (FieldValue::Text(decode_serial(&code, raw)?), String::new()),
        DecodePolicy::Timestamp => (FieldValue::Text(raw.to_string()), String::new()),
        DecodePolicy::Numeric => {
            let mut parts = raw.splitn(2, '*');
            let number = parts.next().unwrap_or("");
            let number = number.parse::<f64>().map_err(|e| P1Error::Field {
                code: code.clone(),
                reason: format!("'{}' is not a number: {}", number, e),
            })?;
            let unit = parts.next().unwrap_or("").to_string();
            (FieldValue::Number(number), unit)
        }
    };

    debug!("Parsed OBIS line - Code: {}, Description: {}, Value: {}, Unit: {}",
           code, entry.description, value, unit);

    Ok(Some(Measurement {
        code,
        description: entry.description.clone(),
        value,
        unit,
    }))
}

/// Serial numbers are sent as hex encoded ASCII.
fn decode_serial(code: &str, raw: &str) -> Result<String, P1Error> {
    let bytes = hex::decode(raw).map_err(|e| P1Error::Field {
        code: code.to_string(),
        reason: format!("invalid hex serial '{}': {}", raw, e),
    })?;
    String::from_utf8(bytes).map_err(|e| P1Error::Field {
        code: code.to_string(),
        reason: format!("serial is not text: {}", e),
    })
}
