use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use log::{debug, warn};

use super::{
    obis_parser::parse_obis_line,
    structs::{FieldValue, ParsedTelegram, RawTelegram, Snapshot, TelegramRecord},
    P1Error,
};
use crate::obis_utils::{self, ObisRegistry};

/// Decode every line of a checksum-verified telegram and derive the summary.
pub fn aggregate_telegram(telegram: &RawTelegram, registry: &ObisRegistry) -> Result<ParsedTelegram, P1Error> {
    let text = std::str::from_utf8(telegram.as_bytes()).map_err(|_| P1Error::Framing)?;

    let mut record = TelegramRecord::new();
    for line in text.lines() {
        if let Some(m) = parse_obis_line(line, registry)? {
            debug!("desc: {}, val: {}, u: {}", m.description, m.value, m.unit);
            record.insert(m.description, m.value);
        }
    }

    let timestamp = match record.get(obis_utils::TIMESTAMP) {
        Some(FieldValue::Text(ts)) => ts.clone(),
        Some(FieldValue::Number(_)) => {
            return Err(P1Error::Field {
                code: obis_utils::TIMESTAMP.to_string(),
                reason: "timestamp decoded as a number".to_string(),
            })
        }
        None => return Err(P1Error::MissingField(obis_utils::TIMESTAMP.to_string())),
    };

    let unix_timestamp = to_unix_time(&timestamp)?;
    let total_consumption = required_number(&record, obis_utils::CONSUMPTION_DAY)?
        + required_number(&record, obis_utils::CONSUMPTION_NIGHT)?;
    let total_production = required_number(&record, obis_utils::PRODUCTION_DAY)?
        + required_number(&record, obis_utils::PRODUCTION_NIGHT)?;

    Ok(ParsedTelegram {
        day: timestamp[..6].to_string(),
        record,
        snapshot: Snapshot { unix_timestamp, total_consumption, total_production },
    })
}

fn required_number(record: &TelegramRecord, description: &str) -> Result<f64, P1Error> {
    record
        .get(description)
        .and_then(FieldValue::as_number)
        .ok_or_else(|| P1Error::MissingField(description.to_string()))
}

/// Convert a meter timestamp (`YYMMDDhhmmss` plus DST flag) to Unix seconds.
///
/// `S` is summer time (+02:00), `W` winter time (+01:00). Anything else is
/// taken as UTC.
pub fn to_unix_time(p1time: &str) -> Result<i64, P1Error> {
    let fault = |reason: String| P1Error::Field { code: obis_utils::TIMESTAMP.to_string(), reason };

    let flag = p1time.chars().last().ok_or_else(|| fault("empty timestamp".to_string()))?;
    let digits = &p1time[..p1time.len() - flag.len_utf8()];

    let offset_hours = match flag {
        'S' => 2,
        'W' => 1,
        other => {
            warn!("Unknown timezone flag '{}' in '{}', assuming UTC", other, p1time);
            0
        }
    };

    let naive = NaiveDateTime::parse_from_str(digits, "%y%m%d%H%M%S")
        .map_err(|e| fault(format!("'{}': {}", p1time, e)))?;
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .ok_or_else(|| fault("invalid offset".to_string()))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| fault(format!("'{}' is not a valid local time", p1time)))
}
