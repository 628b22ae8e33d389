use std::fmt;

/// One complete telegram as received, from the `/` line up to and
/// including the `!CRC` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTelegram(pub Vec<u8>);

impl RawTelegram {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => f.write_str(&format_number(*n)),
            FieldValue::Text(t) => f.write_str(t),
        }
    }
}

/// Shortest round-trip rendering, but always with a decimal part (`0.0`).
pub fn format_number(value: f64) -> String {
    let s = value.to_string();
    if value.is_finite() && !s.contains('.') && !s.contains('e') {
        format!("{}.0", s)
    } else {
        s
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub code: String,
    pub description: String,
    pub value: FieldValue,
    pub unit: String,
}

/// Description -> value, in telegram line order.
///
/// Inserting an existing description replaces its value but keeps the
/// position of the first occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelegramRecord {
    fields: Vec<(String, FieldValue)>,
}

impl TelegramRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, description: String, value: FieldValue) {
        match self.fields.iter_mut().find(|(k, _)| *k == description) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((description, value)),
        }
    }

    pub fn get(&self, description: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == description).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub unix_timestamp: i64,
    pub total_consumption: f64,
    pub total_production: f64,
}

/// Output of the aggregator for one validated telegram.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTelegram {
    pub record: TelegramRecord,
    pub snapshot: Snapshot,
    /// `YYMMDD` taken from the meter timestamp, used to partition storage
    pub day: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0.0), "0.0");
        assert_eq!(format_number(123.456), "123.456");
        assert_eq!(format_number(1686825045.0), "1686825045.0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
    }

    #[test]
    fn test_record_overwrite_keeps_position() {
        let mut record = TelegramRecord::new();
        record.insert("a".to_string(), FieldValue::Number(1.0));
        record.insert("b".to_string(), FieldValue::Number(2.0));
        record.insert("a".to_string(), FieldValue::Number(3.0));

        assert_eq!(record.len(), 2);
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(record.get("a"), Some(&FieldValue::Number(3.0)));
    }
}
