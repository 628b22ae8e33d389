use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::metering_p1::structs::{format_number, ParsedTelegram};
use crate::metering_p1::P1Error;

/// Day partitioned CSV files below the data directory.
pub struct CsvStore {
    data_dir: PathBuf,
}

impl CsvStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        CsvStore { data_dir: data_dir.as_ref().to_path_buf() }
    }

    pub fn record_path(&self, day: &str) -> PathBuf {
        self.data_dir.join(format!("{}.csv", day))
    }

    pub fn summary_path(&self, day: &str) -> PathBuf {
        self.data_dir.join(format!("{}_summed.csv", day))
    }

    /// Append the full record and the summary of one telegram.
    pub fn store(&self, telegram: &ParsedTelegram) -> Result<(), P1Error> {
        fs::create_dir_all(&self.data_dir).map_err(P1Error::Storage)?;

        let record: Vec<(String, String)> = telegram
            .record
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let record_result = append_row(&self.record_path(&telegram.day), &record);

        let snapshot = &telegram.snapshot;
        let summary = vec![
            ("timestamp".to_string(), snapshot.unix_timestamp.to_string()),
            ("Total consumption".to_string(), format_number(snapshot.total_consumption)),
            ("Total production".to_string(), format_number(snapshot.total_production)),
        ];
        let summary_result = append_row(&self.summary_path(&telegram.day), &summary);

        record_result.and(summary_result).map_err(P1Error::Storage)
    }
}

/// Append one row, writing the header first when the file is new.
pub fn append_row(path: &Path, row: &[(String, String)]) -> std::io::Result<()> {
    let file_exists = path.is_file();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut out = String::new();
    if !file_exists {
        debug!("Creating {}", path.display());
        out.push_str(&join_fields(row.iter().map(|(k, _)| k.as_str())));
    }
    out.push_str(&join_fields(row.iter().map(|(_, v)| v.as_str())));

    file.write_all(out.as_bytes())
}

fn join_fields<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    let mut line = fields.map(escape_field).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

/// Quote only when needed, doubling embedded quotes.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_p1::structs::{FieldValue, Snapshot, TelegramRecord};
    use tempfile::TempDir;

    fn parsed(consumption: f64) -> ParsedTelegram {
        let mut record = TelegramRecord::new();
        record.insert("Timestamp".to_string(), FieldValue::Text("230615123045S".to_string()));
        record.insert("Current rate (1=day,2=night)".to_string(), FieldValue::Number(1.0));
        record.insert("Rate 1 (day) - total consumption".to_string(), FieldValue::Number(consumption));
        ParsedTelegram {
            record,
            snapshot: Snapshot { unix_timestamp: 1686825045, total_consumption: consumption, total_production: 0.0 },
            day: "230615".to_string(),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let store = CsvStore::new(dir.path().join("data"));

        store.store(&parsed(123.456)).unwrap();
        store.store(&parsed(124.0)).unwrap();

        let record = fs::read_to_string(store.record_path("230615")).unwrap();
        assert_eq!(record,
            "Timestamp,\"Current rate (1=day,2=night)\",Rate 1 (day) - total consumption\n\
             230615123045S,1.0,123.456\n\
             230615123045S,1.0,124.0\n");

        let summary = fs::read_to_string(store.summary_path("230615")).unwrap();
        assert_eq!(summary,
            "timestamp,Total consumption,Total production\n\
             1686825045,123.456,0.0\n\
             1686825045,124.0,0.0\n");
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
