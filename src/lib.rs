//! P1 smart meter reader
//!
//! Reads DSMR telegrams from the P1 port of a smart meter, validates their
//! CRC, decodes the OBIS lines, appends them to daily CSV files and serves
//! the latest reading over HTTP.

pub mod api;
pub mod config;
pub mod metering_p1;
pub mod obis_utils;
pub mod snapshot;
pub mod storage;

// Re-export common types for easier access
pub use api::{ApiManager, AppState};
pub use config::Config;
pub use metering_p1::{P1Error, P1Manager, SerialDevice};
pub use obis_utils::ObisRegistry;
pub use snapshot::{PipelineStats, SnapshotPublisher};
pub use storage::CsvStore;
