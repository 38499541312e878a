//! Cell-level types and the history record shape persisted to disk
//! (`spec.md` §3, §4.8).

pub mod store;
pub mod writer;

use serde::Serialize;

pub use store::HistoryStore;
pub use writer::{read_additional_registers, read_cell_arrays};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CellStatus {
    Ok,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellVoltage {
    pub cell_number: u16,
    pub voltage: Option<f64>,
    pub status: CellStatus,
    pub raw_value: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct CellTemperature {
    pub cell_number: u16,
    pub temperature: Option<i32>,
    pub status: CellStatus,
    pub raw_value: u16,
}

/// One sample of a battery's basic telemetry plus any additional registers
/// the poller has been configured to capture. `additional` fields are free
/// form and drive the auto-expanding schema in `store`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistorySample {
    pub pack_voltage: Option<f64>,
    pub battery_current: Option<f64>,
    pub soc: Option<i64>,
    pub soh: Option<i64>,
    pub temp_min: Option<i64>,
    pub temp_max: Option<i64>,
    pub additional: Vec<(String, SqlValue)>,
}

/// A value destined for a dynamically-typed SQLite column.
#[derive(Debug, Clone, Serialize)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Null,
}

impl SqlValue {
    pub fn sql_type(&self) -> &'static str {
        match self {
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Null => "INTEGER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HistorySource {
    InitialSync,
    LiveMonitor,
}

impl HistorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            HistorySource::InitialSync => "initial_sync",
            HistorySource::LiveMonitor => "live_monitor",
        }
    }
}
