//! SQLite-backed history persistence (`spec.md` §4.8, §6), grounded on
//! `original_source/modbus_app/history/database.py`. All `rusqlite` calls
//! are synchronous; the async API offloads them to the blocking thread pool.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, ToSql};
use tracing::{info, warn};

use super::{CellTemperature, CellVoltage, HistorySample, HistorySource, SqlValue};
use crate::error::{Error, Result};

/// Columns always present on `battery_history`, never subject to auto-expand.
const BASE_COLUMNS: &[&str] = &[
    "battery_id",
    "timestamp",
    "source",
    "pack_voltage",
    "battery_current",
    "soc",
    "soh",
    "temp_min",
    "temp_max",
    "cell_count",
    "cell_voltage_min",
    "cell_voltage_max",
    "cell_voltage_avg",
    "cell_temp_min",
    "cell_temp_max",
    "cell_temp_avg",
];

#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub async fn open(db_path: String) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(|e| Error::Persistence(e.to_string()))?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")
                .map_err(|e| Error::Persistence(e.to_string()))?;
            create_tables(&conn)?;
            info!(db_path = %db_path, "history database initialized");
            Ok(Self { conn: Arc::new(Mutex::new(conn)) })
        })
        .await
        .map_err(|e| Error::Persistence(format!("join error: {e}")))?
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:".to_string()).await
    }

    /// Inserts one history sample plus its optional per-cell breakdown.
    /// Auto-expands `battery_history` with a new column and retries exactly
    /// once if the sample carries a field the schema doesn't know about yet.
    pub async fn insert_history_record(
        &self,
        battery_id: u8,
        timestamp: f64,
        source: HistorySource,
        sample: HistorySample,
        cell_voltages: Vec<CellVoltage>,
        cell_temperatures: Vec<CellTemperature>,
    ) -> Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            insert_with_auto_expand(&conn, battery_id, timestamp, source, sample, cell_voltages, cell_temperatures)
        })
        .await
        .map_err(|e| Error::Persistence(format!("join error: {e}")))?
    }
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS battery_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            battery_id INTEGER NOT NULL,
            timestamp DATETIME NOT NULL,
            source TEXT NOT NULL,
            pack_voltage REAL,
            battery_current REAL,
            soc INTEGER,
            soh INTEGER,
            temp_min INTEGER,
            temp_max INTEGER,
            cell_count INTEGER,
            cell_voltage_min REAL,
            cell_voltage_max REAL,
            cell_voltage_avg REAL,
            cell_temp_min INTEGER,
            cell_temp_max INTEGER,
            cell_temp_avg REAL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(battery_id, timestamp)
        );

        CREATE TABLE IF NOT EXISTS cell_voltages_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            battery_history_id INTEGER NOT NULL,
            cell_number INTEGER NOT NULL,
            voltage REAL,
            status TEXT DEFAULT 'OK',
            raw_value INTEGER,
            FOREIGN KEY (battery_history_id) REFERENCES battery_history(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS cell_temperatures_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            battery_history_id INTEGER NOT NULL,
            cell_number INTEGER NOT NULL,
            temperature INTEGER,
            status TEXT DEFAULT 'OK',
            raw_value INTEGER,
            FOREIGN KEY (battery_history_id) REFERENCES battery_history(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS sync_status (
            battery_id INTEGER PRIMARY KEY,
            manufacturer TEXT,
            model TEXT,
            serial_number TEXT,
            cell_count INTEGER,
            initial_sync_completed BOOLEAN DEFAULT FALSE,
            initial_sync_date DATETIME,
            total_records_imported INTEGER DEFAULT 0,
            last_record_number INTEGER,
            continuous_monitoring BOOLEAN DEFAULT FALSE,
            monitoring_start_date DATETIME,
            last_monitor_reading DATETIME,
            total_monitor_records INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS export_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            battery_id INTEGER,
            export_type TEXT,
            start_date DATETIME,
            end_date DATETIME,
            records_exported INTEGER,
            file_format TEXT,
            file_path TEXT,
            export_duration_seconds REAL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_battery_timestamp ON battery_history(battery_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_battery_source ON battery_history(battery_id, source);
        CREATE INDEX IF NOT EXISTS idx_timestamp_range ON battery_history(timestamp);
        CREATE INDEX IF NOT EXISTS idx_cell_voltages_history ON cell_voltages_history(battery_history_id, cell_number);
        CREATE INDEX IF NOT EXISTS idx_cell_temperatures_history ON cell_temperatures_history(battery_history_id, cell_number);
        CREATE INDEX IF NOT EXISTS idx_sync_battery ON sync_status(battery_id);
        "#,
    )
    .map_err(|e| Error::Persistence(e.to_string()))
}

fn cell_stats(voltages: &[CellVoltage], temperatures: &[CellTemperature]) -> (Option<i64>, Option<f64>, Option<f64>, Option<f64>, Option<i64>, Option<i64>, Option<f64>) {
    let valid_voltages: Vec<f64> = voltages
        .iter()
        .filter(|c| c.status == super::CellStatus::Ok)
        .filter_map(|c| c.voltage)
        .collect();
    let valid_temps: Vec<i32> = temperatures
        .iter()
        .filter(|c| c.status == super::CellStatus::Ok)
        .filter_map(|c| c.temperature)
        .collect();

    let cell_count = if !voltages.is_empty() {
        Some(voltages.len() as i64)
    } else if !temperatures.is_empty() {
        Some(temperatures.len() as i64)
    } else {
        None
    };

    let (v_min, v_max, v_avg) = if valid_voltages.is_empty() {
        (None, None, None)
    } else {
        let sum: f64 = valid_voltages.iter().sum();
        (
            valid_voltages.iter().cloned().fold(f64::INFINITY, f64::min).into(),
            valid_voltages.iter().cloned().fold(f64::NEG_INFINITY, f64::max).into(),
            Some((sum / valid_voltages.len() as f64 * 1000.0).round() / 1000.0),
        )
    };

    let (t_min, t_max, t_avg) = if valid_temps.is_empty() {
        (None, None, None)
    } else {
        let sum: i32 = valid_temps.iter().sum();
        (
            Some(*valid_temps.iter().min().unwrap() as i64),
            Some(*valid_temps.iter().max().unwrap() as i64),
            Some((sum as f64 / valid_temps.len() as f64 * 10.0).round() / 10.0),
        )
    };

    (cell_count, v_min, v_max, v_avg, t_min, t_max, t_avg)
}

fn insert_with_auto_expand(
    conn: &Connection,
    battery_id: u8,
    timestamp: f64,
    source: HistorySource,
    sample: HistorySample,
    cell_voltages: Vec<CellVoltage>,
    cell_temperatures: Vec<CellTemperature>,
) -> Result<i64> {
    match try_insert(conn, battery_id, timestamp, source, &sample, &cell_voltages, &cell_temperatures) {
        Ok(id) => Ok(id),
        Err(Error::Persistence(msg)) if msg.to_lowercase().contains("no such column") => {
            let missing = extract_missing_column(&msg)
                .ok_or_else(|| Error::Persistence(format!("could not parse missing column from: {msg}")))?;
            let value = sample
                .additional
                .iter()
                .find(|(name, _)| name == &missing)
                .map(|(_, v)| v)
                .ok_or_else(|| Error::Persistence(format!("missing column {missing} not present in sample")))?;
            warn!(column = %missing, sql_type = value.sql_type(), "auto-expanding battery_history schema");
            auto_add_column(conn, &missing, value.sql_type())?;
            try_insert(conn, battery_id, timestamp, source, &sample, &cell_voltages, &cell_temperatures)
        }
        Err(other) => Err(other),
    }
}

fn try_insert(
    conn: &Connection,
    battery_id: u8,
    timestamp: f64,
    source: HistorySource,
    sample: &HistorySample,
    cell_voltages: &[CellVoltage],
    cell_temperatures: &[CellTemperature],
) -> Result<i64> {
    let (cell_count, v_min, v_max, v_avg, t_min, t_max, t_avg) = cell_stats(cell_voltages, cell_temperatures);

    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|s| s.to_string()).collect();
    let mut values: Vec<Box<dyn ToSql>> = vec![
        Box::new(battery_id as i64),
        Box::new(timestamp),
        Box::new(source.as_str().to_string()),
        Box::new(sample.pack_voltage),
        Box::new(sample.battery_current),
        Box::new(sample.soc),
        Box::new(sample.soh),
        Box::new(sample.temp_min),
        Box::new(sample.temp_max),
        Box::new(cell_count),
        Box::new(v_min),
        Box::new(v_max),
        Box::new(v_avg),
        Box::new(t_min),
        Box::new(t_max),
        Box::new(t_avg),
    ];

    for (name, value) in &sample.additional {
        columns.push(name.clone());
        values.push(match value {
            SqlValue::Integer(i) => Box::new(*i),
            SqlValue::Real(r) => Box::new(*r),
            SqlValue::Text(t) => Box::new(t.clone()),
            SqlValue::Null => Box::new(Option::<i64>::None),
        });
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!("INSERT INTO battery_history ({}) VALUES ({})", columns.join(", "), placeholders);

    let params: Vec<&dyn ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let result = conn.execute(&sql, params.as_slice());

    let history_id = match result {
        Ok(_) => conn.last_insert_rowid(),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.to_lowercase().contains("unique") => {
            // battery_id + timestamp collision: the source silently drops these.
            return Ok(-1);
        }
        Err(e) => return Err(Error::Persistence(e.to_string())),
    };

    for cell in cell_voltages {
        conn.execute(
            "INSERT INTO cell_voltages_history (battery_history_id, cell_number, voltage, status, raw_value) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![history_id, cell.cell_number, cell.voltage, status_str(cell.status), cell.raw_value],
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;
    }
    for cell in cell_temperatures {
        conn.execute(
            "INSERT INTO cell_temperatures_history (battery_history_id, cell_number, temperature, status, raw_value) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![history_id, cell.cell_number, cell.temperature, status_str(cell.status), cell.raw_value],
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;
    }

    Ok(history_id)
}

fn status_str(status: super::CellStatus) -> &'static str {
    match status {
        super::CellStatus::Ok => "OK",
        super::CellStatus::Disconnected => "DISCONNECTED",
        super::CellStatus::Error => "ERROR",
    }
}

fn auto_add_column(conn: &Connection, column: &str, sql_type: &str) -> Result<()> {
    let sql = format!("ALTER TABLE battery_history ADD COLUMN {column} {sql_type}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.to_lowercase().contains("duplicate column") => Ok(()),
        Err(e) => Err(Error::Persistence(e.to_string())),
    }
}

fn extract_missing_column(error_message: &str) -> Option<String> {
    let lower = error_message.to_lowercase();
    if let Some(idx) = lower.find("no such column:") {
        Some(error_message[idx + "no such column:".len()..].trim().to_string())
    } else {
        None
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::CellStatus;

    #[tokio::test]
    async fn insert_and_retrieve_a_basic_sample() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let sample = HistorySample {
            pack_voltage: Some(48.5),
            battery_current: Some(-1.2),
            soc: Some(87),
            soh: Some(99),
            temp_min: Some(20),
            temp_max: Some(25),
            additional: vec![],
        };
        let id = store
            .insert_history_record(214, 1_700_000_000.0, HistorySource::LiveMonitor, sample, vec![], vec![])
            .await
            .unwrap();
        assert!(id > 0);
    }

    /// Scenario — auto-expand: a sample with an unknown additional column
    /// triggers ALTER TABLE and a single retry.
    #[tokio::test]
    async fn unknown_additional_field_triggers_schema_auto_expand() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let sample = HistorySample {
            additional: vec![("hardware_faults".to_string(), SqlValue::Integer(3))],
            ..Default::default()
        };
        let id = store
            .insert_history_record(214, 1_700_000_001.0, HistorySource::LiveMonitor, sample, vec![], vec![])
            .await
            .unwrap();
        assert!(id > 0);

        // Second insert with the now-known column should not need another expand.
        let sample2 = HistorySample {
            additional: vec![("hardware_faults".to_string(), SqlValue::Integer(0))],
            ..Default::default()
        };
        let id2 = store
            .insert_history_record(214, 1_700_000_002.0, HistorySource::LiveMonitor, sample2, vec![], vec![])
            .await
            .unwrap();
        assert!(id2 > id);
    }

    #[tokio::test]
    async fn duplicate_battery_id_and_timestamp_is_silently_dropped() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let sample = HistorySample::default();
        let id1 = store
            .insert_history_record(214, 1_700_000_003.0, HistorySource::LiveMonitor, sample.clone(), vec![], vec![])
            .await
            .unwrap();
        let id2 = store
            .insert_history_record(214, 1_700_000_003.0, HistorySource::LiveMonitor, sample, vec![], vec![])
            .await
            .unwrap();
        assert!(id1 > 0);
        assert_eq!(id2, -1);
    }

    #[tokio::test]
    async fn cell_voltages_are_persisted_alongside_the_sample() {
        let store = HistoryStore::open_in_memory().await.unwrap();
        let sample = HistorySample::default();
        let cells = vec![CellVoltage { cell_number: 1, voltage: Some(3.65), status: CellStatus::Ok, raw_value: 3650 }];
        let id = store
            .insert_history_record(214, 1_700_000_004.0, HistorySource::LiveMonitor, sample, cells, vec![])
            .await
            .unwrap();
        assert!(id > 0);
    }
}
