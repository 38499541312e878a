//! Monitor Scheduler (`spec.md` §4.9): round-robin polling of registers 0-6
//! for every fleet battery, a live cache of the latest reading, and a
//! time-gated history write. Grounded on
//! `original_source/modbus_app/battery_monitor.py`.
//!
//! Cooperative cancellation: `stop()` flips an atomic flag the loop checks
//! every second, the same granularity the source's polling wait loop uses
//! to stay responsive to `polling_active` going false.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::AuthRegistry;
use crate::config::AdditionalRegister;
use crate::history::{self, HistorySample, HistorySource, HistoryStore};
use crate::protocol::ProtocolEngine;
use crate::transport::Bus;

const POLL_COUNT: u16 = 7;
const INTER_BATTERY_DELAY: Duration = Duration::from_millis(500);
const CANCEL_CHECK_GRANULARITY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum BatteryStatus {
    Charging,
    Discharging,
    Idle,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryReading {
    pub id: u8,
    pub voltage: Option<f64>,
    pub pack_voltage: Option<f64>,
    pub current: Option<f64>,
    pub soc: Option<u16>,
    pub soh: Option<u16>,
    pub temp_max: Option<i64>,
    pub temp_min: Option<i64>,
    pub raw_values: Vec<u16>,
    pub last_updated: f64,
    pub status: BatteryStatus,
    pub error: Option<String>,
}

fn convert_current(raw: u16) -> f64 {
    if raw > 32767 {
        (raw as i32 - 65536) as f64 * 0.01
    } else {
        raw as f64 * 0.01
    }
}

fn determine_status(raw_current: u16) -> BatteryStatus {
    let current = convert_current(raw_current);
    if current > 0.05 {
        BatteryStatus::Charging
    } else if current < -0.05 {
        BatteryStatus::Discharging
    } else {
        BatteryStatus::Idle
    }
}

fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Process-wide, thread-safe table of the latest reading per battery.
#[derive(Clone, Default)]
pub struct LiveCache {
    inner: Arc<std::sync::Mutex<HashMap<u8, BatteryReading>>>,
}

impl LiveCache {
    pub fn get(&self, id: u8) -> Option<BatteryReading> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn get_all(&self) -> Vec<BatteryReading> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    fn set(&self, id: u8, reading: BatteryReading) {
        self.inner.lock().unwrap().insert(id, reading);
    }
}

pub struct MonitorScheduler {
    bus: Arc<Bus>,
    registry: AuthRegistry,
    cache: LiveCache,
    history: Option<HistoryStore>,
    polling_interval: Duration,
    history_interval: Duration,
    additional_registers: Arc<Vec<AdditionalRegister>>,
    include_cells: bool,
    active: Arc<AtomicBool>,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MonitorScheduler {
    pub fn new(
        bus: Arc<Bus>,
        registry: AuthRegistry,
        history: Option<HistoryStore>,
        polling_interval: Duration,
        history_interval: Duration,
    ) -> Self {
        Self::with_history_detail(bus, registry, history, polling_interval, history_interval, Vec::new(), false)
    }

    /// Same as [`MonitorScheduler::new`], additionally configuring the
    /// opportunistic extended fields the History Writer samples
    /// (`spec.md` §4.8, §4.9 steps 2-3).
    pub fn with_history_detail(
        bus: Arc<Bus>,
        registry: AuthRegistry,
        history: Option<HistoryStore>,
        polling_interval: Duration,
        history_interval: Duration,
        additional_registers: Vec<AdditionalRegister>,
        include_cells: bool,
    ) -> Self {
        Self {
            bus,
            registry,
            cache: LiveCache::default(),
            history,
            polling_interval,
            history_interval,
            additional_registers: Arc::new(additional_registers),
            include_cells,
            active: Arc::new(AtomicBool::new(false)),
            handle: AsyncMutex::new(None),
        }
    }

    pub fn cache(&self) -> LiveCache {
        self.cache.clone()
    }

    pub async fn start(&self) -> bool {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("polling already active");
            return false;
        }

        let bus = self.bus.clone();
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let history = self.history.clone();
        let active = self.active.clone();
        let polling_interval = self.polling_interval;
        let history_interval = self.history_interval;
        let additional_registers = self.additional_registers.clone();
        let include_cells = self.include_cells;

        let task = tokio::spawn(async move {
            run_loop(
                bus,
                registry,
                cache,
                history,
                active,
                polling_interval,
                history_interval,
                additional_registers,
                include_cells,
            )
            .await;
        });

        *self.handle.lock().await = Some(task);
        true
    }

    /// Signals the loop to stop and waits up to 2 seconds for it to exit,
    /// mirroring the source's `join(timeout=2.0)`.
    pub async fn stop(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            warn!("no active polling to stop");
            return false;
        }

        let mut guard = self.handle.lock().await;
        if let Some(task) = guard.take() {
            match tokio::time::timeout(Duration::from_secs(2), task).await {
                Ok(_) => {}
                Err(_) => warn!("monitor task did not stop within 2s"),
            }
        }
        true
    }
}

async fn run_loop(
    bus: Arc<Bus>,
    registry: AuthRegistry,
    cache: LiveCache,
    history: Option<HistoryStore>,
    active: Arc<AtomicBool>,
    polling_interval: Duration,
    history_interval: Duration,
    additional_registers: Arc<Vec<AdditionalRegister>>,
    include_cells: bool,
) {
    info!("monitor loop started");
    // Due immediately on the first pass through the fleet, per battery.
    let mut last_history_save: HashMap<u8, std::time::Instant> = HashMap::new();

    while active.load(Ordering::SeqCst) {
        let engine = ProtocolEngine::new(&bus, &registry);
        for id in registry.fleet().to_vec() {
            if !active.load(Ordering::SeqCst) {
                break;
            }
            match engine.read_holding(id, 0, POLL_COUNT).await {
                Ok(raw) if raw.len() >= 5 => {
                    let reading = BatteryReading {
                        id,
                        voltage: raw.first().map(|v| *v as f64 * 0.01),
                        pack_voltage: raw.get(1).map(|v| *v as f64 * 0.01),
                        current: raw.get(2).map(|v| convert_current(*v)),
                        soc: raw.get(3).copied(),
                        soh: raw.get(4).copied(),
                        temp_max: raw.get(5).map(|v| *v as i64),
                        temp_min: raw.get(6).map(|v| *v as i64),
                        raw_values: raw.clone(),
                        last_updated: now_unix(),
                        status: raw.get(2).map(|v| determine_status(*v)).unwrap_or(BatteryStatus::Unknown),
                        error: None,
                    };
                    cache.set(id, reading.clone());

                    if let Some(store) = &history {
                        let due = last_history_save
                            .get(&id)
                            .map(|t| t.elapsed() >= history_interval)
                            .unwrap_or(true);
                        if due {
                            write_history_record(&engine, store, id, &reading, &additional_registers, include_cells)
                                .await;
                            last_history_save.insert(id, std::time::Instant::now());
                        }
                    }
                }
                Ok(_) => {
                    cache.set(id, blank_reading(id, "insufficient data in holding register reply".to_string()));
                }
                Err(err) => {
                    warn!(battery_id = id, %err, "poll failed");
                    cache.set(id, blank_reading(id, err.to_string()));
                }
            }
            tokio::time::sleep(INTER_BATTERY_DELAY).await;
        }

        let mut remaining = polling_interval;
        while remaining > Duration::ZERO && active.load(Ordering::SeqCst) {
            let step = remaining.min(CANCEL_CHECK_GRANULARITY);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
    info!("monitor loop stopped");
}

fn blank_reading(id: u8, error: String) -> BatteryReading {
    BatteryReading {
        id,
        voltage: None,
        pack_voltage: None,
        current: None,
        soc: None,
        soh: None,
        temp_max: None,
        temp_min: None,
        raw_values: vec![],
        last_updated: now_unix(),
        status: BatteryStatus::Unknown,
        error: Some(error),
    }
}

/// The History Writer pipeline (`spec.md` §4.9): starts from the live
/// telemetry already sampled this round, opportunistically reads the
/// additional registers and cell arrays, then commits through the
/// auto-expanding persistence contract.
async fn write_history_record(
    engine: &ProtocolEngine<'_>,
    store: &HistoryStore,
    id: u8,
    reading: &BatteryReading,
    additional_registers: &[AdditionalRegister],
    include_cells: bool,
) {
    let additional = history::read_additional_registers(engine, id, additional_registers).await;
    let (cell_voltages, cell_temperatures) = if include_cells {
        history::read_cell_arrays(engine, id).await
    } else {
        (Vec::new(), Vec::new())
    };

    let sample = HistorySample {
        pack_voltage: reading.pack_voltage,
        battery_current: reading.current,
        soc: reading.soc.map(|v| v as i64),
        soh: reading.soh.map(|v| v as i64),
        temp_min: reading.temp_min,
        temp_max: reading.temp_max,
        additional,
    };

    if let Err(err) = store
        .insert_history_record(id, reading.last_updated, HistorySource::LiveMonitor, sample, cell_voltages, cell_temperatures)
        .await
    {
        error!(battery_id = id, %err, "failed to persist history sample");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_current_above_threshold_is_charging() {
        assert_eq!(determine_status(500), BatteryStatus::Charging); // 5.00A
    }

    #[test]
    fn negative_current_below_threshold_is_discharging() {
        let raw = (65536i32 - 500) as u16; // -5.00A in two's complement
        assert_eq!(determine_status(raw), BatteryStatus::Discharging);
    }

    #[test]
    fn near_zero_current_is_idle() {
        assert_eq!(determine_status(2), BatteryStatus::Idle); // 0.02A
    }

    #[test]
    fn convert_current_handles_twos_complement() {
        assert!((convert_current(65436) - (-1.0)).abs() < 1e-9); // 65536-65436=100 -> -1.00A
    }
}
