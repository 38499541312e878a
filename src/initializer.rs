//! Battery Initializer (`spec.md` §4.7): drives each configured battery
//! through wake-up, authenticate, and read-info, sequentially, grounded on
//! `original_source/modbus_app/battery_initializer.py`.
//!
//! The wake-up retry schedule here is exponential (1s, 2s, 4s, 8s, 16s over
//! 5 attempts) per the governing specification, not the source's linear
//! `attempt * 0.5s` over 3 attempts.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::{self, AuthRegistry, Phase, PhaseState};
use crate::device_info::DeviceInfoCache;
use crate::frame;
use crate::protocol::ProtocolEngine;
use crate::transport::{Bus, Timeouts};

const WAKE_UP_MAX_ATTEMPTS: u32 = 5;
const INFO_INDICES: [u8; 6] = [0, 1, 2, 3, 4, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatteryOutcome {
    Success,
    WakeUpFailed,
    AuthFailed,
    InfoFailed,
    Incompatible,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryInitResult {
    pub battery_id: u8,
    pub outcome: BatteryOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallStatus {
    Success,
    Partial,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitializationReport {
    pub status: OverallStatus,
    pub initialized_count: usize,
    pub failed_count: usize,
    pub wake_failures: Vec<u8>,
    pub auth_failures: Vec<u8>,
    pub info_failures: Vec<u8>,
    pub per_battery: Vec<BatteryInitResult>,
}

impl InitializationReport {
    /// Renders the report the way an external caller (API layer, log
    /// sink) would consume it — `spec.md` §6 external interfaces are all
    /// JSON-shaped.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub struct Initializer<'a> {
    bus: &'a Bus,
    registry: &'a AuthRegistry,
    device_info: &'a DeviceInfoCache,
}

impl<'a> Initializer<'a> {
    pub fn new(bus: &'a Bus, registry: &'a AuthRegistry, device_info: &'a DeviceInfoCache) -> Self {
        Self { bus, registry, device_info }
    }

    /// Runs the full fleet sequentially: one battery's three phases finish
    /// before the next starts, since every phase ultimately serializes on
    /// the same bus mutex anyway.
    pub async fn initialize_fleet(&self) -> InitializationReport {
        let mut per_battery = Vec::new();
        let mut wake_failures = Vec::new();
        let mut auth_failures = Vec::new();
        let mut info_failures = Vec::new();

        for &id in self.registry.fleet() {
            self.registry.initialize(id);
            let result = self.initialize_one(id).await;
            match result.outcome {
                BatteryOutcome::WakeUpFailed => wake_failures.push(id),
                BatteryOutcome::AuthFailed => auth_failures.push(id),
                BatteryOutcome::InfoFailed | BatteryOutcome::Incompatible => info_failures.push(id),
                BatteryOutcome::Success => {}
            }
            per_battery.push(result);
        }

        let initialized_count = per_battery.iter().filter(|r| r.outcome == BatteryOutcome::Success).count();
        let failed_count = per_battery.len() - initialized_count;
        let status = if failed_count == 0 {
            OverallStatus::Success
        } else if initialized_count == 0 {
            OverallStatus::Error
        } else {
            OverallStatus::Partial
        };

        InitializationReport {
            status,
            initialized_count,
            failed_count,
            wake_failures,
            auth_failures,
            info_failures,
            per_battery,
        }
    }

    async fn initialize_one(&self, id: u8) -> BatteryInitResult {
        self.registry.update_phase(id, Phase::WakeUp, PhaseState::InProgress, "waking up battery");
        if let Err(message) = self.wake_up(id).await {
            self.registry.update_phase(id, Phase::WakeUp, PhaseState::Failed, message.clone());
            warn!(battery_id = id, %message, "wake up failed");
            return BatteryInitResult { battery_id: id, outcome: BatteryOutcome::WakeUpFailed, message };
        }
        self.registry.update_phase(id, Phase::WakeUp, PhaseState::Success, "wake up succeeded");

        self.registry.update_phase(id, Phase::Authenticate, PhaseState::InProgress, "authenticating");
        if let Err(err) = auth::authenticate(self.bus, id).await {
            let message = err.to_string();
            self.registry.update_phase(id, Phase::Authenticate, PhaseState::Failed, message.clone());
            error!(battery_id = id, %message, "authentication failed");
            return BatteryInitResult { battery_id: id, outcome: BatteryOutcome::AuthFailed, message };
        }
        self.registry.update_phase(id, Phase::Authenticate, PhaseState::Success, "authenticated");

        self.registry.update_phase(id, Phase::ReadInfo, PhaseState::InProgress, "reading device info");
        let combined_text = self.read_info(id).await;
        if combined_text.is_empty() {
            let message = "no fc41 device-info index returned printable bytes".to_string();
            self.registry.update_phase(id, Phase::ReadInfo, PhaseState::Failed, message.clone());
            error!(battery_id = id, "read info failed: empty combined text");
            return BatteryInitResult { battery_id: id, outcome: BatteryOutcome::InfoFailed, message };
        }

        self.device_info.insert(id, combined_text);
        let cached = self.device_info.get(id).unwrap();
        self.registry.update_phase(id, Phase::ReadInfo, PhaseState::Success, "device info read");
        if !cached.info.is_huawei {
            let message = format!(
                "incompatible device: {} {}",
                cached.info.vendor_name.as_deref().unwrap_or("unknown"),
                cached.info.model.as_deref().unwrap_or("unknown")
            );
            warn!(battery_id = id, %message, "incompatible device");
            return BatteryInitResult { battery_id: id, outcome: BatteryOutcome::Incompatible, message };
        }
        info!(battery_id = id, vendor = ?cached.info.vendor_name, model = ?cached.info.model, "battery initialized");
        BatteryInitResult {
            battery_id: id,
            outcome: BatteryOutcome::Success,
            message: format!("battery {id} initialized successfully"),
        }
    }

    /// Reads holding register 0 in a loop with exponential backoff until the
    /// battery answers, confirming it is awake on the bus.
    async fn wake_up(&self, id: u8) -> Result<(), String> {
        for attempt in 1..=WAKE_UP_MAX_ATTEMPTS {
            let request = frame::encode(id, 0x03, &[0x00, 0x00, 0x00, 0x01]);
            let reply = self
                .bus
                .transact(&request, Some(7), Timeouts::READ_WRITE_COILS_REGISTERS)
                .await
                .map_err(|e| e.to_string())?;

            if reply.len() == 7 && reply[0] == id && reply[1] == 0x03 {
                let voltage_raw = ((reply[3] as u16) << 8) | reply[4] as u16;
                let voltage = voltage_raw as f64 * 0.01;
                info!(battery_id = id, voltage, attempt, "battery woke up");
                return Ok(());
            }
            warn!(battery_id = id, attempt, "invalid wake-up response");

            if attempt < WAKE_UP_MAX_ATTEMPTS {
                let wait = std::time::Duration::from_secs(1u64 << (attempt - 1));
                tokio::time::sleep(wait).await;
            }
        }
        Err(format!("no response from battery {id} after {WAKE_UP_MAX_ATTEMPTS} wake-up attempts"))
    }

    /// Reads all six FC41 device-info indices and concatenates them into one
    /// text blob for the parser. A single index erroring or coming back
    /// empty doesn't abort the read — the phase only fails once every index
    /// has produced nothing printable (`spec.md` §4.7 step 4).
    async fn read_info(&self, id: u8) -> String {
        let engine = ProtocolEngine::new(self.bus, self.registry);
        let mut combined = String::new();
        for &index in &INFO_INDICES {
            match engine.read_device_info_fc41(id, index).await {
                Ok(text) if !text.trim().is_empty() => {
                    combined.push_str(&text);
                    combined.push('\n');
                }
                Ok(_) => warn!(battery_id = id, index, "fc41 device-info index returned no printable bytes"),
                Err(err) => warn!(battery_id = id, index, %err, "fc41 device-info index failed"),
            }
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_up_backoff_is_exponential() {
        let waits: Vec<u64> = (1..WAKE_UP_MAX_ATTEMPTS).map(|attempt| 1u64 << (attempt - 1)).collect();
        assert_eq!(waits, vec![1, 2, 4, 8]);
    }

    #[test]
    fn overall_status_is_partial_when_some_but_not_all_succeed() {
        let per_battery = vec![
            BatteryInitResult { battery_id: 1, outcome: BatteryOutcome::Success, message: "ok".into() },
            BatteryInitResult { battery_id: 2, outcome: BatteryOutcome::WakeUpFailed, message: "nope".into() },
        ];
        let initialized_count = per_battery.iter().filter(|r| r.outcome == BatteryOutcome::Success).count();
        let failed_count = per_battery.len() - initialized_count;
        let status = if failed_count == 0 {
            OverallStatus::Success
        } else if initialized_count == 0 {
            OverallStatus::Error
        } else {
            OverallStatus::Partial
        };
        assert_eq!(status, OverallStatus::Partial);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = InitializationReport {
            status: OverallStatus::Success,
            initialized_count: 1,
            failed_count: 0,
            wake_failures: vec![],
            auth_failures: vec![],
            info_failures: vec![],
            per_battery: vec![BatteryInitResult { battery_id: 214, outcome: BatteryOutcome::Success, message: "ok".into() }],
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"initialized_count\":1"));
    }
}
