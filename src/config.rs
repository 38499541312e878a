//! Configuration shapes (`spec.md` §6). Loading these from a file or
//! environment is out of scope for the core (`spec.md` §1) — callers build
//! and pass in a `Config`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    N,
    E,
    O,
}

impl Parity {
    pub fn to_parity(self) -> tokio_serial::Parity {
        match self {
            Parity::N => tokio_serial::Parity::None,
            Parity::E => tokio_serial::Parity::Even,
            Parity::O => tokio_serial::Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One = 1,
    Two = 2,
}

impl StopBits {
    pub fn to_stop_bits(self) -> tokio_serial::StopBits {
        match self {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteSize {
    Seven = 7,
    Eight = 8,
}

impl ByteSize {
    pub fn to_data_bits(self) -> tokio_serial::DataBits {
        match self {
            ByteSize::Seven => tokio_serial::DataBits::Seven,
            ByteSize::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub bytesize: ByteSize,
    /// Default read timeout in seconds, overridden per function code by
    /// `crate::transport::Timeouts`.
    pub timeout: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 9600,
            parity: Parity::N,
            stopbits: StopBits::One,
            bytesize: ByteSize::Eight,
            timeout: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub last_connected_id: Option<u8>,
    pub discovered_devices: Vec<u8>,
}

/// Whether an additional register the History Writer samples (`spec.md`
/// §4.8) is a direct 16-bit value or the high/low word pair of a 32-bit one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterWidth {
    Bit16,
    Bit32,
}

/// One opportunistic holding-register sample the History Writer adds to a
/// record beyond the always-present basic telemetry (`spec.md` §4.8, §4.9
/// step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalRegister {
    pub address: u16,
    pub field: String,
    pub width: RegisterWidth,
}

fn default_additional_registers() -> Vec<AdditionalRegister> {
    vec![
        AdditionalRegister { address: 0x0042, field: "discharge_times".into(), width: RegisterWidth::Bit32 },
        AdditionalRegister { address: 0x0044, field: "discharge_ah".into(), width: RegisterWidth::Bit32 },
        AdditionalRegister { address: 0x0046, field: "hardware_fault_indicator".into(), width: RegisterWidth::Bit16 },
        AdditionalRegister { address: 0x0048, field: "main_sensors_status".into(), width: RegisterWidth::Bit16 },
        AdditionalRegister { address: 0x0049, field: "operation_mode".into(), width: RegisterWidth::Bit16 },
        AdditionalRegister { address: 0x004A, field: "subsystem_status".into(), width: RegisterWidth::Bit16 },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub history_enabled: bool,
    pub history_interval_minutes: f64,
    pub history_include_cells: bool,
    pub additional_registers: Vec<AdditionalRegister>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            history_enabled: true,
            history_interval_minutes: 2.0,
            history_include_cells: true,
            additional_registers: default_additional_registers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanningConfig {
    pub start_id: u8,
    pub end_id: u8,
    pub max_attempts: u32,
    pub progressive_wait: bool,
    pub scan_timeout: f64,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            start_id: 1,
            end_id: 247,
            max_attempts: 5,
            progressive_wait: true,
            scan_timeout: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    None,
}

impl LogLevel {
    pub fn as_env_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
            LogLevel::None => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub verbose_modules: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            verbose_modules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,
    pub application: ApplicationConfig,
    pub monitoring: MonitoringConfig,
    pub scanning: ScanningConfig,
    pub logging: LoggingConfig,
    /// The configured fleet: the set of battery ids the Operation Gate
    /// requires to be fully authenticated (`spec.md` §3, §4.10).
    pub fleet: Vec<u8>,
}
