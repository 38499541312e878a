//! Controller and aggregation service for a fleet of Huawei ESM lithium
//! battery modules sharing one RS-485 bus.
//!
//! A single [`Bus`] owns the serial port and serializes every transaction;
//! battery ids are never addressed concurrently. [`Fleet`] wires the bus to
//! the authentication registry, device-info cache, and monitor scheduler so
//! that initialization and polling share the same bus and the same view of
//! which batteries are currently authenticated.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use huawei_esm_fleet::{Config, Fleet};
//! # #[tokio::main]
//! # async fn main() -> huawei_esm_fleet::error::Result<()> {
//! let mut config = Config::default();
//! config.fleet = vec![214, 215];
//! let fleet = Fleet::open(config).await?;
//! let report = fleet.initialize().await;
//! println!("{report:?}");
//! fleet.start_monitoring().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod device_info;
pub mod error;
pub mod frame;
pub mod gate;
pub mod history;
pub mod initializer;
pub mod logging;
pub mod monitor;
pub mod protocol;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use auth::AuthRegistry;
pub use config::Config;
pub use device_info::DeviceInfoCache;
pub use error::{Error, Result};
pub use initializer::{InitializationReport, Initializer};
pub use monitor::{LiveCache, MonitorScheduler};
pub use protocol::ProtocolEngine;
pub use transport::Bus;

/// Owns every shared piece of fleet state: the bus, the auth registry, the
/// device-info cache, and the monitor scheduler. This is the unit a host
/// process constructs once at startup.
pub struct Fleet {
    bus: Arc<Bus>,
    registry: AuthRegistry,
    device_info: DeviceInfoCache,
    scheduler: MonitorScheduler,
}

impl Fleet {
    /// Opens the serial port and wires up the registry, cache, and
    /// scheduler for `config.fleet`. Does not talk to any battery yet —
    /// call [`Fleet::initialize`] next.
    pub async fn open(config: Config) -> Result<Self> {
        logging::init(&config.logging);

        let bus = Arc::new(Bus::open(&config.serial)?);
        let registry = AuthRegistry::new(config.fleet.clone());
        let device_info = DeviceInfoCache::new();

        let history = if config.monitoring.history_enabled {
            Some(history::HistoryStore::open("battery_history.db".to_string()).await?)
        } else {
            None
        };

        let polling_interval = Duration::from_secs(8);
        let history_interval = Duration::from_secs_f64(config.monitoring.history_interval_minutes * 60.0);
        let scheduler = MonitorScheduler::with_history_detail(
            bus.clone(),
            registry.clone(),
            history,
            polling_interval,
            history_interval,
            config.monitoring.additional_registers.clone(),
            config.monitoring.history_include_cells,
        );

        Ok(Self { bus, registry, device_info, scheduler })
    }

    pub fn registry(&self) -> &AuthRegistry {
        &self.registry
    }

    pub fn device_info(&self) -> &DeviceInfoCache {
        &self.device_info
    }

    pub fn live_cache(&self) -> LiveCache {
        self.scheduler.cache()
    }

    /// Drives every configured battery through wake-up, authenticate, and
    /// read-info, sequentially.
    pub async fn initialize(&self) -> InitializationReport {
        let initializer = Initializer::new(&self.bus, &self.registry, &self.device_info);
        initializer.initialize_fleet().await
    }

    pub async fn start_monitoring(&self) -> bool {
        self.scheduler.start().await
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.scheduler.stop().await
    }

    /// Runs a gated read/write operation through the Operation Gate
    /// (`spec.md` §4.10): refuses to proceed if any configured battery has
    /// not yet fully authenticated.
    pub fn protocol_engine(&self) -> Result<ProtocolEngine<'_>> {
        gate::check(&self.registry)?;
        Ok(ProtocolEngine::new(&self.bus, &self.registry))
    }
}
