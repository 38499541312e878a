//! Device Info Cache (`spec.md` §4.6): per-battery parsed identification
//! block plus the raw combined text it was derived from.

pub mod parser;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub use parser::{parse_device_info_from_combined, DeviceInfo};

#[derive(Debug, Clone, Serialize)]
pub struct CachedDeviceInfo {
    pub info: DeviceInfo,
    pub combined_text: String,
    pub parsed_at: f64,
}

/// Process-wide, thread-safe cache keyed by battery id. Populated once per
/// battery by the `ReadInfo` phase and read by API/export callers afterward
/// — never re-derived on the hot polling path.
#[derive(Clone, Default)]
pub struct DeviceInfoCache {
    inner: Arc<Mutex<HashMap<u8, CachedDeviceInfo>>>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u8, combined_text: String) {
        let info = parse_device_info_from_combined(&combined_text);
        let parsed_at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
        self.inner.lock().unwrap().insert(id, CachedDeviceInfo { info, combined_text, parsed_at });
    }

    pub fn get(&self, id: u8) -> Option<CachedDeviceInfo> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn get_all(&self) -> HashMap<u8, CachedDeviceInfo> {
        self.inner.lock().unwrap().clone()
    }

    pub fn remove(&self, id: u8) {
        self.inner.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let cache = DeviceInfoCache::new();
        cache.insert(214, "VendorName=Huawei\nModel=ESM-48150B1\n".to_string());
        let cached = cache.get(214).unwrap();
        assert_eq!(cached.info.vendor_name.as_deref(), Some("Huawei"));
    }

    #[test]
    fn missing_id_returns_none() {
        let cache = DeviceInfoCache::new();
        assert!(cache.get(99).is_none());
    }
}
