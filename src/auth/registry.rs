//! Auth Status Registry (`spec.md` §3, §4.5): per-battery three-phase
//! authentication state, thread-safe, process-wide.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Last N transition messages kept per battery (`spec.md` §3, "N >= 5").
const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhaseState {
    NotStarted,
    InProgress,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GlobalState {
    Waiting,
    InProgress,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    WakeUp,
    Authenticate,
    ReadInfo,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::WakeUp, Phase::Authenticate, Phase::ReadInfo];
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub state: PhaseState,
    pub message: String,
    pub timestamp: Option<f64>,
}

impl PhaseRecord {
    fn not_started() -> Self {
        Self { state: PhaseState::NotStarted, message: "waiting to start".to_string(), timestamp: None }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionEntry {
    pub phase: Phase,
    pub state: PhaseState,
    pub message: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryAuthRecord {
    pub battery_id: u8,
    pub global_state: GlobalState,
    pub wake_up: PhaseRecord,
    pub authenticate: PhaseRecord,
    pub read_info: PhaseRecord,
    pub history: Vec<TransitionEntry>,
}

impl BatteryAuthRecord {
    fn new(battery_id: u8) -> Self {
        Self {
            battery_id,
            global_state: GlobalState::Waiting,
            wake_up: PhaseRecord::not_started(),
            authenticate: PhaseRecord::not_started(),
            read_info: PhaseRecord::not_started(),
            history: Vec::new(),
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        match phase {
            Phase::WakeUp => &mut self.wake_up,
            Phase::Authenticate => &mut self.authenticate,
            Phase::ReadInfo => &mut self.read_info,
        }
    }

    fn phase(&self, phase: Phase) -> &PhaseRecord {
        match phase {
            Phase::WakeUp => &self.wake_up,
            Phase::Authenticate => &self.authenticate,
            Phase::ReadInfo => &self.read_info,
        }
    }

    /// Derivation order from `spec.md` §3 — FAILED dominates, then all-SUCCESS,
    /// then any IN_PROGRESS, then any SUCCESS (partial), else WAITING.
    fn recompute_global_state(&mut self) {
        let states: Vec<PhaseState> = Phase::ALL.iter().map(|p| self.phase(*p).state).collect();

        self.global_state = if states.iter().any(|s| *s == PhaseState::Failed) {
            GlobalState::Failed
        } else if states.iter().all(|s| *s == PhaseState::Success) {
            GlobalState::Success
        } else if states.iter().any(|s| *s == PhaseState::InProgress) {
            GlobalState::InProgress
        } else if states.iter().any(|s| *s == PhaseState::Success) {
            GlobalState::InProgress
        } else {
            GlobalState::Waiting
        };
    }
}

fn now_unix() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Process-wide table mapping battery id to its authentication record.
/// Cheaply cloneable — clone the `Arc` to share across tasks.
#[derive(Clone)]
pub struct AuthRegistry {
    inner: std::sync::Arc<Mutex<HashMap<u8, BatteryAuthRecord>>>,
    fleet: std::sync::Arc<Vec<u8>>,
}

impl AuthRegistry {
    /// `fleet` is the full set of configured battery ids (`spec.md` §4.5
    /// `all_authenticated`'s "known ids equals the configured fleet").
    pub fn new(fleet: Vec<u8>) -> Self {
        Self { inner: std::sync::Arc::new(Mutex::new(HashMap::new())), fleet: std::sync::Arc::new(fleet) }
    }

    pub fn initialize(&self, id: u8) {
        let mut map = self.inner.lock().unwrap();
        map.insert(id, BatteryAuthRecord::new(id));
    }

    pub fn update_phase(&self, id: u8, phase: Phase, state: PhaseState, message: impl Into<String>) {
        let message = message.into();
        let mut map = self.inner.lock().unwrap();
        let record = map.entry(id).or_insert_with(|| BatteryAuthRecord::new(id));
        let ts = now_unix();
        {
            let phase_record = record.phase_mut(phase);
            phase_record.state = state;
            phase_record.message = message.clone();
            phase_record.timestamp = Some(ts);
        }
        record.history.push(TransitionEntry { phase, state, message, timestamp: ts });
        if record.history.len() > MAX_HISTORY {
            let excess = record.history.len() - MAX_HISTORY;
            record.history.drain(0..excess);
        }
        record.recompute_global_state();
    }

    pub fn get(&self, id: u8) -> Option<BatteryAuthRecord> {
        self.inner.lock().unwrap().get(&id).cloned()
    }

    pub fn get_all(&self) -> Vec<BatteryAuthRecord> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn reset(&self, id: u8) {
        self.initialize(id);
    }

    pub fn reset_all(&self) {
        let ids: Vec<u8> = self.inner.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.initialize(id);
        }
    }

    pub fn fleet(&self) -> &[u8] {
        &self.fleet
    }

    /// True iff the known ids equal the configured fleet and every record is
    /// SUCCESS (`spec.md` §4.5).
    pub fn all_authenticated(&self) -> bool {
        let map = self.inner.lock().unwrap();
        self.fleet.iter().all(|id| {
            map.get(id).map(|r| r.global_state == GlobalState::Success).unwrap_or(false)
        })
    }

    pub fn failed_ids(&self) -> Vec<u8> {
        let map = self.inner.lock().unwrap();
        self.fleet
            .iter()
            .copied()
            .filter(|id| {
                map.get(id).map(|r| r.global_state != GlobalState::Success).unwrap_or(true)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_battery_is_waiting() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        let record = registry.get(214).unwrap();
        assert_eq!(record.global_state, GlobalState::Waiting);
    }

    #[test]
    fn any_failed_phase_dominates() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        registry.update_phase(214, Phase::WakeUp, PhaseState::Success, "ok");
        registry.update_phase(214, Phase::Authenticate, PhaseState::Failed, "step 1 failed");
        registry.update_phase(214, Phase::ReadInfo, PhaseState::InProgress, "reading");
        assert_eq!(registry.get(214).unwrap().global_state, GlobalState::Failed);
    }

    #[test]
    fn all_success_yields_success() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        for phase in Phase::ALL {
            registry.update_phase(214, phase, PhaseState::Success, "ok");
        }
        assert_eq!(registry.get(214).unwrap().global_state, GlobalState::Success);
    }

    #[test]
    fn partial_success_is_in_progress() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        registry.update_phase(214, Phase::WakeUp, PhaseState::Success, "ok");
        assert_eq!(registry.get(214).unwrap().global_state, GlobalState::InProgress);
    }

    #[test]
    fn any_in_progress_is_in_progress() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        registry.update_phase(214, Phase::WakeUp, PhaseState::InProgress, "waking");
        assert_eq!(registry.get(214).unwrap().global_state, GlobalState::InProgress);
    }

    #[test]
    fn all_authenticated_requires_full_fleet() {
        let registry = AuthRegistry::new(vec![214, 215]);
        registry.initialize(214);
        for phase in Phase::ALL {
            registry.update_phase(214, phase, PhaseState::Success, "ok");
        }
        assert!(!registry.all_authenticated());

        registry.initialize(215);
        for phase in Phase::ALL {
            registry.update_phase(215, phase, PhaseState::Success, "ok");
        }
        assert!(registry.all_authenticated());
    }

    #[test]
    fn failed_ids_reports_non_success_members_of_the_fleet() {
        let registry = AuthRegistry::new(vec![214, 215]);
        registry.initialize(214);
        for phase in Phase::ALL {
            registry.update_phase(214, phase, PhaseState::Success, "ok");
        }
        registry.initialize(215);
        registry.update_phase(215, Phase::Authenticate, PhaseState::Failed, "bad echo");
        assert_eq!(registry.failed_ids(), vec![215]);
    }

    #[test]
    fn history_is_bounded_to_fifty_entries() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        for i in 0..60 {
            registry.update_phase(214, Phase::WakeUp, PhaseState::InProgress, format!("attempt {i}"));
        }
        let record = registry.get(214).unwrap();
        assert_eq!(record.history.len(), 50);
        assert_eq!(record.history.last().unwrap().message, "attempt 59");
    }

    #[test]
    fn reset_clears_back_to_fresh() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        registry.update_phase(214, Phase::WakeUp, PhaseState::Failed, "boom");
        registry.reset(214);
        assert_eq!(registry.get(214).unwrap().global_state, GlobalState::Waiting);
    }
}
