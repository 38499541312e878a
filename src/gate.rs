//! Operation Gate (`spec.md` §4.10): a pure predicate that blocks
//! read/write/history operations until the whole configured fleet has
//! authenticated. It never gates the monitor loop itself.

use crate::auth::AuthRegistry;
use crate::error::{Error, Result};

/// Returns `Ok(())` if every configured battery is authenticated, otherwise
/// `Error::OperationBlocked` naming the ones that are not.
pub fn check(registry: &AuthRegistry) -> Result<()> {
    if registry.all_authenticated() {
        Ok(())
    } else {
        Err(Error::OperationBlocked { failed_ids: registry.failed_ids() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Phase, PhaseState};

    #[test]
    fn passes_when_entire_fleet_authenticated() {
        let registry = AuthRegistry::new(vec![214]);
        registry.initialize(214);
        for phase in Phase::ALL {
            registry.update_phase(214, phase, PhaseState::Success, "ok");
        }
        assert!(check(&registry).is_ok());
    }

    /// Scenario — a not-yet-authenticated battery in the fleet blocks
    /// operations for the whole bus.
    #[test]
    fn blocks_when_any_configured_battery_is_not_authenticated() {
        let registry = AuthRegistry::new(vec![214, 215]);
        registry.initialize(214);
        for phase in Phase::ALL {
            registry.update_phase(214, phase, PhaseState::Success, "ok");
        }
        registry.initialize(215);

        let err = check(&registry).unwrap_err();
        match err {
            Error::OperationBlocked { failed_ids } => assert_eq!(failed_ids, vec![215]),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
