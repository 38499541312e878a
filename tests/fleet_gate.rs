//! Cross-module scenario: the Operation Gate only opens once every
//! configured battery has worked through the registry to SUCCESS, the way
//! the initializer would drive them (`spec.md` §8).

use huawei_esm_fleet::auth::{AuthRegistry, Phase, PhaseState};
use huawei_esm_fleet::error::Error;
use huawei_esm_fleet::gate;

#[test]
fn gate_opens_only_after_the_whole_fleet_authenticates() {
    let fleet = vec![214, 215, 216];
    let registry = AuthRegistry::new(fleet.clone());
    for &id in &fleet {
        registry.initialize(id);
    }

    assert!(gate::check(&registry).is_err());

    for &id in &fleet[..2] {
        for phase in Phase::ALL {
            registry.update_phase(id, phase, PhaseState::Success, "ok");
        }
    }

    match gate::check(&registry).unwrap_err() {
        Error::OperationBlocked { failed_ids } => assert_eq!(failed_ids, vec![216]),
        other => panic!("unexpected error: {other:?}"),
    }

    for phase in Phase::ALL {
        registry.update_phase(216, phase, PhaseState::Success, "ok");
    }
    assert!(gate::check(&registry).is_ok());
}

#[test]
fn one_failed_battery_keeps_the_gate_closed_even_if_others_succeed() {
    let fleet = vec![214, 215];
    let registry = AuthRegistry::new(fleet.clone());
    for &id in &fleet {
        registry.initialize(id);
    }

    for phase in Phase::ALL {
        registry.update_phase(214, phase, PhaseState::Success, "ok");
    }
    registry.update_phase(215, Phase::WakeUp, PhaseState::Failed, "no response after 5 attempts");

    match gate::check(&registry).unwrap_err() {
        Error::OperationBlocked { failed_ids } => assert_eq!(failed_ids, vec![215]),
        other => panic!("unexpected error: {other:?}"),
    }
}
