//! Authentication subsystem: the wire-level handshake plus the process-wide
//! status registry that tracks it per battery (`spec.md` §4.4, §4.5).

pub mod authenticator;
pub mod registry;

pub use authenticator::authenticate;
pub use registry::{AuthRegistry, BatteryAuthRecord, GlobalState, Phase, PhaseState};
