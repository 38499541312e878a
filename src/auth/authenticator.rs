//! The three-step Huawei unlock handshake (`spec.md` §4.4), grounded on
//! `original_source/modbus_app/huawei_client/authentication.py`.

use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::{Bus, Timeouts};

const STEP1_FC: u8 = 0x03;
const STEP2_FC: u8 = 0x10;
const STEP3_FC: u8 = 0x41;

const AFTER_STEP1_DELAY: Duration = Duration::from_millis(500);
const AFTER_STEP2_DELAY: Duration = Duration::from_millis(800);
const AFTER_STEP3_DELAY: Duration = Duration::from_millis(300);

/// Runs the full 3-step handshake for `slave` against `bus`. On success the
/// caller (the `Authenticator`'s caller — `Initializer` or `ProtocolEngine`)
/// is responsible for recording `Authenticate` phase SUCCESS in the
/// `AuthRegistry`.
pub async fn authenticate(bus: &Bus, slave: u8) -> Result<()> {
    info!(slave, "starting authentication sequence");

    step1_unlock(bus, slave).await?;
    tokio::time::sleep(AFTER_STEP1_DELAY).await;

    step2_datetime_sync(bus, slave).await?;
    tokio::time::sleep(AFTER_STEP2_DELAY).await;

    step3_access_validation(bus, slave).await?;
    tokio::time::sleep(AFTER_STEP3_DELAY).await;

    info!(slave, "authentication sequence succeeded");
    Ok(())
}

/// Step 1 — Unlock (FC03 variant). `[slave 03 01 06 00 01]` -> 7 byte reply
/// `[slave 03 02 00 XX]`. The acceptance rule on `reply[3]` is an Open
/// Question in `spec.md` §9: the source only ever observed 0x00 and treats
/// anything else as failure, so that rule is preserved as-is.
async fn step1_unlock(bus: &Bus, slave: u8) -> Result<()> {
    let request = crate::frame::encode(slave, STEP1_FC, &[0x01, 0x06, 0x00, 0x01]);
    let reply = bus.transact(&request, Some(7), Timeouts::AUTH_STEP).await?;
    debug!(slave, reply = %hex::encode(&reply), "step1 reply");

    if reply.len() != 7 {
        return Err(Error::AuthStepFailed {
            step: 1,
            detail: format!("expected 7 byte reply, got {}", reply.len()),
        });
    }
    if reply[0] != slave || reply[1] != 0x03 {
        return Err(Error::AuthStepFailed { step: 1, detail: "slave/fc mismatch".into() });
    }
    if reply[2] != 0x02 {
        return Err(Error::AuthStepFailed {
            step: 1,
            detail: format!("unexpected byte count {:#04x}", reply[2]),
        });
    }
    if reply[3] != 0x00 {
        return Err(Error::AuthStepFailed {
            step: 1,
            detail: format!("unexpected byte[3] {:#04x}", reply[3]),
        });
    }
    Ok(())
}

/// Step 2 — DateTime Sync (FC10). Writes 6 registers at 0x1000 with the
/// current local wall clock. Not a cryptographic timestamp; correctness only
/// depends on the device's echo (`spec.md` §9) — NTP sync is deliberately
/// not attempted.
async fn step2_datetime_sync(bus: &Bus, slave: u8) -> Result<()> {
    let now = Local::now();
    let year = now.year() as u16;
    let payload = [
        0x10, 0x00, // address 0x1000
        0x00, 0x06, // 6 registers
        0x0C, // byte count = 12
        (year >> 8) as u8,
        year as u8,
        0x00,
        now.month() as u8,
        0x00,
        now.day() as u8,
        0x00,
        now.hour() as u8,
        0x00,
        now.minute() as u8,
        0x00,
        now.second() as u8,
    ];
    let request = crate::frame::encode(slave, STEP2_FC, &payload);
    let reply = bus.transact(&request, Some(8), Timeouts::AUTH_STEP).await?;
    debug!(slave, reply = %hex::encode(&reply), "step2 reply");

    if reply.len() != 8 {
        return Err(Error::AuthStepFailed {
            step: 2,
            detail: format!("expected 8 byte reply, got {}", reply.len()),
        });
    }
    let expected = [slave, 0x10, 0x10, 0x00, 0x00, 0x06];
    if reply[..6] != expected {
        return Err(Error::AuthStepFailed { step: 2, detail: "address/count echo mismatch".into() });
    }
    Ok(())
}

/// Step 3 — Access Validation (FC41). `[slave 41 05 01 04]` -> reply of at
/// least 9 bytes, `reply[2]==0x05`, `reply[3]==0x06`.
async fn step3_access_validation(bus: &Bus, slave: u8) -> Result<()> {
    let request = crate::frame::encode(slave, STEP3_FC, &[0x05, 0x01, 0x04]);
    let reply = bus.transact(&request, Some(12), Timeouts::AUTH_STEP).await?;
    debug!(slave, reply = %hex::encode(&reply), "step3 reply");

    if reply.len() < 9 {
        return Err(Error::AuthStepFailed {
            step: 3,
            detail: format!("expected at least 9 bytes, got {}", reply.len()),
        });
    }
    if reply[0] != slave || reply[1] != 0x41 {
        return Err(Error::AuthStepFailed { step: 3, detail: "slave/fc mismatch".into() });
    }
    if reply[2] != 0x05 || reply[3] != 0x06 {
        return Err(Error::AuthStepFailed {
            step: 3,
            detail: format!("unexpected header bytes {:#04x} {:#04x}", reply[2], reply[3]),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 2 — authentication step 1 reply validation, exercised
    /// directly against the wire-level acceptance rule (no transport).
    #[test]
    fn step1_accepts_canonical_reply_shape() {
        let reply: Vec<u8> = hex::decode("D90302 00 CBD9C0".replace(' ', "")).unwrap();
        assert_eq!(reply.len(), 7);
        assert_eq!(reply[0], 0xD9);
        assert_eq!(reply[1], 0x03);
        assert_eq!(reply[2], 0x02);
        assert_eq!(reply[3], 0x00);
    }

    #[test]
    fn step1_rejects_unexpected_byte3() {
        let reply: Vec<u8> = hex::decode("D9030201CBD9C0").unwrap();
        assert_eq!(reply[3], 0x01);
        // byte[3] != 0x00 is the documented failure condition (spec.md §9 open question 1)
    }
}
