//! Protocol Engine (`spec.md` §4.3): standard Modbus commands plus the
//! Huawei FC41 vendor extension, grounded on
//! `original_source/modbus_app/huawei_client/protocol.py`.

use tracing::warn;

use crate::auth::{self, AuthRegistry, Phase, PhaseState};
use crate::error::{Error, Result};
use crate::frame::{self, ReadKind};
use crate::transport::{Bus, Timeouts};

/// History record fields decoded from a 32-byte FC41 history payload
/// (`_decode_history_record`). Multi-byte fields in the history payload are
/// little-endian, unlike standard Modbus registers, which are big-endian.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistoryRecord {
    pub record_number: u16,
    pub pack_voltage: f64,
    pub battery_current: f64,
    pub temp_low: u8,
    pub temp_high: u8,
    pub soc: u8,
    pub discharge_ah: u16,
    pub discharge_times: u8,
    pub battery_voltage: f64,
}

pub struct ProtocolEngine<'a> {
    bus: &'a Bus,
    registry: &'a AuthRegistry,
}

impl<'a> ProtocolEngine<'a> {
    pub fn new(bus: &'a Bus, registry: &'a AuthRegistry) -> Self {
        Self { bus, registry }
    }

    pub async fn read_holding(&self, slave: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers(slave, 0x03, address, count).await
    }

    pub async fn read_input(&self, slave: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers(slave, 0x04, address, count).await
    }

    async fn read_registers(&self, slave: u8, fc: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        let request = frame::encode(slave, fc, &addr_count_payload(address, count));
        let reply = self.bus.transact(&request, None, Timeouts::READ_WRITE_COILS_REGISTERS).await?;
        frame::decode_standard_reply(&reply, slave, fc, ReadKind::Registers, count)
    }

    pub async fn read_coils(&self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let reply_words = self.read_bits(slave, 0x01, address, count).await?;
        Ok(reply_words)
    }

    pub async fn read_discrete_inputs(&self, slave: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        self.read_bits(slave, 0x02, address, count).await
    }

    async fn read_bits(&self, slave: u8, fc: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let request = frame::encode(slave, fc, &addr_count_payload(address, count));
        let reply = self.bus.transact(&request, None, Timeouts::READ_WRITE_COILS_REGISTERS).await?;
        let words = frame::decode_standard_reply(&reply, slave, fc, ReadKind::Coils, count)?;
        Ok(words.into_iter().map(|w| w != 0).collect())
    }

    pub async fn write_single_register(&self, slave: u8, address: u16, value: u16) -> Result<()> {
        let payload = [
            (address >> 8) as u8,
            address as u8,
            (value >> 8) as u8,
            value as u8,
        ];
        let request = frame::encode(slave, 0x06, &payload);
        let reply = self.bus.transact(&request, Some(8), Timeouts::WRITE_SINGLE).await?;
        frame::verify_write_echo(&reply, slave, 0x06, address)
    }

    pub async fn write_single_coil(&self, slave: u8, address: u16, value: bool) -> Result<()> {
        let coil_value: u16 = if value { 0xFF00 } else { 0x0000 };
        let payload = [
            (address >> 8) as u8,
            address as u8,
            (coil_value >> 8) as u8,
            coil_value as u8,
        ];
        let request = frame::encode(slave, 0x05, &payload);
        let reply = self.bus.transact(&request, Some(8), Timeouts::WRITE_SINGLE).await?;
        frame::verify_write_echo(&reply, slave, 0x05, address)
    }

    pub async fn write_multiple_registers(&self, slave: u8, address: u16, values: &[u16]) -> Result<()> {
        let count = values.len() as u16;
        let byte_count = (values.len() * 2) as u8;
        let mut payload = vec![(address >> 8) as u8, address as u8, (count >> 8) as u8, count as u8, byte_count];
        for v in values {
            payload.push((v >> 8) as u8);
            payload.push(*v as u8);
        }
        let request = frame::encode(slave, 0x10, &payload);
        let reply = self.bus.transact(&request, Some(8), Timeouts::WRITE_MULTIPLE).await?;
        frame::verify_write_echo(&reply, slave, 0x10, address)
    }

    pub async fn write_multiple_coils(&self, slave: u8, address: u16, values: &[bool]) -> Result<()> {
        let count = values.len() as u16;
        let byte_count = ((values.len() + 7) / 8) as u8;
        let mut payload = vec![(address >> 8) as u8, address as u8, (count >> 8) as u8, count as u8, byte_count];
        for chunk in values.chunks(8) {
            let mut byte = 0u8;
            for (j, bit) in chunk.iter().enumerate() {
                if *bit {
                    byte |= 1 << j;
                }
            }
            payload.push(byte);
        }
        let request = frame::encode(slave, 0x0F, &payload);
        let reply = self.bus.transact(&request, Some(8), Timeouts::WRITE_MULTIPLE).await?;
        frame::verify_write_echo(&reply, slave, 0x0F, address)
    }

    /// True unless the registry already recorded a successful `authenticate`
    /// phase for `slave` (`spec.md` §4.3: "the engine verifies ... that the
    /// battery's authenticate phase is SUCCESS").
    fn needs_authentication(&self, slave: u8) -> bool {
        !matches!(
            self.registry.get(slave).map(|r| r.authenticate.state),
            Some(PhaseState::Success)
        )
    }

    /// Reads one of the six FC41 device-info indices (0-5), returning the
    /// printable ASCII slice of the payload. Authenticates first if the
    /// registry doesn't already show a successful handshake for this
    /// battery, and retries once more via a fresh handshake if the device
    /// answers with an exception (the module likely dropped its unlocked
    /// session) — both per `spec.md` §4.3.
    pub async fn read_device_info_fc41(&self, slave: u8, info_index: u8) -> Result<String> {
        if self.needs_authentication(slave) {
            self.reauthenticate(slave).await?;
        }
        match self.read_device_info_fc41_once(slave, info_index).await {
            Ok(text) => Ok(text),
            Err(err) if matches!(err, Error::ModbusException { .. }) => {
                warn!(slave, info_index, %err, "fc41 device-info exception, re-authenticating and retrying once");
                self.reauthenticate(slave).await?;
                self.read_device_info_fc41_once(slave, info_index).await
            }
            Err(err) => Err(err),
        }
    }

    async fn read_device_info_fc41_once(&self, slave: u8, info_index: u8) -> Result<String> {
        let request = frame::encode(slave, 0x41, &[0x06, 0x03, 0x04, 0x00, info_index]);
        let reply = self.bus.transact(&request, None, Timeouts::FC41).await?;

        if reply.len() < 9 {
            return Err(Error::DecodeError { field: "fc41_device_info".into(), bytes: reply });
        }
        if reply[0] != slave {
            return Err(Error::ProtocolViolation { detail: "slave id mismatch in fc41 reply".into() });
        }
        if reply[1] == (0x41 | 0x80) {
            let code = *reply.get(2).unwrap_or(&0);
            return Err(Error::modbus_exception(code));
        }
        if reply[1] != 0x41 {
            return Err(Error::ProtocolViolation { detail: "unexpected function code in fc41 reply".into() });
        }
        if !matches!(reply[3], 0x43 | 0x1F) {
            warn!(slave, info_index, discriminator = reply[3], "fc41 device-info reply used an unrecognized discriminator byte");
        }

        let data_start = 7usize;
        let data_end = reply.len().saturating_sub(2);
        if data_end <= data_start {
            return Err(Error::DecodeError { field: "fc41_device_info_payload".into(), bytes: reply });
        }

        let ascii_text: String = reply[data_start..data_end]
            .iter()
            .filter(|&&b| (32..=126).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
            .map(|&b| b as char)
            .collect();
        Ok(ascii_text)
    }

    /// Reads one 32-byte history record via FC41. Returns `Error::EndOfHistory`
    /// when the device signals the pointer has run past the last record
    /// (all 0xFF payload).
    pub async fn read_history_record_fc41(&self, slave: u8, record_number: u16) -> Result<HistoryRecord> {
        if self.needs_authentication(slave) {
            self.reauthenticate(slave).await?;
        }
        let payload = [0x06, 0x03, 0x05, (record_number >> 8) as u8, record_number as u8];
        let request = frame::encode(slave, 0x41, &payload);
        let reply = self.bus.transact(&request, None, Timeouts::FC41).await?;

        if reply.len() < 40 {
            return Err(Error::DecodeError { field: "fc41_history".into(), bytes: reply });
        }
        if reply[0] != slave || reply[1] != 0x41 {
            return Err(Error::ProtocolViolation { detail: "unexpected header in fc41 history reply".into() });
        }

        let data = &reply[7..7 + 32];
        if data.iter().all(|&b| b == 0xFF) {
            return Err(Error::EndOfHistory);
        }

        Ok(decode_history_record(data, record_number))
    }

    /// Opens a history read session. Retried once per the source's
    /// `initialize_history_session_fc41`.
    pub async fn init_history_session(&self, slave: u8) -> Result<()> {
        let request = frame::encode(slave, 0x41, &[0x05, 0x01, 0x05]);
        for attempt in 0..2 {
            let reply = self.bus.transact(&request, None, Timeouts::FC41).await?;
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            if validate_basic_response(&reply, slave, 0x41) {
                return Ok(());
            }
            if attempt == 1 {
                return Err(Error::ProtocolViolation { detail: "failed to initialize history session".into() });
            }
        }
        unreachable!()
    }

    pub async fn reset_history_pointer(&self, slave: u8) -> Result<()> {
        let request = frame::encode(slave, 0x41, &[0x06, 0x03, 0x05, 0x00, 0x00]);
        let reply = self.bus.transact(&request, None, Timeouts::FC41).await?;
        if !validate_basic_response(&reply, slave, 0x41) {
            return Err(Error::ProtocolViolation { detail: "failed to reset history pointer".into() });
        }
        let ff_count = reply.get(7..).map(|tail| tail.iter().take_while(|&&b| b == 0xFF).count()).unwrap_or(0);
        if ff_count < 32 {
            return Err(Error::ProtocolViolation { detail: "reset response missing 32 0xFF bytes".into() });
        }
        Ok(())
    }

    pub async fn close_history_session(&self, slave: u8) -> Result<()> {
        let request = frame::encode(slave, 0x41, &[0x0C, 0x01, 0x05]);
        let reply = self.bus.transact(&request, None, Timeouts::FC41).await?;
        if !validate_basic_response(&reply, slave, 0x41) {
            return Err(Error::ProtocolViolation { detail: "failed to close history session".into() });
        }
        Ok(())
    }

    async fn reauthenticate(&self, slave: u8) -> Result<()> {
        self.registry.update_phase(slave, Phase::Authenticate, PhaseState::InProgress, "re-authenticating after fc41 exception");
        match auth::authenticate(self.bus, slave).await {
            Ok(()) => {
                self.registry.update_phase(slave, Phase::Authenticate, PhaseState::Success, "re-authenticated");
                Ok(())
            }
            Err(err) => {
                self.registry.update_phase(slave, Phase::Authenticate, PhaseState::Failed, err.to_string());
                Err(err)
            }
        }
    }
}

fn addr_count_payload(address: u16, count: u16) -> [u8; 4] {
    [(address >> 8) as u8, address as u8, (count >> 8) as u8, count as u8]
}

fn validate_basic_response(reply: &[u8], slave: u8, fc: u8) -> bool {
    reply.len() >= 3 && reply[0] == slave && reply[1] == fc
}

/// Decodes the fixed-offset 32-byte history payload. Offsets and the
/// little-endian pairing are preserved verbatim from the source's
/// `_decode_history_record`.
fn decode_history_record(data: &[u8], record_number: u16) -> HistoryRecord {
    let le16 = |lo: u8, hi: u8| (lo as u16) | ((hi as u16) << 8);
    let signed16 = |lo: u8, hi: u8| {
        let v = le16(lo, hi);
        if v > 32767 {
            v as i32 - 65536
        } else {
            v as i32
        }
    };

    HistoryRecord {
        record_number,
        pack_voltage: le16(data[8], data[9]) as f64 / 100.0,
        battery_current: signed16(data[10], data[11]) as f64 / 100.0,
        temp_low: data[16],
        temp_high: data[18],
        soc: data[20],
        discharge_ah: le16(data[24], data[25]),
        discharge_times: data[28],
        battery_voltage: le16(data[30], data[31]) as f64 / 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario — FC41 history record decode at the documented byte offsets.
    #[test]
    fn decodes_history_record_fields() {
        let mut data = [0u8; 32];
        data[8] = 0x40; // pack_voltage low byte -> 0x0040 = 64 -> 0.64V... combined with high byte below
        data[9] = 0x00;
        data[10] = 0xE8; // battery_current = -24 (0xFFE8) / 100
        data[11] = 0xFF;
        data[16] = 20;
        data[18] = 25;
        data[20] = 87;
        data[24] = 0x64;
        data[25] = 0x00;
        data[28] = 3;
        data[30] = 0x20;
        data[31] = 0x13;

        let record = decode_history_record(&data, 5);
        assert_eq!(record.record_number, 5);
        assert!((record.pack_voltage - 0.64).abs() < 1e-9);
        assert!((record.battery_current + 0.24).abs() < 1e-9);
        assert_eq!(record.temp_low, 20);
        assert_eq!(record.temp_high, 25);
        assert_eq!(record.soc, 87);
        assert_eq!(record.discharge_ah, 100);
        assert_eq!(record.discharge_times, 3);
        assert!((record.battery_voltage - 48.96).abs() < 1e-9);
    }

    #[test]
    fn all_0xff_payload_is_treated_as_end_of_history() {
        let data = [0xFFu8; 32];
        assert!(data.iter().all(|&b| b == 0xFF));
    }
}
