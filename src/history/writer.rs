//! History Writer read-side (`spec.md` §4.9 steps 2-3): sampling the
//! opportunistic additional registers and the per-cell voltage/temperature
//! arrays that ride along with a history record. Grounded on
//! `original_source/modbus_app/operations.py`'s `verify_battery_cell_data`
//! and `CELL_ARRAYS` table, which is the only place in the source that names
//! concrete addresses for this data.

use tracing::warn;

use super::{CellStatus, CellTemperature, CellVoltage, SqlValue};
use crate::config::{AdditionalRegister, RegisterWidth};
use crate::protocol::ProtocolEngine;

/// Cell voltages 1-16, confirmed address per the source's `CELL_ARRAYS`
/// table. Raw unit is millivolts; 0xFFFF marks a disconnected cell
/// (`spec.md` §3 sentinels).
const CELL_VOLTAGES_BLOCK1: (u16, u16) = (0x0022, 16);
/// Cell temperatures 1-16. 0x7FFF or 0xFC19 marks a disconnected sensor.
const CELL_TEMPS_BLOCK1: (u16, u16) = (0x0012, 16);
/// Cell voltages 17-24. Experimental per the source and `spec.md` §9 open
/// question 2 — absence is a non-fatal partial read, not an error.
const CELL_VOLTAGES_BLOCK2: (u16, u16) = (0x0310, 8);
/// Cell temperatures 17-24, same caveat as block 2 voltages.
const CELL_TEMPS_BLOCK2: (u16, u16) = (0x0300, 8);

const VOLTAGE_DISCONNECTED: u16 = 0xFFFF;
const TEMP_DISCONNECTED_A: u16 = 0x7FFF;
const TEMP_DISCONNECTED_B: u16 = 0xFC19;

/// Reads every register in `specs` and returns the ones that answered, as
/// `(field_name, value)` pairs ready for `HistorySample::additional`.
/// A register that times out or faults is skipped, not fatal to the whole
/// sample (`spec.md` §4.9 step 2 reads "sequentially", one failure doesn't
/// abort the rest).
pub async fn read_additional_registers(
    engine: &ProtocolEngine<'_>,
    slave: u8,
    specs: &[AdditionalRegister],
) -> Vec<(String, SqlValue)> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let count = match spec.width {
            RegisterWidth::Bit16 => 1,
            RegisterWidth::Bit32 => 2,
        };
        match engine.read_holding(slave, spec.address, count).await {
            Ok(values) => {
                let value = match spec.width {
                    RegisterWidth::Bit16 => values[0] as i64,
                    RegisterWidth::Bit32 => (((values[0] as u32) << 16) | values[1] as u32) as i64,
                };
                out.push((spec.field.clone(), SqlValue::Integer(value)));
            }
            Err(err) => {
                warn!(slave, field = %spec.field, address = spec.address, %err, "skipping additional register");
            }
        }
    }
    out
}

/// Reads the confirmed cell-voltage and cell-temperature blocks (1-16), and
/// opportunistically the experimental 17-24 extension blocks. Any block that
/// fails to read is simply omitted from the result (`spec.md` §9 open
/// question 2: firmware support for the extension blocks varies).
pub async fn read_cell_arrays(engine: &ProtocolEngine<'_>, slave: u8) -> (Vec<CellVoltage>, Vec<CellTemperature>) {
    let mut voltages = Vec::new();
    let mut temperatures = Vec::new();

    if let Ok(raw) = engine.read_holding(slave, CELL_VOLTAGES_BLOCK1.0, CELL_VOLTAGES_BLOCK1.1).await {
        voltages.extend(decode_cell_voltages(&raw, 1));
    }
    if let Ok(raw) = engine.read_holding(slave, CELL_TEMPS_BLOCK1.0, CELL_TEMPS_BLOCK1.1).await {
        temperatures.extend(decode_cell_temperatures(&raw, 1));
    }

    if let Ok(raw) = engine.read_holding(slave, CELL_VOLTAGES_BLOCK2.0, CELL_VOLTAGES_BLOCK2.1).await {
        voltages.extend(decode_cell_voltages(&raw, CELL_VOLTAGES_BLOCK1.1 as u16 + 1));
    }
    if let Ok(raw) = engine.read_holding(slave, CELL_TEMPS_BLOCK2.0, CELL_TEMPS_BLOCK2.1).await {
        temperatures.extend(decode_cell_temperatures(&raw, CELL_TEMPS_BLOCK1.1 as u16 + 1));
    }

    (voltages, temperatures)
}

fn decode_cell_voltages(raw: &[u16], first_cell_number: u16) -> Vec<CellVoltage> {
    raw.iter()
        .enumerate()
        .map(|(i, &v)| {
            let status = if v == VOLTAGE_DISCONNECTED { CellStatus::Disconnected } else { CellStatus::Ok };
            let voltage = (status == CellStatus::Ok).then(|| v as f64 * 0.001);
            CellVoltage { cell_number: first_cell_number + i as u16, voltage, status, raw_value: v }
        })
        .collect()
}

fn decode_cell_temperatures(raw: &[u16], first_cell_number: u16) -> Vec<CellTemperature> {
    raw.iter()
        .enumerate()
        .map(|(i, &v)| {
            let status = if v == TEMP_DISCONNECTED_A || v == TEMP_DISCONNECTED_B {
                CellStatus::Disconnected
            } else {
                CellStatus::Ok
            };
            let temperature = (status == CellStatus::Ok).then(|| v as i16 as i32);
            CellTemperature { cell_number: first_cell_number + i as u16, temperature, status, raw_value: v }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_sentinel_marks_cell_disconnected() {
        let cells = decode_cell_voltages(&[3650, 0xFFFF, 3700], 1);
        assert_eq!(cells[0].status, CellStatus::Ok);
        assert_eq!(cells[0].voltage, Some(3.65));
        assert_eq!(cells[1].status, CellStatus::Disconnected);
        assert_eq!(cells[1].voltage, None);
        assert_eq!(cells[2].cell_number, 3);
    }

    #[test]
    fn temperature_sentinels_mark_cell_disconnected() {
        let cells = decode_cell_temperatures(&[25, 0x7FFF, 0xFC19, 30], 1);
        assert_eq!(cells[0].temperature, Some(25));
        assert_eq!(cells[1].status, CellStatus::Disconnected);
        assert_eq!(cells[2].status, CellStatus::Disconnected);
        assert_eq!(cells[3].temperature, Some(30));
    }

    #[test]
    fn block2_cell_numbers_continue_from_block1() {
        let cells = decode_cell_voltages(&[1000], 17);
        assert_eq!(cells[0].cell_number, 17);
    }
}
