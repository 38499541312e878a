//! Owns the serial port; serializes every byte on the bus behind one mutex
//! (`spec.md` §4.2, §5).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace, warn};

use crate::config::SerialConfig;
use crate::error::{Error, Result};

/// Per-function-code read timeout table (`spec.md` §4.2).
#[derive(Debug, Clone, Copy)]
pub struct Timeouts;

impl Timeouts {
    pub const READ_WRITE_COILS_REGISTERS: Duration = Duration::from_millis(200);
    pub const WRITE_SINGLE: Duration = Duration::from_millis(200);
    pub const WRITE_MULTIPLE: Duration = Duration::from_millis(400);
    pub const FC41: Duration = Duration::from_millis(600);
    pub const AUTH_STEP: Duration = Duration::from_millis(1000);
}

/// The initial settle delay observed after writing a request, before the
/// first read attempt (`spec.md` §4.2 step 3).
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Exclusive owner of the RS-485 serial connection. All bus traffic for the
/// whole process passes through `transact`, which holds `port` locked for
/// its entire duration — this is invariant I2 of `spec.md` §3.
pub struct Bus {
    port: Mutex<SerialStream>,
}

impl Bus {
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let builder = tokio_serial::new(&config.port, config.baudrate)
            .data_bits(config.bytesize.to_data_bits())
            .parity(config.parity.to_parity())
            .stop_bits(config.stopbits.to_stop_bits())
            .timeout(Duration::from_millis((config.timeout * 1000.0) as u64));

        let stream = builder
            .open_native_async()
            .map_err(|e| Error::transport(format!("failed to open {}: {e}", config.port)))?;

        Ok(Self { port: Mutex::new(stream) })
    }

    /// Wraps an already-open stream (used by tests with a virtual/paired
    /// serial port).
    pub fn from_stream(stream: SerialStream) -> Self {
        Self { port: Mutex::new(stream) }
    }

    /// Writes `request`, then reads up to `expected_len_hint` bytes (or until
    /// the inter-byte gap or total quiet period exceeds `read_timeout`,
    /// whichever rule applies) under the single process-wide mutex.
    ///
    /// `expected_len_hint` of `None` means "read until quiet for
    /// `read_timeout`" (`spec.md` §4.2 step 4).
    pub async fn transact(
        &self,
        request: &[u8],
        expected_len_hint: Option<usize>,
        read_timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;

        // Discard anything left over from a prior timed-out exchange before
        // writing, or a stale reply gets read as the answer to this request
        // (`spec.md` §4.2 step 1).
        port.clear(ClearBuffer::All).map_err(|e| Error::transport(format!("buffer clear failed: {e}")))?;

        trace!(tx = %hex::encode(request), "transact: write");
        port.write_all(request)
            .await
            .map_err(|e| Error::transport(format!("write failed: {e}")))?;
        port.flush().await.map_err(|e| Error::transport(format!("flush failed: {e}")))?;

        tokio::time::sleep(SETTLE_DELAY).await;

        let gap = read_timeout.mul_f32(0.25);
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let remaining_hint = expected_len_hint.map(|n| n.saturating_sub(buf.len()));
            if let Some(0) = remaining_hint {
                break;
            }

            let wait = if expected_len_hint.is_some() { gap } else { read_timeout };
            match tokio::time::timeout(wait, port.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(Error::transport(format!("read failed: {e}")));
                }
                Err(_elapsed) => break,
            }
        }

        debug!(rx = %hex::encode(&buf), "transact: read");
        if buf.is_empty() {
            warn!("transact: no bytes received within timeout");
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_delay_matches_spec() {
        assert_eq!(SETTLE_DELAY, Duration::from_millis(200));
    }

    #[test]
    fn per_function_timeouts_match_spec_table() {
        assert_eq!(Timeouts::READ_WRITE_COILS_REGISTERS, Duration::from_millis(200));
        assert_eq!(Timeouts::WRITE_MULTIPLE, Duration::from_millis(400));
        assert_eq!(Timeouts::FC41, Duration::from_millis(600));
        assert_eq!(Timeouts::AUTH_STEP, Duration::from_millis(1000));
    }
}
