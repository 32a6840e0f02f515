//! Serial channel
//!
//! The agent publishes results (encrypted credentials, snapshot-hook
//! responses) as one-line JSON messages on a named serial port, and the
//! snapshot listener reads requests from one. 115200 baud throughout.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::SerialPort;

pub const BAUD_RATE: u32 = 115_200;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends one framed message: the bytes followed by a newline.
pub fn write_serial(port: &str, msg: &[u8]) -> Result<()> {
    let mut dev = serialport::new(port, BAUD_RATE)
        .timeout(WRITE_TIMEOUT)
        .open()
        .with_context(|| format!("opening serial port {port}"))?;
    dev.write_all(msg)
        .and_then(|()| dev.write_all(b"\n"))
        .and_then(|()| dev.flush())
        .with_context(|| format!("writing to serial port {port}"))?;
    Ok(())
}

/// Opens a port for reading with the given poll timeout. The caller owns
/// the read loop; timeouts surface as `TimedOut` I/O errors.
pub fn open_port(port: &str, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    serialport::new(port, BAUD_RATE)
        .timeout(timeout)
        .open()
        .with_context(|| format!("opening serial port {port}"))
}
