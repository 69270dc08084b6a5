//! Serial transport to a BES board.
//!
//! Each board is reached over a blocking serial link with bounded
//! timeouts. A process-wide registry hands out exclusive claims on port
//! paths so two controllers can never drive the same board at once; a
//! claim is released when the transport is closed or dropped, including
//! on partially-failed construction.

use std::{
   collections::HashSet,
   io::{Read, Write},
   sync::LazyLock,
   time::{Duration, Instant},
};

use log::debug;
use parking_lot::Mutex;

use crate::error::{BesRefError, Result};

/// Baud rate of the BES serial console.
pub const DEFAULT_BAUD_RATE: u32 = 1_152_000;

/// Default bound for a single receive.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream to one board. Implementations must tolerate `close` being
/// called more than once; any use after close fails with
/// [`BesRefError::TransportClosed`].
pub trait Transport: Send {
   fn send(&mut self, bytes: &[u8]) -> Result<()>;

   /// Reads until a `\n`-terminated frame or `max_bytes` arrive, whichever
   /// comes first. Fails with [`BesRefError::TransportTimeout`] when
   /// nothing arrives within `timeout`.
   fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>>;

   fn close(&mut self);
}

static CLAIMED_PORTS: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive process-wide claim on a serial port path, released on drop.
#[derive(Debug)]
pub struct PortClaim {
   port: String,
}

impl PortClaim {
   pub fn acquire(port: &str) -> Result<Self> {
      let mut claimed = CLAIMED_PORTS.lock();
      if !claimed.insert(port.to_string()) {
         return Err(BesRefError::Transport(format!(
            "serial port already claimed: {port}"
         )));
      }
      debug!("Claimed serial port {port}");
      Ok(Self {
         port: port.to_string(),
      })
   }
}

impl Drop for PortClaim {
   fn drop(&mut self) {
      CLAIMED_PORTS.lock().remove(&self.port);
      debug!("Released serial port {}", self.port);
   }
}

/// Blocking serial transport backed by an OS serial device.
pub struct SerialTransport {
   port: Option<Box<dyn serialport::SerialPort>>,
   claim: Option<PortClaim>,
   path: String,
}

impl SerialTransport {
   /// Claims `path` and opens it at `baud`. The claim is released again if
   /// the open fails.
   pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self> {
      let claim = PortClaim::acquire(path)?;
      let port = serialport::new(path, baud)
         .timeout(timeout)
         .open()
         .map_err(|e| BesRefError::Transport(format!("{path}: {e}")))?;
      debug!("Opened serial port {path} at {baud} baud");
      Ok(Self {
         port: Some(port),
         claim: Some(claim),
         path: path.to_string(),
      })
   }
}

impl Transport for SerialTransport {
   fn send(&mut self, bytes: &[u8]) -> Result<()> {
      let port = self.port.as_mut().ok_or(BesRefError::TransportClosed)?;
      port.write_all(bytes)?;
      port.flush()?;
      Ok(())
   }

   fn receive(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
      let port = self.port.as_mut().ok_or(BesRefError::TransportClosed)?;
      let deadline = Instant::now() + timeout;
      let mut frame = Vec::new();
      let mut buf = [0u8; 256];

      loop {
         let remaining = deadline.saturating_duration_since(Instant::now());
         if remaining.is_zero() {
            if frame.is_empty() {
               return Err(BesRefError::TransportTimeout);
            }
            // Partial frame at deadline; let the protocol layer judge it.
            return Ok(frame);
         }
         port
            .set_timeout(remaining)
            .map_err(|e| BesRefError::Transport(e.to_string()))?;

         match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
               let take = n.min(max_bytes - frame.len());
               frame.extend_from_slice(&buf[..take]);
               if frame.contains(&b'\n') || frame.len() >= max_bytes {
                  return Ok(frame);
               }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
         }
      }
   }

   fn close(&mut self) {
      if let Some(port) = self.port.take() {
         drop(port);
         debug!("Closed serial port {}", self.path);
      }
      self.claim.take();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn port_claims_are_exclusive() {
      let claim = PortClaim::acquire("/dev/ttyCLAIM0").unwrap();
      assert!(matches!(
         PortClaim::acquire("/dev/ttyCLAIM0"),
         Err(BesRefError::Transport(_))
      ));

      drop(claim);
      let _again = PortClaim::acquire("/dev/ttyCLAIM0").unwrap();
   }

   #[test]
   fn claims_are_per_path() {
      let _a = PortClaim::acquire("/dev/ttyCLAIM1").unwrap();
      let _b = PortClaim::acquire("/dev/ttyCLAIM2").unwrap();
   }

   #[test]
   fn failed_open_releases_the_claim() {
      let missing = "/dev/besref-test-no-such-port";
      assert!(SerialTransport::open(missing, DEFAULT_BAUD_RATE, DEFAULT_IO_TIMEOUT).is_err());
      // The claim taken during the failed open must be gone again.
      let _claim = PortClaim::acquire(missing).unwrap();
   }
}
