//! Error types for the BES reference device controller.
//!
//! This module defines all error types that can occur while driving the
//! reference boards, including transport, protocol, state-machine, audio
//! and configuration errors.

use thiserror::Error;

use crate::{board::ConnectionState, config::EarRole};

/// Main error type for the reference device controller.
#[derive(Error, Debug)]
pub enum BesRefError {
   #[error("Transport error: {0}")]
   Transport(String),

   #[error("Timed out waiting for board response")]
   TransportTimeout,

   #[error("Transport used after close")]
   TransportClosed,

   #[error("Malformed board response: {0}")]
   Protocol(String),

   #[error("Board rejected `{command}` with code {code}: {message}")]
   CommandFailed {
      command: String,
      code: u32,
      message: String,
   },

   #[error("`{op}` not allowed while {state}")]
   InvalidState {
      op: &'static str,
      state: ConnectionState,
   },

   #[error("Pairing already in progress")]
   AlreadyPairing,

   #[error("Audio capture device unavailable: {0}")]
   AudioDeviceUnavailable(String),

   #[error("Audio configuration mismatch: {0}")]
   AudioConfigMismatch(String),

   #[error("Audio capture already running")]
   AudioBusy,

   #[error("Audio capture is not supported on this platform")]
   UnsupportedPlatform,

   #[error("{ear} earbud failed while its peer succeeded: {source}")]
   PartialFailure {
      ear: EarRole,
      #[source]
      source: Box<BesRefError>,
   },

   #[error("Dual-target worker panicked")]
   WorkerPanicked,

   #[error("Invalid configuration: {0}")]
   Config(String),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("YAML parsing error: {0}")]
   Yaml(#[from] serde_yaml::Error),
}

/// Convenience type alias for Results with `BesRefError`.
pub type Result<T> = std::result::Result<T, BesRefError>;
