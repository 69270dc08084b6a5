//! BES reference device controller.
//!
//! Drives serial-attached BES development boards and presents them to
//! test scripts as one logical pair of true-wireless earbuds: pairing,
//! connection management, audio capture, battery/volume/media simulation
//! and full lifecycle handling, with dual-board operations running
//! concurrently and a partial-failure model that always names the ear
//! that misbehaved.

pub mod address;
pub mod audio;
pub mod board;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod tws;

#[cfg(test)]
mod testutil;

pub use address::BtAddress;
pub use audio::{AudioSessionState, PcmFrame};
pub use board::{BesBoard, BoardInfo, BoxState, ConnectionState};
pub use config::{AudioConfig, BoardConfig, ControllerConfig, EarRole};
pub use error::{BesRefError, Result};
pub use registry::{create, create_from_yaml, destroy};
pub use tws::{TeardownReport, TwsDevice};
