//! Testbed configuration for BES reference devices.
//!
//! The test framework hands each controller a YAML document describing up
//! to two serial-attached boards that together present one logical earbud
//! pair. This module holds the serde data model for that document plus the
//! validation rules applied before any hardware is touched.

use serde::{Deserialize, Serialize};

use crate::{
   address::BtAddress,
   error::{BesRefError, Result},
};

/// Key the framework registers this controller class under.
pub const CONTROLLER_CONFIG_NAME: &str = "BluetoothReferenceDevice";

/// The only board family this controller knows how to drive.
pub const SUPPORTED_CONTROLLER_TYPE: &str = "BesDevice";

/// Which physical earbud a board plays.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum EarRole {
   Left,
   Right,
}

impl EarRole {
   /// The peer ear.
   pub const fn opposite(self) -> Self {
      match self {
         Self::Left => Self::Right,
         Self::Right => Self::Left,
      }
   }
}

/// Host-side PCM capture parameters for one earbud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
   /// Name of the capture device as the audio host reports it.
   pub pcm_name: String,

   #[serde(default = "default_sample_rate")]
   pub sample_rate: u32,

   #[serde(default = "default_sample_format")]
   pub sample_format: String,

   #[serde(default = "default_channels")]
   pub channels: u16,
}

const fn default_sample_rate() -> u32 {
   8000
}

fn default_sample_format() -> String {
   "S16_LE".to_string()
}

const fn default_channels() -> u16 {
   1
}

/// One physical board of the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
   /// Serial device path, e.g. `/dev/ttyUSB0`.
   pub serial_port: String,

   /// Bluetooth address the board should present.
   pub bluetooth_address: BtAddress,

   /// When set, commands for this board are relayed through the peer
   /// earbud's serial link instead of this board's own.
   #[serde(default)]
   pub remote_mode: bool,

   /// Optional host-side audio capture; boards without a capture device
   /// leave this unset.
   #[serde(default)]
   pub audio_configs: Option<AudioConfig>,
}

/// One logical TWS controller entry from the testbed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
   pub controller_name: String,
   pub controller_type: String,

   /// Which ear untargeted operations are routed to.
   #[serde(default = "default_primary_ear")]
   pub primary_ear: EarRole,

   #[serde(default)]
   pub left_config: Option<BoardConfig>,

   #[serde(default)]
   pub right_config: Option<BoardConfig>,
}

const fn default_primary_ear() -> EarRole {
   EarRole::Right
}

impl ControllerConfig {
   /// Board config for the given ear, if present.
   pub fn board(&self, role: EarRole) -> Option<&BoardConfig> {
      match role {
         EarRole::Left => self.left_config.as_ref(),
         EarRole::Right => self.right_config.as_ref(),
      }
   }

   /// True when both ears are configured.
   pub fn is_tws(&self) -> bool {
      self.left_config.is_some() && self.right_config.is_some()
   }

   /// Checks the structural rules that must hold before any serial port is
   /// opened.
   pub fn validate(&self) -> Result<()> {
      if self.controller_type != SUPPORTED_CONTROLLER_TYPE {
         return Err(self.invalid(format!(
            "unsupported controller type `{}`",
            self.controller_type
         )));
      }

      match (&self.left_config, &self.right_config) {
         (None, None) => {
            return Err(
               self.invalid("at least one of left_config/right_config is required".to_string())
            );
         }
         (Some(left), Some(right)) => {
            if left.remote_mode && right.remote_mode {
               return Err(self.invalid("left and right cannot both be in remote mode".to_string()));
            }
            if left.serial_port == right.serial_port {
               return Err(self.invalid(format!(
                  "left and right share serial port {}",
                  left.serial_port
               )));
            }
            if left.bluetooth_address == right.bluetooth_address {
               return Err(self.invalid(format!(
                  "left and right share Bluetooth address {}",
                  left.bluetooth_address
               )));
            }
         }
         (Some(only), None) | (None, Some(only)) => {
            if only.remote_mode {
               return Err(
                  self.invalid("remote_mode requires a peer earbud to relay through".to_string())
               );
            }
         }
      }

      if self.board(self.primary_ear).is_none() {
         return Err(self.invalid(format!("primary ear {} has no board config", self.primary_ear)));
      }

      Ok(())
   }

   fn invalid(&self, message: String) -> BesRefError {
      BesRefError::Config(format!("`{}`: {message}", self.controller_name))
   }
}

/// Parses and validates a testbed document: a YAML list of controller
/// entries (the value registered under [`CONTROLLER_CONFIG_NAME`]).
pub fn from_yaml(document: &str) -> Result<Vec<ControllerConfig>> {
   let configs: Vec<ControllerConfig> = serde_yaml::from_str(document)?;
   if configs.is_empty() {
      return Err(BesRefError::Config("configuration is empty".to_string()));
   }
   for config in &configs {
      config.validate()?;
   }
   Ok(configs)
}

#[cfg(test)]
mod tests {
   use super::*;

   const TWS_DOC: &str = r"
- controller_name: ref-tws-1
  controller_type: BesDevice
  primary_ear: RIGHT
  left_config:
    serial_port: /dev/ttyUSB0
    bluetooth_address: '11:22:23:33:33:65'
    audio_configs:
      pcm_name: hw_capture_left
  right_config:
    serial_port: /dev/ttyUSB1
    bluetooth_address: '11:22:23:33:33:66'
    remote_mode: true
";

   fn board(port: &str, addr: &str) -> BoardConfig {
      BoardConfig {
         serial_port: port.to_string(),
         bluetooth_address: addr.parse().unwrap(),
         remote_mode: false,
         audio_configs: None,
      }
   }

   fn tws_config() -> ControllerConfig {
      ControllerConfig {
         controller_name: "ref-tws-1".to_string(),
         controller_type: SUPPORTED_CONTROLLER_TYPE.to_string(),
         primary_ear: EarRole::Right,
         left_config: Some(board("/dev/ttyUSB0", "11:22:23:33:33:65")),
         right_config: Some(board("/dev/ttyUSB1", "11:22:23:33:33:66")),
      }
   }

   #[test]
   fn parses_full_tws_document() {
      let configs = from_yaml(TWS_DOC).unwrap();
      assert_eq!(configs.len(), 1);

      let config = &configs[0];
      assert_eq!(config.primary_ear, EarRole::Right);
      assert!(config.is_tws());

      let left = config.board(EarRole::Left).unwrap();
      assert!(!left.remote_mode);
      let audio = left.audio_configs.as_ref().unwrap();
      assert_eq!(audio.pcm_name, "hw_capture_left");
      assert_eq!(audio.sample_rate, 8000);
      assert_eq!(audio.sample_format, "S16_LE");
      assert_eq!(audio.channels, 1);

      let right = config.board(EarRole::Right).unwrap();
      assert!(right.remote_mode);
      assert_eq!(right.bluetooth_address.to_string(), "11:22:23:33:33:66");
   }

   #[test]
   fn primary_ear_defaults_to_right() {
      let doc = r"
- controller_name: ref-1
  controller_type: BesDevice
  right_config:
    serial_port: /dev/ttyUSB1
    bluetooth_address: '11:22:23:33:33:66'
";
      let configs = from_yaml(doc).unwrap();
      assert_eq!(configs[0].primary_ear, EarRole::Right);
      assert!(!configs[0].is_tws());
   }

   #[test]
   fn rejects_empty_document() {
      assert!(matches!(from_yaml("[]"), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_unknown_controller_type() {
      let mut config = tws_config();
      config.controller_type = "OtherDevice".to_string();
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_missing_boards() {
      let mut config = tws_config();
      config.left_config = None;
      config.right_config = None;
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_mutual_remote_mode() {
      let mut config = tws_config();
      config.left_config.as_mut().unwrap().remote_mode = true;
      config.right_config.as_mut().unwrap().remote_mode = true;
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_single_ear_remote_mode() {
      let mut config = tws_config();
      config.left_config = None;
      config.right_config.as_mut().unwrap().remote_mode = true;
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_absent_primary_ear() {
      let mut config = tws_config();
      config.primary_ear = EarRole::Left;
      config.left_config = None;
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_shared_serial_port() {
      let mut config = tws_config();
      config.right_config.as_mut().unwrap().serial_port = "/dev/ttyUSB0".to_string();
      assert!(matches!(config.validate(), Err(BesRefError::Config(_))));
   }

   #[test]
   fn rejects_invalid_address_in_document() {
      let doc = r"
- controller_name: ref-1
  controller_type: BesDevice
  right_config:
    serial_port: /dev/ttyUSB1
    bluetooth_address: 'not-an-address'
";
      assert!(from_yaml(doc).is_err());
   }

   #[test]
   fn ear_role_helpers() {
      assert_eq!(EarRole::Left.opposite(), EarRole::Right);
      assert_eq!(EarRole::Right.to_string(), "RIGHT");
      assert_eq!("left".parse::<EarRole>().unwrap(), EarRole::Left);
   }
}
