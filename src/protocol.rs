//! Board command protocol.
//!
//! Commands are newline-terminated ASCII frames with a fixed prefix:
//! `reftest:<verb>[ <args>]\r\n`. The board answers with a single line,
//! `+OK [message]` on success or `-ERR <code> [message]` on failure.
//! A [`CommandLink`] carries frames either over the board's own serial
//! link or relayed through the peer earbud's link; the route is fixed
//! when the controller is built and never re-negotiated.

use std::{sync::Arc, thread, time::Duration};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
   address::BtAddress,
   error::{BesRefError, Result},
   transport::Transport,
};

/// Prefix every command frame carries on the wire.
pub const COMMAND_PREFIX: &str = "reftest:";

/// Verb inserted after the prefix when a frame is forwarded to the peer.
const RELAY_VERB: &str = "relay";

/// Upper bound on a single response line.
pub const MAX_RESPONSE_BYTES: usize = 512;

/// Bound for one command/response exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts for idempotent commands hitting transient timeouts.
const RETRY_ATTEMPTS: u32 = 3;

/// Linear backoff step between retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A transport shared between the earbud it belongs to and a peer that
/// relays through it.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// The full command set of the reference firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardCommand {
   EnablePairing,
   DisablePairing,
   Connect(BtAddress),
   Disconnect,
   SetAddress(BtAddress),
   QueryConnectionState,
   AudioStart,
   AudioStop,
   GetDeviceInfo,
   GetBatteryLevel,
   SetBatteryLevel { left: u8, right: u8 },
   GetVolume,
   SetVolume(u8),
   VolumeUp,
   VolumeDown,
   MediaPlay,
   MediaPause,
   MediaNext,
   MediaPrev,
   CallAccept,
   CallDecline,
   CallHold,
   CallRedial,
   GetBoxState,
   OpenBox,
   CloseBox,
   FetchOut,
   PutIn,
   WearUp,
   WearDown,
   Reboot,
   FactoryReset,
   SetName(String),
   ClearPairedDevices,
   GetPairedDevices,
}

impl BoardCommand {
   /// Wire verb of the command.
   pub fn verb(&self) -> &'static str {
      match self {
         Self::EnablePairing => "enable_pairing",
         Self::DisablePairing => "disable_pairing",
         Self::Connect(_) => "connect",
         Self::Disconnect => "disconnect",
         Self::SetAddress(_) => "set_address",
         Self::QueryConnectionState => "get_connection_state",
         Self::AudioStart => "audio_start",
         Self::AudioStop => "audio_stop",
         Self::GetDeviceInfo => "get_device_info",
         Self::GetBatteryLevel => "get_battery_level",
         Self::SetBatteryLevel { .. } => "set_battery_level",
         Self::GetVolume => "get_volume",
         Self::SetVolume(_) => "set_volume",
         Self::VolumeUp => "volume_plus",
         Self::VolumeDown => "volume_dec",
         Self::MediaPlay => "media_play",
         Self::MediaPause => "media_pause",
         Self::MediaNext => "media_next",
         Self::MediaPrev => "media_prev",
         Self::CallAccept => "call_accept",
         Self::CallDecline => "call_decline",
         Self::CallHold => "call_hold",
         Self::CallRedial => "call_redial",
         Self::GetBoxState => "get_box_state",
         Self::OpenBox => "open_box",
         Self::CloseBox => "close_box",
         Self::FetchOut => "fetch_out",
         Self::PutIn => "put_in",
         Self::WearUp => "wear_up",
         Self::WearDown => "wear_down",
         Self::Reboot => "reboot",
         Self::FactoryReset => "factory_reset",
         Self::SetName(_) => "set_name",
         Self::ClearPairedDevices => "clear_paired_device",
         Self::GetPairedDevices => "get_paired_device",
      }
   }

   /// Whether re-sending the command after a lost response is safe.
   /// Idempotent commands get a bounded retry on timeout; everything else
   /// is single-shot.
   pub fn is_idempotent(&self) -> bool {
      matches!(
         self,
         Self::QueryConnectionState
            | Self::GetDeviceInfo
            | Self::GetBatteryLevel
            | Self::GetVolume
            | Self::GetBoxState
            | Self::GetPairedDevices
            | Self::Disconnect
            | Self::DisablePairing
            | Self::AudioStop
      )
   }

   fn args(&self) -> Option<String> {
      match self {
         Self::Connect(addr) => Some(addr.compact()),
         Self::SetAddress(addr) => Some(addr.to_string()),
         Self::SetBatteryLevel { left, right } => Some(format!("{left} {right}")),
         Self::SetVolume(level) => Some(level.to_string()),
         Self::SetName(name) => Some(name.clone()),
         _ => None,
      }
   }

   /// Builds the wire frame, with the relay verb inserted when the frame
   /// travels via the peer earbud.
   pub fn encode(&self, relayed: bool) -> String {
      let mut frame = String::from(COMMAND_PREFIX);
      if relayed {
         frame.push_str(RELAY_VERB);
         frame.push(' ');
      }
      frame.push_str(self.verb());
      if let Some(args) = self.args() {
         frame.push(' ');
         frame.push_str(&args);
      }
      frame.push_str("\r\n");
      frame
   }
}

/// Parses one response line into the success message, or the error the
/// board reported.
pub(crate) fn parse_response(raw: &[u8], command: &str) -> Result<String> {
   let Ok(text) = std::str::from_utf8(raw) else {
      return Err(BesRefError::Protocol(format!(
         "non-UTF-8 response: {}",
         hex::encode(raw)
      )));
   };
   let line = text.trim();

   // The prefix must be the whole line or followed by a space; anything
   // glued onto it is not a valid frame.
   if let Some(message) = line.strip_prefix("+OK")
      && (message.is_empty() || message.starts_with(' '))
   {
      return Ok(message.trim().to_string());
   }

   if let Some(rest) = line.strip_prefix("-ERR")
      && (rest.is_empty() || rest.starts_with(' '))
   {
      let rest = rest.trim();
      let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
      let code = code
         .parse()
         .map_err(|_| BesRefError::Protocol(format!("bad error code in response: {line}")))?;
      return Err(BesRefError::CommandFailed {
         command: command.to_string(),
         code,
         message: message.trim().to_string(),
      });
   }

   Err(BesRefError::Protocol(format!("unrecognized response: {line}")))
}

/// Extracts `key=value` fields from a response message.
pub(crate) fn parse_field(message: &str, key: &str) -> Result<String> {
   message
      .split_whitespace()
      .find_map(|token| token.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
      .map(str::to_string)
      .ok_or_else(|| {
         BesRefError::Protocol(format!("missing `{key}` in board response: {message}"))
      })
}

/// How frames reach the board.
#[derive(Clone)]
enum CommandRoute {
   /// Over the board's own serial link.
   Direct(SharedTransport),
   /// Through the peer earbud's serial link.
   ViaPeer(SharedTransport),
}

/// Command channel to one board with a route fixed at construction.
#[derive(Clone)]
pub struct CommandLink {
   route: CommandRoute,
   timeout: Duration,
}

impl CommandLink {
   pub fn direct(transport: SharedTransport) -> Self {
      Self {
         route: CommandRoute::Direct(transport),
         timeout: EXCHANGE_TIMEOUT,
      }
   }

   pub fn via_peer(peer_transport: SharedTransport) -> Self {
      Self {
         route: CommandRoute::ViaPeer(peer_transport),
         timeout: EXCHANGE_TIMEOUT,
      }
   }

   pub fn is_relayed(&self) -> bool {
      matches!(self.route, CommandRoute::ViaPeer(_))
   }

   /// Sends the command and returns the board's success message.
   ///
   /// Idempotent commands that time out are retried with linear backoff;
   /// every other failure surfaces immediately.
   pub fn execute(&self, command: &BoardCommand) -> Result<String> {
      let attempts = if command.is_idempotent() { RETRY_ATTEMPTS } else { 1 };

      for attempt in 0..attempts {
         if attempt > 0 {
            thread::sleep(RETRY_BACKOFF * attempt);
            debug!("Retrying `{}` (attempt {})", command.verb(), attempt + 1);
         }
         match self.exchange(command) {
            Err(BesRefError::TransportTimeout) => {}
            other => return other,
         }
      }

      warn!("`{}` timed out after {attempts} attempt(s)", command.verb());
      Err(BesRefError::TransportTimeout)
   }

   fn exchange(&self, command: &BoardCommand) -> Result<String> {
      let (transport, relayed) = match &self.route {
         CommandRoute::Direct(t) => (t, false),
         CommandRoute::ViaPeer(t) => (t, true),
      };
      let frame = command.encode(relayed);

      let mut guard = transport.lock();
      debug!("→ {}", frame.trim_end());
      guard.send(frame.as_bytes())?;
      let raw = guard.receive(MAX_RESPONSE_BYTES, self.timeout)?;
      drop(guard);

      debug!("← {}", String::from_utf8_lossy(&raw).trim_end());
      parse_response(&raw, command.verb())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testutil::Script;

   #[test]
   fn encodes_direct_frames() {
      let addr: BtAddress = "11:22:23:33:33:66".parse().unwrap();
      assert_eq!(
         BoardCommand::Connect(addr).encode(false),
         "reftest:connect 112223333366\r\n"
      );
      assert_eq!(
         BoardCommand::SetAddress(addr).encode(false),
         "reftest:set_address 11:22:23:33:33:66\r\n"
      );
      assert_eq!(BoardCommand::Disconnect.encode(false), "reftest:disconnect\r\n");
      assert_eq!(
         BoardCommand::SetBatteryLevel { left: 80, right: 75 }.encode(false),
         "reftest:set_battery_level 80 75\r\n"
      );
      assert_eq!(
         BoardCommand::SetName("RefBoard".to_string()).encode(false),
         "reftest:set_name RefBoard\r\n"
      );
      assert_eq!(
         BoardCommand::GetPairedDevices.encode(false),
         "reftest:get_paired_device\r\n"
      );
      assert_eq!(
         BoardCommand::FactoryReset.encode(false),
         "reftest:factory_reset\r\n"
      );
   }

   #[test]
   fn encodes_relayed_frames() {
      assert_eq!(
         BoardCommand::Disconnect.encode(true),
         "reftest:relay disconnect\r\n"
      );
   }

   #[test]
   fn idempotency_table() {
      assert!(BoardCommand::QueryConnectionState.is_idempotent());
      assert!(BoardCommand::Disconnect.is_idempotent());
      assert!(BoardCommand::AudioStop.is_idempotent());
      assert!(BoardCommand::GetPairedDevices.is_idempotent());
      assert!(!BoardCommand::EnablePairing.is_idempotent());
      assert!(!BoardCommand::Connect("11:22:23:33:33:66".parse().unwrap()).is_idempotent());
      assert!(!BoardCommand::SetVolume(10).is_idempotent());
      assert!(!BoardCommand::Reboot.is_idempotent());
      assert!(!BoardCommand::FactoryReset.is_idempotent());
      assert!(!BoardCommand::SetName("RefBoard".to_string()).is_idempotent());
   }

   #[test]
   fn parses_success_and_failure_lines() {
      assert_eq!(parse_response(b"+OK\n", "disconnect").unwrap(), "");
      assert_eq!(
         parse_response(b"+OK state=CONNECTED\r\n", "get_connection_state").unwrap(),
         "state=CONNECTED"
      );

      let err = parse_response(b"-ERR 3 not supported\n", "set_volume").unwrap_err();
      match err {
         BesRefError::CommandFailed { command, code, message } => {
            assert_eq!(command, "set_volume");
            assert_eq!(code, 3);
            assert_eq!(message, "not supported");
         }
         other => panic!("unexpected error: {other}"),
      }

      assert!(matches!(
         parse_response(b"garbage\n", "disconnect"),
         Err(BesRefError::Protocol(_))
      ));
      assert!(matches!(
         parse_response(&[0xff, 0xfe], "disconnect"),
         Err(BesRefError::Protocol(_))
      ));
   }

   #[test]
   fn glued_status_prefixes_are_rejected() {
      assert!(matches!(
         parse_response(b"+OKgarbage\n", "disconnect"),
         Err(BesRefError::Protocol(_))
      ));
      assert!(matches!(
         parse_response(b"-ERRgarbage\n", "disconnect"),
         Err(BesRefError::Protocol(_))
      ));
   }

   #[test]
   fn parses_fields_from_messages() {
      let msg = "bt_addr=11:22:23:33:33:66 bt_name=RefBoard";
      assert_eq!(parse_field(msg, "bt_addr").unwrap(), "11:22:23:33:33:66");
      assert_eq!(parse_field(msg, "bt_name").unwrap(), "RefBoard");
      assert!(matches!(
         parse_field(msg, "battery"),
         Err(BesRefError::Protocol(_))
      ));
   }

   #[test]
   fn idempotent_commands_retry_on_timeout() {
      let script = Script::default();
      script.reply_timeout();
      script.reply_timeout();
      script.reply_ok("state=CONNECTED");

      let link = CommandLink::direct(script.shared());
      let message = link.execute(&BoardCommand::QueryConnectionState).unwrap();
      assert_eq!(message, "state=CONNECTED");
      assert_eq!(script.sent().len(), 3);
   }

   #[test]
   fn idempotent_retries_are_bounded() {
      let script = Script::default();
      let link = CommandLink::direct(script.shared());

      assert!(matches!(
         link.execute(&BoardCommand::QueryConnectionState),
         Err(BesRefError::TransportTimeout)
      ));
      assert_eq!(script.sent().len(), 3);
   }

   #[test]
   fn non_idempotent_commands_never_retry() {
      let script = Script::default();
      let link = CommandLink::direct(script.shared());

      let addr: BtAddress = "11:22:23:33:33:66".parse().unwrap();
      assert!(matches!(
         link.execute(&BoardCommand::Connect(addr)),
         Err(BesRefError::TransportTimeout)
      ));
      assert_eq!(script.sent().len(), 1);
   }

   #[test]
   fn relayed_links_prefix_the_relay_verb() {
      let script = Script::default();
      script.reply_ok("");

      let link = CommandLink::via_peer(script.shared());
      assert!(link.is_relayed());
      link.execute(&BoardCommand::Disconnect).unwrap();
      assert_eq!(script.sent(), vec!["reftest:relay disconnect\r\n"]);
   }
}
