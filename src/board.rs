//! Single-earbud controller.
//!
//! A [`BesBoard`] owns the connection state machine for one physical
//! board. The state only moves on confirmed board responses, never
//! optimistically: a command that fails or times out leaves the machine
//! where the board last confirmed it was, followed by a best-effort
//! re-query after failed mutations.

use std::{thread, time::Duration};

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::json;

use crate::{
   address::BtAddress,
   audio::{AudioCapture, AudioSessionState, PcmFrame},
   config::{BoardConfig, EarRole},
   error::{BesRefError, Result},
   protocol::{self, BoardCommand, CommandLink},
};

/// Delay between connection-state polls after pair/connect.
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Number of state polls before a pair/connect attempt is given up.
const STATE_POLL_ATTEMPTS: u32 = 50;

/// Connection state of one earbud, as last confirmed by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   Pairing,
   Error,
}

/// Charging-box / wear position of an earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BoxState {
   InBoxClosed,
   InBoxOpen,
   OutBox,
   OutBoxWeared,
}

impl BoxState {
   pub const fn is_in_box(self) -> bool {
      matches!(self, Self::InBoxClosed | Self::InBoxOpen)
   }

   pub const fn is_on_head(self) -> bool {
      matches!(self, Self::OutBoxWeared)
   }
}

/// Identity the board reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardInfo {
   pub bluetooth_address: BtAddress,
   pub bluetooth_name: String,
}

/// Controller for one physical BES board.
pub struct BesBoard {
   config: BoardConfig,
   role: EarRole,
   link: CommandLink,
   address: Mutex<BtAddress>,
   state: Mutex<ConnectionState>,
   audio: AudioCapture,
   poll_interval: Duration,
   poll_attempts: u32,
}

impl BesBoard {
   pub fn new(config: BoardConfig, role: EarRole, link: CommandLink, audio: AudioCapture) -> Self {
      let address = config.bluetooth_address;
      Self {
         config,
         role,
         link,
         address: Mutex::new(address),
         state: Mutex::new(ConnectionState::Disconnected),
         audio,
         poll_interval: STATE_POLL_INTERVAL,
         poll_attempts: STATE_POLL_ATTEMPTS,
      }
   }

   #[cfg(test)]
   pub(crate) fn set_poll_params(&mut self, interval: Duration, attempts: u32) {
      self.poll_interval = interval;
      self.poll_attempts = attempts;
   }

   pub fn role(&self) -> EarRole {
      self.role
   }

   pub fn serial_port(&self) -> &str {
      &self.config.serial_port
   }

   pub fn bluetooth_address(&self) -> BtAddress {
      *self.address.lock()
   }

   pub fn is_relayed(&self) -> bool {
      self.link.is_relayed()
   }

   pub fn connection_state(&self) -> ConnectionState {
      *self.state.lock()
   }

   fn tag(&self) -> String {
      format!("{}|{}", self.role, self.bluetooth_address())
   }

   /// Puts the board into pairing mode and waits until a host connects.
   ///
   /// Callers that give up on a stuck attempt should `disconnect()` to
   /// bring the earbud back to a known state.
   pub fn pair(&self) -> Result<()> {
      let mut state = self.state.lock();
      match *state {
         ConnectionState::Pairing => return Err(BesRefError::AlreadyPairing),
         ConnectionState::Disconnected => {}
         other => {
            return Err(BesRefError::InvalidState {
               op: "pair",
               state: other,
            });
         }
      }

      info!("[{}] entering pairing mode", self.tag());
      if let Err(e) = self.link.execute(&BoardCommand::EnablePairing) {
         self.refresh_state(&mut state);
         return Err(e);
      }
      *state = ConnectionState::Pairing;

      self.wait_until_connected(&mut state)
   }

   /// Connects to a previously paired host by address.
   pub fn connect(&self, address: BtAddress) -> Result<()> {
      let mut state = self.state.lock();
      if *state != ConnectionState::Disconnected {
         return Err(BesRefError::InvalidState {
            op: "connect",
            state: *state,
         });
      }

      info!("[{}] connecting to {address}", self.tag());
      if let Err(e) = self.link.execute(&BoardCommand::Connect(address)) {
         self.refresh_state(&mut state);
         return Err(e);
      }
      *state = ConnectionState::Connecting;

      self.wait_until_connected(&mut state)
   }

   /// Drops the current connection. Safe to call in any state; the board
   /// confirms with success even when nothing was connected.
   pub fn disconnect(&self) -> Result<()> {
      let mut state = self.state.lock();
      match self.link.execute(&BoardCommand::Disconnect) {
         Ok(_) => {
            *state = ConnectionState::Disconnected;
            Ok(())
         }
         Err(e) => {
            self.refresh_state(&mut state);
            Err(e)
         }
      }
   }

   /// Leaves pairing mode without waiting for a connection.
   pub fn disable_pairing(&self) -> Result<()> {
      let mut state = self.state.lock();
      self.link.execute(&BoardCommand::DisablePairing)?;
      *state = ConnectionState::Disconnected;
      Ok(())
   }

   /// Reprograms the board's Bluetooth address. The board only applies
   /// the new address after the reboot this issues.
   pub fn set_address(&self, address: BtAddress) -> Result<()> {
      let mut state = self.state.lock();
      if *state != ConnectionState::Disconnected {
         return Err(BesRefError::InvalidState {
            op: "set_address",
            state: *state,
         });
      }

      info!("[{}] setting address to {address}", self.tag());
      self.link.execute(&BoardCommand::SetAddress(address))?;
      self.link.execute(&BoardCommand::Reboot)?;
      *self.address.lock() = address;
      *state = ConnectionState::Disconnected;
      Ok(())
   }

   /// Asks the board for its connection state and adopts the answer.
   pub fn query_state(&self) -> Result<ConnectionState> {
      let mut state = self.state.lock();
      let confirmed = self.query_board_state()?;
      *state = confirmed;
      Ok(confirmed)
   }

   fn query_board_state(&self) -> Result<ConnectionState> {
      let message = self.link.execute(&BoardCommand::QueryConnectionState)?;
      let value = protocol::parse_field(&message, "state")?;
      value
         .parse()
         .map_err(|_| BesRefError::Protocol(format!("unknown connection state `{value}`")))
   }

   /// Polls the board until it reports CONNECTED. Protocol failures move
   /// the machine to ERROR; timeouts leave it at the last confirmed state
   /// so the caller can decide what to do.
   fn wait_until_connected(&self, state: &mut MutexGuard<'_, ConnectionState>) -> Result<()> {
      for _ in 0..self.poll_attempts {
         match self.query_board_state() {
            Ok(confirmed) => {
               **state = confirmed;
               if confirmed == ConnectionState::Connected {
                  info!("[{}] connected", self.tag());
                  return Ok(());
               }
            }
            Err(e @ (BesRefError::Protocol(_) | BesRefError::CommandFailed { .. })) => {
               **state = ConnectionState::Error;
               return Err(e);
            }
            Err(e) => return Err(e),
         }
         thread::sleep(self.poll_interval);
      }

      warn!(
         "[{}] board never reported CONNECTED (stuck at {})",
         self.tag(),
         **state
      );
      Err(BesRefError::TransportTimeout)
   }

   fn refresh_state(&self, state: &mut MutexGuard<'_, ConnectionState>) {
      match self.query_board_state() {
         Ok(confirmed) => **state = confirmed,
         Err(e) => warn!("[{}] state re-query failed: {e}", self.tag()),
      }
   }

   // --- audio -----------------------------------------------------------

   /// Starts host-side capture, then tells the board to start playback
   /// routing. Capture is torn down again if the board refuses.
   pub fn start_audio(&self) -> Result<()> {
      self.audio.start()?;
      if let Err(e) = self.link.execute(&BoardCommand::AudioStart) {
         self.audio.stop();
         return Err(e);
      }
      Ok(())
   }

   /// Stops playback routing and capture, returning the captured frames.
   pub fn stop_audio(&self) -> Result<Vec<PcmFrame>> {
      let board_result = self.link.execute(&BoardCommand::AudioStop);
      let frames = self.audio.stop();
      board_result?;
      Ok(frames)
   }

   /// Drains frames captured so far without ending the session.
   pub fn take_audio_frames(&self) -> Vec<PcmFrame> {
      self.audio.take_frames()
   }

   pub fn audio_state(&self) -> AudioSessionState {
      self.audio.state()
   }

   // --- supplementary board operations ----------------------------------

   pub fn device_info(&self) -> Result<BoardInfo> {
      let message = self.link.execute(&BoardCommand::GetDeviceInfo)?;
      let address = protocol::parse_field(&message, "bt_addr")?;
      let name = protocol::parse_field(&message, "bt_name")?;
      Ok(BoardInfo {
         bluetooth_address: address.parse()?,
         bluetooth_name: name,
      })
   }

   pub fn battery_level(&self) -> Result<u8> {
      let message = self.link.execute(&BoardCommand::GetBatteryLevel)?;
      let value = protocol::parse_field(&message, "battery")?;
      let level: u8 = value
         .parse()
         .map_err(|_| BesRefError::Protocol(format!("bad battery level `{value}`")))?;
      if level > 100 {
         return Err(BesRefError::Protocol(format!(
            "battery level out of range: {level}"
         )));
      }
      Ok(level)
   }

   /// Fakes the battery levels the pair reports, 0..=100 percent each.
   pub fn set_battery_level(&self, left: u8, right: u8) -> Result<()> {
      if left > 100 || right > 100 {
         return Err(BesRefError::InvalidArgument(format!(
            "battery levels must be 0..=100, got {left}/{right}"
         )));
      }
      self.link.execute(&BoardCommand::SetBatteryLevel { left, right })?;
      Ok(())
   }

   pub fn volume(&self) -> Result<u8> {
      let message = self.link.execute(&BoardCommand::GetVolume)?;
      let value = protocol::parse_field(&message, "volume")?;
      value
         .parse()
         .map_err(|_| BesRefError::Protocol(format!("bad volume `{value}`")))
   }

   /// Sets the absolute volume, 0..=127.
   pub fn set_volume(&self, level: u8) -> Result<()> {
      if level > 127 {
         return Err(BesRefError::InvalidArgument(format!(
            "volume must be 0..=127, got {level}"
         )));
      }
      self.link.execute(&BoardCommand::SetVolume(level))?;
      Ok(())
   }

   pub fn volume_up(&self, steps: u32) -> Result<()> {
      for _ in 0..steps {
         self.link.execute(&BoardCommand::VolumeUp)?;
      }
      Ok(())
   }

   pub fn volume_down(&self, steps: u32) -> Result<()> {
      for _ in 0..steps {
         self.link.execute(&BoardCommand::VolumeDown)?;
      }
      Ok(())
   }

   pub fn media_play(&self) -> Result<()> {
      self.link.execute(&BoardCommand::MediaPlay).map(drop)
   }

   pub fn media_pause(&self) -> Result<()> {
      self.link.execute(&BoardCommand::MediaPause).map(drop)
   }

   pub fn media_next(&self) -> Result<()> {
      self.link.execute(&BoardCommand::MediaNext).map(drop)
   }

   pub fn media_prev(&self) -> Result<()> {
      self.link.execute(&BoardCommand::MediaPrev).map(drop)
   }

   pub fn call_accept(&self) -> Result<()> {
      self.link.execute(&BoardCommand::CallAccept).map(drop)
   }

   pub fn call_decline(&self) -> Result<()> {
      self.link.execute(&BoardCommand::CallDecline).map(drop)
   }

   pub fn call_hold(&self) -> Result<()> {
      self.link.execute(&BoardCommand::CallHold).map(drop)
   }

   pub fn call_redial(&self) -> Result<()> {
      self.link.execute(&BoardCommand::CallRedial).map(drop)
   }

   pub fn box_state(&self) -> Result<BoxState> {
      let message = self.link.execute(&BoardCommand::GetBoxState)?;
      let value = protocol::parse_field(&message, "box_state")?;
      value
         .parse()
         .map_err(|_| BesRefError::Protocol(format!("unknown box state `{value}`")))
   }

   /// Moves the earbud into or out of its charging box, issuing whatever
   /// intermediate transitions the current position requires.
   pub fn set_in_box(&self, in_box: bool) -> Result<()> {
      let current = self.box_state()?;
      if current.is_in_box() == in_box {
         return Ok(());
      }
      if in_box {
         if current.is_on_head() {
            self.link.execute(&BoardCommand::WearDown)?;
         }
         self.link.execute(&BoardCommand::PutIn)?;
      } else {
         if current == BoxState::InBoxClosed {
            self.link.execute(&BoardCommand::OpenBox)?;
         }
         self.link.execute(&BoardCommand::FetchOut)?;
      }
      Ok(())
   }

   /// Puts the earbud on or off the simulated head. Fetches it out of the
   /// box first when needed.
   pub fn set_on_head(&self, on_head: bool) -> Result<()> {
      let current = self.box_state()?;
      if current.is_on_head() == on_head {
         return Ok(());
      }
      if on_head {
         if current == BoxState::InBoxClosed {
            self.link.execute(&BoardCommand::OpenBox)?;
         }
         if current.is_in_box() {
            self.link.execute(&BoardCommand::FetchOut)?;
         }
         self.link.execute(&BoardCommand::WearUp)?;
      } else {
         self.link.execute(&BoardCommand::WearDown)?;
      }
      Ok(())
   }

   pub fn open_box(&self) -> Result<()> {
      self.link.execute(&BoardCommand::OpenBox).map(drop)
   }

   pub fn close_box(&self) -> Result<()> {
      self.link.execute(&BoardCommand::CloseBox).map(drop)
   }

   /// Reboots the board. The connection drops with it.
   pub fn reboot(&self) -> Result<()> {
      let mut state = self.state.lock();
      info!("[{}] rebooting", self.tag());
      self.link.execute(&BoardCommand::Reboot)?;
      *state = ConnectionState::Disconnected;
      Ok(())
   }

   /// Resets the board to factory defaults, wiping pairings and settings.
   /// The connection drops with it.
   pub fn factory_reset(&self) -> Result<()> {
      let mut state = self.state.lock();
      info!("[{}] factory reset", self.tag());
      self.link.execute(&BoardCommand::FactoryReset)?;
      *state = ConnectionState::Disconnected;
      Ok(())
   }

   /// Sets the Bluetooth name the board advertises. The wire format is
   /// space-delimited, so the name must be a single non-empty token.
   pub fn set_name(&self, name: &str) -> Result<()> {
      if name.is_empty() || name.contains(char::is_whitespace) {
         return Err(BesRefError::InvalidArgument(format!(
            "device name must be one non-empty token, got `{name}`"
         )));
      }
      self.link.execute(&BoardCommand::SetName(name.to_string())).map(drop)
   }

   /// Addresses of the hosts the board has pairing records for.
   pub fn paired_devices(&self) -> Result<Vec<BtAddress>> {
      let message = self.link.execute(&BoardCommand::GetPairedDevices)?;
      let value = protocol::parse_field(&message, "paired")?;
      if value.is_empty() {
         return Ok(Vec::new());
      }
      value.split(',').map(|addr| Ok(addr.parse()?)).collect()
   }

   /// Wipes the board's paired-device list.
   pub fn clear_paired_devices(&self) -> Result<()> {
      self.link.execute(&BoardCommand::ClearPairedDevices).map(drop)
   }

   /// Summary of the earbud for debug output.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "role": self.role.to_string(),
         "bluetooth_address": self.bluetooth_address().to_string(),
         "serial_port": self.config.serial_port,
         "connection_state": self.connection_state().to_string(),
         "audio_state": self.audio_state().to_string(),
         "relayed": self.is_relayed(),
      })
   }
}
