//! Logical TWS device composed of up to two earbud controllers.
//!
//! Test scripts talk to one `TwsDevice`; untargeted operations go to the
//! configured primary ear, per-ear accessors bypass that routing, and
//! dual-target operations run against both ears concurrently on scoped
//! threads. One ear failing while its peer succeeds surfaces as
//! [`BesRefError::PartialFailure`] so the script knows exactly which side
//! is in trouble.

use std::{fmt, sync::Arc, thread};

use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;

use crate::{
   address::BtAddress,
   audio::{AudioCapture, PcmFrame},
   board::{BesBoard, BoardInfo, ConnectionState},
   config::{BoardConfig, ControllerConfig, EarRole},
   error::{BesRefError, Result},
   protocol::{CommandLink, SharedTransport},
   transport::{DEFAULT_BAUD_RATE, DEFAULT_IO_TIMEOUT, SerialTransport, Transport},
};

/// Outcome of a teardown. Deliberately not an error: a failing teardown
/// must never mask the test failure that preceded it.
#[derive(Debug, Default)]
pub struct TeardownReport {
   pub failures: Vec<(EarRole, BesRefError)>,
}

impl TeardownReport {
   pub fn is_clean(&self) -> bool {
      self.failures.is_empty()
   }
}

impl fmt::Display for TeardownReport {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_clean() {
         return write!(f, "clean");
      }
      for (i, (role, error)) in self.failures.iter().enumerate() {
         if i > 0 {
            write!(f, "; ")?;
         }
         write!(f, "{role}: {error}")?;
      }
      Ok(())
   }
}

/// One logical earbud pair.
pub struct TwsDevice {
   name: String,
   primary: Arc<BesBoard>,
   secondary: Option<Arc<BesBoard>>,
   transports: Vec<SharedTransport>,
   stereo_session: Mutex<bool>,
}

impl TwsDevice {
   /// Opens the configured serial ports and builds the pair.
   pub fn from_config(config: &ControllerConfig) -> Result<Self> {
      Self::assemble(
         config,
         |board| {
            let transport =
               SerialTransport::open(&board.serial_port, DEFAULT_BAUD_RATE, DEFAULT_IO_TIMEOUT)?;
            Ok(Box::new(transport) as Box<dyn Transport>)
         },
         |board| AudioCapture::new(board.audio_configs.clone()),
      )
   }

   /// Construction seam: transports and audio captures are injected so
   /// the wiring can be exercised without hardware.
   pub(crate) fn assemble(
      config: &ControllerConfig,
      mut open_transport: impl FnMut(&BoardConfig) -> Result<Box<dyn Transport>>,
      mut make_audio: impl FnMut(&BoardConfig) -> AudioCapture,
   ) -> Result<Self> {
      config.validate()?;

      let open_shared = |t: Box<dyn Transport>| -> SharedTransport { Arc::new(Mutex::new(t)) };
      let left_transport = match &config.left_config {
         Some(board) => Some(open_shared(open_transport(board)?)),
         None => None,
      };
      let right_transport = match &config.right_config {
         Some(board) => Some(open_shared(open_transport(board)?)),
         None => None,
      };

      let mut build = |role: EarRole| -> Result<Option<Arc<BesBoard>>> {
         let Some(board) = config.board(role) else {
            return Ok(None);
         };
         let (own, peer) = match role {
            EarRole::Left => (&left_transport, &right_transport),
            EarRole::Right => (&right_transport, &left_transport),
         };
         let link = if board.remote_mode {
            let peer = peer.as_ref().ok_or_else(|| {
               BesRefError::Config(format!("{role} has no peer to relay through"))
            })?;
            CommandLink::via_peer(peer.clone())
         } else {
            let own = own.as_ref().ok_or_else(|| {
               BesRefError::Config(format!("{role} transport missing"))
            })?;
            CommandLink::direct(own.clone())
         };
         Ok(Some(Arc::new(BesBoard::new(
            board.clone(),
            role,
            link,
            make_audio(board),
         ))))
      };

      let left_board = build(EarRole::Left)?;
      let right_board = build(EarRole::Right)?;

      let (primary, secondary) = match config.primary_ear {
         EarRole::Left => (left_board, right_board),
         EarRole::Right => (right_board, left_board),
      };
      let primary = primary.ok_or_else(|| {
         BesRefError::Config(format!("primary ear {} has no board", config.primary_ear))
      })?;

      let transports = [left_transport, right_transport].into_iter().flatten().collect();

      info!(
         "[{}] controller up (primary {}, tws: {})",
         config.controller_name,
         config.primary_ear,
         config.is_tws()
      );
      Ok(Self {
         name: config.controller_name.clone(),
         primary,
         secondary,
         transports,
         stereo_session: Mutex::new(false),
      })
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn primary_ear(&self) -> EarRole {
      self.primary.role()
   }

   pub fn is_tws(&self) -> bool {
      self.secondary.is_some()
   }

   /// The earbud untargeted operations are routed to.
   pub fn primary(&self) -> &BesBoard {
      &self.primary
   }

   /// Direct access to one ear, bypassing primary routing.
   pub fn ear(&self, role: EarRole) -> Option<&BesBoard> {
      if self.primary.role() == role {
         Some(&self.primary)
      } else {
         self.secondary.as_deref().filter(|b| b.role() == role)
      }
   }

   pub fn left(&self) -> Option<&BesBoard> {
      self.ear(EarRole::Left)
   }

   pub fn right(&self) -> Option<&BesBoard> {
      self.ear(EarRole::Right)
   }

   fn boards(&self) -> Vec<&BesBoard> {
      let mut boards = vec![self.primary.as_ref()];
      if let Some(secondary) = self.secondary.as_deref() {
         boards.push(secondary);
      }
      boards
   }

   /// Runs `op` on both ears concurrently (or just the primary for a
   /// single-earbud device) and folds the outcome into one result.
   fn dual<F>(&self, op: F) -> Result<()>
   where
      F: Fn(&BesBoard) -> Result<()> + Sync,
   {
      let Some(secondary) = self.secondary.as_deref() else {
         return op(&self.primary);
      };

      let (primary_result, secondary_result) = thread::scope(|scope| {
         let handle = scope.spawn(|| op(secondary));
         let primary_result = op(&self.primary);
         let secondary_result = handle.join().unwrap_or(Err(BesRefError::WorkerPanicked));
         (primary_result, secondary_result)
      });

      match (primary_result, secondary_result) {
         (Ok(()), Ok(())) => Ok(()),
         (Err(primary_err), Err(secondary_err)) => {
            warn!(
               "[{}] both earbuds failed: {}: {primary_err}; {}: {secondary_err}",
               self.name,
               self.primary.role(),
               secondary.role()
            );
            Err(primary_err)
         }
         (Ok(()), Err(e)) => Err(BesRefError::PartialFailure {
            ear: secondary.role(),
            source: Box::new(e),
         }),
         (Err(e), Ok(())) => Err(BesRefError::PartialFailure {
            ear: self.primary.role(),
            source: Box::new(e),
         }),
      }
   }

   // --- primary-routed operations ----------------------------------------

   pub fn pair(&self) -> Result<()> {
      self.primary.pair()
   }

   pub fn connect(&self, address: BtAddress) -> Result<()> {
      self.primary.connect(address)
   }

   pub fn disconnect(&self) -> Result<()> {
      self.primary.disconnect()
   }

   pub fn query_state(&self) -> Result<ConnectionState> {
      self.primary.query_state()
   }

   pub fn bluetooth_address(&self) -> BtAddress {
      self.primary.bluetooth_address()
   }

   pub fn device_info(&self) -> Result<BoardInfo> {
      self.primary.device_info()
   }

   pub fn battery_level(&self) -> Result<u8> {
      self.primary.battery_level()
   }

   pub fn set_battery_level(&self, left: u8, right: u8) -> Result<()> {
      self.primary.set_battery_level(left, right)
   }

   pub fn volume(&self) -> Result<u8> {
      self.primary.volume()
   }

   pub fn set_volume(&self, level: u8) -> Result<()> {
      self.primary.set_volume(level)
   }

   pub fn volume_up(&self, steps: u32) -> Result<()> {
      self.primary.volume_up(steps)
   }

   pub fn volume_down(&self, steps: u32) -> Result<()> {
      self.primary.volume_down(steps)
   }

   pub fn media_play(&self) -> Result<()> {
      self.primary.media_play()
   }

   pub fn media_pause(&self) -> Result<()> {
      self.primary.media_pause()
   }

   pub fn media_next(&self) -> Result<()> {
      self.primary.media_next()
   }

   pub fn media_prev(&self) -> Result<()> {
      self.primary.media_prev()
   }

   pub fn call_accept(&self) -> Result<()> {
      self.primary.call_accept()
   }

   pub fn call_decline(&self) -> Result<()> {
      self.primary.call_decline()
   }

   pub fn call_hold(&self) -> Result<()> {
      self.primary.call_hold()
   }

   pub fn call_redial(&self) -> Result<()> {
      self.primary.call_redial()
   }

   pub fn set_name(&self, name: &str) -> Result<()> {
      self.primary.set_name(name)
   }

   pub fn paired_devices(&self) -> Result<Vec<BtAddress>> {
      self.primary.paired_devices()
   }

   pub fn clear_paired_devices(&self) -> Result<()> {
      self.primary.clear_paired_devices()
   }

   // --- dual-target operations -------------------------------------------

   pub fn pair_both(&self) -> Result<()> {
      self.dual(BesBoard::pair)
   }

   pub fn connect_both(&self, address: BtAddress) -> Result<()> {
      self.dual(|board| board.connect(address))
   }

   pub fn disconnect_both(&self) -> Result<()> {
      self.dual(BesBoard::disconnect)
   }

   pub fn reboot_both(&self) -> Result<()> {
      self.dual(BesBoard::reboot)
   }

   pub fn factory_reset_both(&self) -> Result<()> {
      self.dual(BesBoard::factory_reset)
   }

   pub fn set_in_box_both(&self, in_box: bool) -> Result<()> {
      self.dual(|board| board.set_in_box(in_box))
   }

   pub fn set_on_head_both(&self, on_head: bool) -> Result<()> {
      self.dual(|board| board.set_on_head(on_head))
   }

   /// Reprograms both ears' addresses: the primary takes `address`, the
   /// secondary the same address with its last octet decremented.
   pub fn set_address(&self, address: BtAddress) -> Result<()> {
      if let Some(secondary) = self.secondary.as_deref() {
         let peer_address = address.predecessor().ok_or_else(|| {
            BesRefError::InvalidArgument(format!(
               "no secondary address can be derived from {address}"
            ))
         })?;
         self.primary.set_address(address)?;
         secondary.set_address(peer_address)?;
      } else {
         self.primary.set_address(address)?;
      }
      Ok(())
   }

   // --- audio -------------------------------------------------------------

   /// Starts audio capture, on both ears for a stereo session or just the
   /// primary otherwise.
   pub fn start_audio(&self, stereo: bool) -> Result<()> {
      let stereo = stereo && self.is_tws();
      *self.stereo_session.lock() = stereo;
      if stereo {
         self.dual(BesBoard::start_audio)
      } else {
         self.primary.start_audio()
      }
   }

   /// Stops capture and returns the frames per ear. Both ears are always
   /// attempted, so one failing stop cannot leave the other capturing.
   pub fn stop_audio(&self) -> Result<Vec<(EarRole, Vec<PcmFrame>)>> {
      let stereo = std::mem::replace(&mut *self.stereo_session.lock(), false);

      let mut out = Vec::new();
      let mut failed: Option<(EarRole, BesRefError)> = None;
      let mut stop = |board: &BesBoard| match board.stop_audio() {
         Ok(frames) => out.push((board.role(), frames)),
         Err(e) => {
            if let Some((prev_role, prev_err)) = &failed {
               warn!("[{}] {prev_role} stop also failed: {prev_err}", self.name);
            }
            failed = Some((board.role(), e));
         }
      };

      stop(&self.primary);
      if stereo && let Some(secondary) = self.secondary.as_deref() {
         stop(secondary);
      }

      match failed {
         None => Ok(out),
         Some((ear, source)) if !out.is_empty() => Err(BesRefError::PartialFailure {
            ear,
            source: Box::new(source),
         }),
         Some((_, source)) => Err(source),
      }
   }

   // --- lifecycle ----------------------------------------------------------

   /// Best-effort shutdown: disconnects and stops audio on every ear,
   /// then closes the serial links. Failures are collected, never thrown,
   /// and a second teardown on an already-closed device reports clean.
   pub fn teardown(&self) -> TeardownReport {
      info!("[{}] tearing down", self.name);
      let mut report = TeardownReport::default();

      thread::scope(|scope| {
         let handles: Vec<_> = self
            .boards()
            .into_iter()
            .map(|board| {
               let role = board.role();
               (role, scope.spawn(move || teardown_board(board)))
            })
            .collect();

         for (role, handle) in handles {
            match handle.join() {
               Ok(errors) => {
                  for error in errors {
                     report.failures.push((role, error));
                  }
               }
               Err(_) => report.failures.push((role, BesRefError::WorkerPanicked)),
            }
         }
      });

      for transport in &self.transports {
         transport.lock().close();
      }

      if report.is_clean() {
         info!("[{}] teardown clean", self.name);
      } else {
         warn!("[{}] teardown finished with failures: {report}", self.name);
      }
      report
   }

   /// Debug summary of the whole controller.
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "name": self.name,
         "primary_ear": self.primary.role().to_string(),
         "bluetooth_address": self.bluetooth_address().to_string(),
         "boards": self.boards().iter().map(|b| b.to_json()).collect::<Vec<_>>(),
      })
   }
}

/// A closed link means the device was already torn down; that is not a
/// failure worth reporting.
fn teardown_board(board: &BesBoard) -> Vec<BesRefError> {
   let mut errors = Vec::new();
   match board.disconnect() {
      Ok(()) | Err(BesRefError::TransportClosed) => {}
      Err(e) => errors.push(e),
   }
   match board.stop_audio() {
      Ok(_) | Err(BesRefError::TransportClosed) => {}
      Err(e) => errors.push(e),
   }
   errors
}
