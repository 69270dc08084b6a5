//! Shared test doubles: a scripted transport and fake audio backends.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{
   audio::{CaptureBackend, CaptureHandle, FrameSink},
   config::{AudioConfig, BoardConfig},
   error::{BesRefError, Result},
   protocol::SharedTransport,
   transport::Transport,
};

/// Routes `log` output from the code under test into captured test
/// output. Safe to call from every test; only the first call wins.
pub fn init_logging() {
   let _ = env_logger::builder().is_test(true).try_init();
}

/// Board config literal for tests.
pub fn test_board_config(port: &str, address: &str) -> BoardConfig {
   BoardConfig {
      serial_port: port.to_string(),
      bluetooth_address: address.parse().unwrap(),
      remote_mode: false,
      audio_configs: None,
   }
}

enum Reply {
   Line(String),
   Timeout,
}

/// Script for a fake board: queued replies plus a capture of every frame
/// the code under test sends. Handles are shared, so the script stays
/// inspectable after its transport moved into a link.
#[derive(Clone, Default)]
pub struct Script {
   sent: Arc<Mutex<Vec<String>>>,
   replies: Arc<Mutex<VecDeque<Reply>>>,
}

impl Script {
   /// Queues a `+OK` reply with the given message.
   pub fn reply_ok(&self, message: &str) {
      let line = if message.is_empty() {
         "+OK".to_string()
      } else {
         format!("+OK {message}")
      };
      self.replies.lock().push_back(Reply::Line(line));
   }

   /// Queues a raw reply line, e.g. `-ERR 3 not supported`.
   pub fn reply_line(&self, line: &str) {
      self.replies.lock().push_back(Reply::Line(line.to_string()));
   }

   /// Queues one swallowed exchange. An exhausted queue times out too.
   pub fn reply_timeout(&self) {
      self.replies.lock().push_back(Reply::Timeout);
   }

   /// Everything sent so far, as UTF-8 frames.
   pub fn sent(&self) -> Vec<String> {
      self.sent.lock().clone()
   }

   pub fn transport(&self) -> Box<dyn Transport> {
      Box::new(ScriptedTransport {
         script: self.clone(),
         closed: false,
      })
   }

   pub fn shared(&self) -> SharedTransport {
      Arc::new(Mutex::new(self.transport()))
   }
}

struct ScriptedTransport {
   script: Script,
   closed: bool,
}

impl Transport for ScriptedTransport {
   fn send(&mut self, bytes: &[u8]) -> Result<()> {
      if self.closed {
         return Err(BesRefError::TransportClosed);
      }
      self
         .script
         .sent
         .lock()
         .push(String::from_utf8_lossy(bytes).into_owned());
      Ok(())
   }

   fn receive(&mut self, _max_bytes: usize, _timeout: Duration) -> Result<Vec<u8>> {
      if self.closed {
         return Err(BesRefError::TransportClosed);
      }
      match self.script.replies.lock().pop_front() {
         Some(Reply::Line(line)) => Ok(format!("{line}\n").into_bytes()),
         Some(Reply::Timeout) | None => Err(BesRefError::TransportTimeout),
      }
   }

   fn close(&mut self) {
      self.closed = true;
   }
}

struct NullHandle;

impl CaptureHandle for NullHandle {}

/// Backend that either opens (pushing a fixed number of samples into the
/// sink right away) or fails with a chosen error.
pub enum FakeBackend {
   Accepting { samples: usize },
   Unavailable(String),
   Unsupported,
}

impl FakeBackend {
   pub fn accepting(samples: usize) -> Self {
      Self::Accepting { samples }
   }

   pub fn unavailable(message: &str) -> Self {
      Self::Unavailable(message.to_string())
   }
}

impl CaptureBackend for FakeBackend {
   fn open(&self, _config: &AudioConfig, sink: FrameSink) -> Result<Box<dyn CaptureHandle>> {
      match self {
         Self::Accepting { samples } => {
            sink.push_samples(&vec![0i16; *samples]);
            Ok(Box::new(NullHandle))
         }
         Self::Unavailable(message) => Err(BesRefError::AudioDeviceUnavailable(message.clone())),
         Self::Unsupported => Err(BesRefError::UnsupportedPlatform),
      }
   }
}

/// Backend modeling a device with one fixed capability set; any config
/// asking for something else is refused like a real device would.
pub struct CapsBackend {
   pub sample_rate: u32,
   pub sample_format: &'static str,
   pub channels: u16,
}

impl CaptureBackend for CapsBackend {
   fn open(&self, config: &AudioConfig, _sink: FrameSink) -> Result<Box<dyn CaptureHandle>> {
      if config.sample_rate != self.sample_rate
         || config.sample_format != self.sample_format
         || config.channels != self.channels
      {
         return Err(BesRefError::AudioConfigMismatch(format!(
            "device supports {} Hz / {} / {} channel(s), requested {} Hz / {} / {}",
            self.sample_rate,
            self.sample_format,
            self.channels,
            config.sample_rate,
            config.sample_format,
            config.channels
         )));
      }
      Ok(Box::new(NullHandle))
   }
}
