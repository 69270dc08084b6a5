//! Host-side PCM capture correlated with an earbud's audio output.
//!
//! A capture session opens the configured input device, chunks the
//! incoming samples into fixed-size sequence-numbered frames and buffers
//! them until they are drained. The actual device access sits behind
//! [`CaptureBackend`] so tests can run without audio hardware.

use std::{
   sync::{Arc, mpsc},
   thread,
   time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
   config::AudioConfig,
   error::{BesRefError, Result},
};

/// Samples per captured frame.
pub const FRAME_SAMPLES: usize = 1024;

/// Bound on waiting for the capture device to open.
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one earbud's capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AudioSessionState {
   Idle,
   Capturing,
   Error,
}

/// One fixed-size chunk of captured PCM with its position in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
   /// Zero-based position within the session.
   pub sequence: u64,
   pub samples: Vec<i16>,
}

/// Shared sink a backend pushes captured samples into.
#[derive(Clone, Default)]
pub struct FrameSink(Arc<Mutex<SinkInner>>);

#[derive(Default)]
struct SinkInner {
   pending: Vec<i16>,
   frames: Vec<PcmFrame>,
   next_sequence: u64,
}

impl FrameSink {
   /// Appends raw samples, cutting full frames off as they fill up.
   pub fn push_samples(&self, samples: &[i16]) {
      let mut inner = self.0.lock();
      inner.pending.extend_from_slice(samples);
      while inner.pending.len() >= FRAME_SAMPLES {
         let rest = inner.pending.split_off(FRAME_SAMPLES);
         let samples = std::mem::replace(&mut inner.pending, rest);
         let sequence = inner.next_sequence;
         inner.next_sequence += 1;
         inner.frames.push(PcmFrame { sequence, samples });
      }
   }

   fn drain(&self) -> Vec<PcmFrame> {
      std::mem::take(&mut self.0.lock().frames)
   }

   fn reset(&self) {
      *self.0.lock() = SinkInner::default();
   }
}

/// Opens capture devices and delivers samples into a [`FrameSink`].
pub trait CaptureBackend: Send + Sync {
   fn open(&self, config: &AudioConfig, sink: FrameSink) -> Result<Box<dyn CaptureHandle>>;
}

/// A live capture stream. Dropping the handle stops delivery.
pub trait CaptureHandle: Send {}

/// Production backend on top of the system audio host.
pub struct CpalBackend;

impl CaptureBackend for CpalBackend {
   fn open(&self, config: &AudioConfig, sink: FrameSink) -> Result<Box<dyn CaptureHandle>> {
      if cfg!(windows) {
         return Err(BesRefError::UnsupportedPlatform);
      }

      // cpal streams are not Send, so a dedicated thread owns the stream
      // for the whole session.
      let (ready_tx, ready_rx) = mpsc::channel();
      let (stop_tx, stop_rx) = mpsc::channel::<()>();
      let config = config.clone();
      let name = format!("audio-{}", config.pcm_name);

      let join = thread::Builder::new().name(name).spawn(move || {
         let stream = match build_input_stream(&config, sink) {
            Ok(stream) => {
               let _ = ready_tx.send(Ok(()));
               stream
            }
            Err(e) => {
               let _ = ready_tx.send(Err(e));
               return;
            }
         };
         // Hold the stream until the session is stopped or dropped.
         let _ = stop_rx.recv();
         drop(stream);
      })?;

      match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
         Ok(Ok(())) => Ok(Box::new(CpalHandle {
            stop: stop_tx,
            join: Some(join),
         })),
         Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
         }
         Err(_) => Err(BesRefError::AudioDeviceUnavailable(
            "capture thread did not come up in time".to_string(),
         )),
      }
   }
}

struct CpalHandle {
   stop: mpsc::Sender<()>,
   join: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle for CpalHandle {}

impl Drop for CpalHandle {
   fn drop(&mut self) {
      let _ = self.stop.send(());
      if let Some(join) = self.join.take() {
         let _ = join.join();
      }
   }
}

fn build_input_stream(config: &AudioConfig, sink: FrameSink) -> Result<cpal::Stream> {
   let sample_format = match config.sample_format.as_str() {
      "S16_LE" => cpal::SampleFormat::I16,
      other => {
         return Err(BesRefError::AudioConfigMismatch(format!(
            "unsupported sample format `{other}`"
         )));
      }
   };

   let host = cpal::default_host();
   let device = host
      .input_devices()
      .map_err(|e| BesRefError::AudioDeviceUnavailable(e.to_string()))?
      .find(|d| d.name().is_ok_and(|n| n == config.pcm_name))
      .ok_or_else(|| BesRefError::AudioDeviceUnavailable(config.pcm_name.clone()))?;

   let supported = device
      .supported_input_configs()
      .map_err(|e| BesRefError::AudioDeviceUnavailable(e.to_string()))?
      .any(|range| {
         range.sample_format() == sample_format
            && range.channels() == config.channels
            && range.min_sample_rate().0 <= config.sample_rate
            && config.sample_rate <= range.max_sample_rate().0
      });
   if !supported {
      return Err(BesRefError::AudioConfigMismatch(format!(
         "device `{}` does not support {} Hz / {} / {} channel(s)",
         config.pcm_name, config.sample_rate, config.sample_format, config.channels
      )));
   }

   let stream_config = cpal::StreamConfig {
      channels: config.channels,
      sample_rate: cpal::SampleRate(config.sample_rate),
      buffer_size: cpal::BufferSize::Default,
   };
   let stream = device
      .build_input_stream(
         &stream_config,
         move |data: &[i16], _: &cpal::InputCallbackInfo| sink.push_samples(data),
         |e| warn!("Audio capture stream error: {e}"),
         None,
      )
      .map_err(|e| BesRefError::AudioDeviceUnavailable(e.to_string()))?;
   stream
      .play()
      .map_err(|e| BesRefError::AudioDeviceUnavailable(e.to_string()))?;
   debug!("Capture stream running on `{}`", config.pcm_name);
   Ok(stream)
}

struct CaptureState {
   session: Option<Box<dyn CaptureHandle>>,
   sink: FrameSink,
   status: AudioSessionState,
}

/// Capture-session manager for one earbud. Boards without an audio
/// config carry one of these too; starting it just fails.
pub struct AudioCapture {
   config: Option<AudioConfig>,
   backend: Box<dyn CaptureBackend>,
   state: Mutex<CaptureState>,
}

impl AudioCapture {
   pub fn new(config: Option<AudioConfig>) -> Self {
      Self::with_backend(config, Box::new(CpalBackend))
   }

   pub fn with_backend(config: Option<AudioConfig>, backend: Box<dyn CaptureBackend>) -> Self {
      Self {
         config,
         backend,
         state: Mutex::new(CaptureState {
            session: None,
            sink: FrameSink::default(),
            status: AudioSessionState::Idle,
         }),
      }
   }

   pub fn state(&self) -> AudioSessionState {
      self.state.lock().status
   }

   pub fn is_capturing(&self) -> bool {
      self.state() == AudioSessionState::Capturing
   }

   /// Starts a fresh capture session. Frames from any previous session
   /// are discarded.
   pub fn start(&self) -> Result<()> {
      let mut state = self.state.lock();

      let Some(config) = &self.config else {
         return Err(BesRefError::Config(
            "audio capture is not configured for this board".to_string(),
         ));
      };
      if state.session.is_some() {
         return Err(BesRefError::AudioBusy);
      }

      state.sink.reset();
      match self.backend.open(config, state.sink.clone()) {
         Ok(handle) => {
            state.session = Some(handle);
            state.status = AudioSessionState::Capturing;
            Ok(())
         }
         Err(e) => {
            state.status = match e {
               BesRefError::UnsupportedPlatform => AudioSessionState::Idle,
               _ => AudioSessionState::Error,
            };
            Err(e)
         }
      }
   }

   /// Stops the session and returns everything captured so far. Safe to
   /// call when no session is running.
   pub fn stop(&self) -> Vec<PcmFrame> {
      let mut state = self.state.lock();
      if let Some(handle) = state.session.take() {
         drop(handle);
         debug!("Capture session stopped");
      }
      state.status = AudioSessionState::Idle;
      state.sink.drain()
   }

   /// Drains frames captured so far without stopping the session.
   pub fn take_frames(&self) -> Vec<PcmFrame> {
      self.state.lock().sink.drain()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testutil::{CapsBackend, FakeBackend, init_logging};

   fn config() -> AudioConfig {
      AudioConfig {
         pcm_name: "fake_capture".to_string(),
         sample_rate: 8000,
         sample_format: "S16_LE".to_string(),
         channels: 2,
      }
   }

   #[test]
   fn sink_chunks_samples_into_sequenced_frames() {
      let sink = FrameSink::default();
      sink.push_samples(&vec![1i16; 2048]);
      sink.push_samples(&vec![2i16; 512]);

      let frames = sink.drain();
      assert_eq!(frames.len(), 2);
      assert_eq!(frames[0].sequence, 0);
      assert_eq!(frames[1].sequence, 1);
      assert!(frames.iter().all(|f| f.samples.len() == FRAME_SAMPLES));

      // The 512 leftover samples stay pending until the frame fills.
      assert!(sink.drain().is_empty());
      sink.push_samples(&vec![3i16; 512]);
      let frames = sink.drain();
      assert_eq!(frames.len(), 1);
      assert_eq!(frames[0].sequence, 2);
   }

   #[test]
   fn start_without_config_fails() {
      let capture = AudioCapture::with_backend(None, Box::new(FakeBackend::accepting(0)));
      assert!(matches!(capture.start(), Err(BesRefError::Config(_))));
      assert_eq!(capture.state(), AudioSessionState::Idle);
   }

   #[test]
   fn capture_lifecycle() {
      init_logging();
      let capture =
         AudioCapture::with_backend(Some(config()), Box::new(FakeBackend::accepting(2048)));
      assert_eq!(capture.state(), AudioSessionState::Idle);

      capture.start().unwrap();
      assert!(capture.is_capturing());

      let frames = capture.stop();
      assert_eq!(frames.len(), 2);
      assert_eq!(frames[0].sequence, 0);
      assert_eq!(capture.state(), AudioSessionState::Idle);

      // Stop is safe to repeat and yields nothing new.
      assert!(capture.stop().is_empty());
   }

   #[test]
   fn second_start_is_rejected() {
      let capture =
         AudioCapture::with_backend(Some(config()), Box::new(FakeBackend::accepting(0)));
      capture.start().unwrap();
      assert!(matches!(capture.start(), Err(BesRefError::AudioBusy)));
      assert!(capture.is_capturing());
   }

   #[test]
   fn device_mismatch_surfaces_and_marks_error() {
      // Device only does 16-bit at 48 kHz mono; config asks for 8 kHz stereo.
      let backend = CapsBackend {
         sample_rate: 48_000,
         sample_format: "S16_LE",
         channels: 1,
      };
      let capture = AudioCapture::with_backend(Some(config()), Box::new(backend));

      assert!(matches!(
         capture.start(),
         Err(BesRefError::AudioConfigMismatch(_))
      ));
      assert_eq!(capture.state(), AudioSessionState::Error);
   }

   #[test]
   fn unsupported_platform_is_a_skip_not_a_fault() {
      let capture =
         AudioCapture::with_backend(Some(config()), Box::new(FakeBackend::Unsupported));

      assert!(matches!(
         capture.start(),
         Err(BesRefError::UnsupportedPlatform)
      ));
      // Unsupported capture is skipped, not a device fault.
      assert_eq!(capture.state(), AudioSessionState::Idle);
   }

   #[test]
   fn missing_device_surfaces_and_marks_error() {
      let capture = AudioCapture::with_backend(
         Some(config()),
         Box::new(FakeBackend::unavailable("no such device")),
      );
      assert!(matches!(
         capture.start(),
         Err(BesRefError::AudioDeviceUnavailable(_))
      ));
      assert_eq!(capture.state(), AudioSessionState::Error);
   }

   #[test]
   fn frames_can_be_drained_mid_session() {
      let capture =
         AudioCapture::with_backend(Some(config()), Box::new(FakeBackend::accepting(3072)));
      capture.start().unwrap();

      let frames = capture.take_frames();
      assert_eq!(frames.len(), 3);
      assert!(capture.is_capturing());
      assert!(capture.stop().is_empty());
   }
}
