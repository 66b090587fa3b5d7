//! Raw sample sources
//!
//! [`SampleSource`] is the seam between the capture pipeline and the host
//! audio stack: open, read chunks, close. [`CpalSource`] backs it with a
//! cpal input stream running on its own thread, the way real devices
//! deliver buffers via callback.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::error::AudioError;

/// A raw PCM sample source.
///
/// `read` fills `buf` with as many 16-bit samples as are available and
/// returns the valid count; it may return 0 after a short internal wait so
/// callers can check their running flag between reads.
pub trait SampleSource: Send {
    /// Verify the host will let us capture at all. Called before `open`;
    /// distinguishes permission problems from missing hardware.
    fn check_access(&self) -> Result<(), AudioError>;

    /// Acquire the device and start delivering samples.
    fn open(&mut self) -> Result<(), AudioError>;

    /// Blocking chunk read. Returns the number of valid samples written.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// How long a single `read` waits for the device before yielding 0 samples.
const READ_POLL: Duration = Duration::from_millis(100);

/// cpal-backed microphone source.
///
/// The cpal stream lives on a dedicated thread (cpal streams must not cross
/// threads); captured f32 buffers are converted to i16 and handed over
/// through a bounded channel.
pub struct CpalSource {
    cfg: AudioConfig,
    device_name: Option<String>,
    running: Arc<AtomicBool>,
    sample_rx: Option<Receiver<Vec<i16>>>,
    pending: VecDeque<i16>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalSource {
    /// Source for the default input device.
    pub fn new(cfg: AudioConfig) -> Self {
        Self {
            cfg,
            device_name: None,
            running: Arc::new(AtomicBool::new(false)),
            sample_rx: None,
            pending: VecDeque::new(),
            thread_handle: None,
        }
    }

    /// Source for a named input device.
    pub fn with_device(cfg: AudioConfig, name: impl Into<String>) -> Self {
        Self {
            cfg,
            device_name: Some(name.into()),
            running: Arc::new(AtomicBool::new(false)),
            sample_rx: None,
            pending: VecDeque::new(),
            thread_handle: None,
        }
    }

    fn find_device(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        match &self.device_name {
            Some(name) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| map_cpal_error(&e.to_string()))?;
                for device in devices {
                    if device.name().as_deref().ok() == Some(name.as_str()) {
                        return Ok(device);
                    }
                }
                Err(AudioError::DeviceUnavailable(name.clone()))
            }
            None => host
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into())),
        }
    }
}

impl SampleSource for CpalSource {
    fn check_access(&self) -> Result<(), AudioError> {
        let device = self.find_device()?;
        device
            .default_input_config()
            .map_err(|e| map_cpal_error(&e.to_string()))?;
        Ok(())
    }

    fn open(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.find_device()?;
        let config = StreamConfig {
            channels: self.cfg.channels,
            sample_rate: SampleRate(self.cfg.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (sample_tx, sample_rx) = bounded::<Vec<i16>>(64);
        let (open_tx, open_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        let running_for_loop = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("cpal-source".into())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let chunk: Vec<i16> = data
                            .iter()
                            .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                            .collect();
                        // Dropped on backpressure; the consumer is behind anyway
                        let _ = sample_tx.try_send(chunk);
                    },
                    |err| {
                        tracing::warn!("input stream error: {}", err);
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = open_tx.send(Err(AudioError::StreamFailed(e.to_string())));
                            return;
                        }
                        let _ = open_tx.send(Ok(()));
                        while running_for_loop.load(Ordering::Relaxed) {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        // Stream is dropped here, releasing the device
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(map_cpal_error(&e.to_string())));
                    }
                }
            })
            .map_err(|e| AudioError::StreamFailed(e.to_string()))?;

        match open_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                self.sample_rx = Some(sample_rx);
                self.thread_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::DeviceUnavailable("device open timed out".into()))
            }
        }
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        let rx = match &self.sample_rx {
            Some(rx) => rx,
            None => return Err(AudioError::StreamFailed("source not open".into())),
        };

        if self.pending.is_empty() {
            match rx.recv_timeout(READ_POLL) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => return Ok(0),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(AudioError::StreamFailed("capture thread exited".into()));
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.sample_rx = None;
        self.pending.clear();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Host backends report denied microphone access as backend-specific
/// strings; this is the practical way to tell it apart from missing hardware.
fn map_cpal_error(msg: &str) -> AudioError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("permission")
        || lower.contains("access denied")
        || lower.contains("not permitted")
    {
        AudioError::PermissionDenied(msg.to_string())
    } else {
        AudioError::DeviceUnavailable(msg.to_string())
    }
}
