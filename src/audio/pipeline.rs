//! Capture pipeline: raw samples in, transmission-ready frames out
//!
//! Runs the sample source on a dedicated thread. Each captured chunk is
//! processed in two steps: the loudness metric is computed from the raw
//! samples, then the outgoing frame is produced with the current volume and
//! mute settings applied. Frames land in a lock-free ring buffer drained by
//! the orchestrator's send pump.

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::watch;

use crate::audio::buffer::{AudioFrame, SharedRingBuffer};
use crate::audio::source::SampleSource;
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Exponential smoothing weight kept from the previous published loudness.
const LOUDNESS_OLD_WEIGHT: f32 = 0.7;
/// Weight of the newest RMS sample.
const LOUDNESS_NEW_WEIGHT: f32 = 0.3;

/// Maximum user volume multiplier.
const MAX_VOLUME: f32 = 2.0;

pub struct AudioCapturePipeline {
    cfg: AudioConfig,
    output: SharedRingBuffer,
    running: Arc<AtomicBool>,
    /// Volume multiplier stored as f32 bits.
    volume_bits: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
    loudness_tx: Arc<watch::Sender<f32>>,
    loudness_rx: watch::Receiver<f32>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    error_rx: Mutex<Option<Receiver<AudioError>>>,
}

impl AudioCapturePipeline {
    pub fn new(cfg: AudioConfig, output: SharedRingBuffer) -> Self {
        let (loudness_tx, loudness_rx) = watch::channel(0.0);
        Self {
            cfg,
            output,
            running: Arc::new(AtomicBool::new(false)),
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
            loudness_tx: Arc::new(loudness_tx),
            loudness_rx,
            thread_handle: Mutex::new(None),
            error_rx: Mutex::new(None),
        }
    }

    /// Set the volume multiplier, clamped to `[0.0, 2.0]`.
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, MAX_VOLUME);
        self.volume_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    /// Toggle mute, independent of the volume setting.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Smoothed loudness metric in `[0, 1]`, for level visualization.
    pub fn loudness_rx(&self) -> watch::Receiver<f32> {
        self.loudness_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start capturing from `source`. Checks access before acquisition is
    /// attempted; the capture loop never starts if either step fails.
    /// No-op when already running.
    pub fn start(&self, mut source: Box<dyn SampleSource>) -> Result<(), AudioError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = source.check_access() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if let Err(e) = source.open() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        *self.error_rx.lock() = Some(error_rx);

        let running = self.running.clone();
        let volume_bits = self.volume_bits.clone();
        let muted = self.muted.clone();
        let loudness_tx = self.loudness_tx.clone();
        let output = self.output.clone();
        let chunk_samples = self.cfg.chunk_samples();

        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let start_time = Instant::now();
                let mut chunk = vec![0i16; chunk_samples];
                let mut prev_loudness = 0.0f32;

                while running.load(Ordering::Relaxed) {
                    let n = match source.read(&mut chunk) {
                        Ok(0) => continue,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::error!("capture read failed: {}", e);
                            let _ = error_tx.try_send(e);
                            break;
                        }
                    };
                    let samples = &chunk[..n];
                    let is_muted = muted.load(Ordering::Relaxed);

                    // (a) loudness, from the raw input samples
                    if is_muted {
                        prev_loudness = 0.0;
                        let _ = loudness_tx.send(0.0);
                    } else {
                        prev_loudness = smooth_loudness(prev_loudness, rms_level(samples));
                        let _ = loudness_tx.send(prev_loudness);
                    }

                    // (b) the outgoing frame
                    let volume = f32::from_bits(volume_bits.load(Ordering::Relaxed));
                    let data = if is_muted {
                        silence(samples.len())
                    } else {
                        scale_samples(samples, volume)
                    };

                    let timestamp = start_time.elapsed().as_micros() as u64;
                    output.push(AudioFrame::new(data, timestamp));
                }

                running.store(false, Ordering::SeqCst);
                source.close();
                let _ = loudness_tx.send(0.0);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamFailed(e.to_string())
            })?;

        *self.thread_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop capturing and release the device. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Last capture error, if the loop died on one.
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx
            .lock()
            .as_ref()
            .and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Root-mean-square of the samples, normalized to `[0, 1]`.
fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / samples.len() as f64).sqrt() / 32768.0) as f32
}

fn smooth_loudness(prev: f32, rms: f32) -> f32 {
    LOUDNESS_OLD_WEIGHT * prev + LOUDNESS_NEW_WEIGHT * rms
}

/// Apply the volume multiplier and repack little-endian. At volume 1.0 the
/// output bytes equal the input bytes exactly.
fn scale_samples(samples: &[i16], volume: f32) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &s in samples {
        let scaled = (s as f32 * volume).clamp(-32768.0, 32767.0) as i16;
        out.put_i16_le(scaled);
    }
    out.freeze()
}

fn silence(sample_count: usize) -> Bytes {
    Bytes::from(vec![0u8; sample_count * 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_buffer;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct MockSource {
        chunks: VecDeque<Vec<i16>>,
        access_err: Option<AudioError>,
        open_err: Option<AudioError>,
        closed: Arc<AtomicBool>,
    }

    impl MockSource {
        fn with_chunks(chunks: Vec<Vec<i16>>) -> Self {
            Self {
                chunks: chunks.into(),
                access_err: None,
                open_err: None,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl SampleSource for MockSource {
        fn check_access(&self) -> Result<(), AudioError> {
            match &self.access_err {
                Some(AudioError::PermissionDenied(m)) => {
                    Err(AudioError::PermissionDenied(m.clone()))
                }
                Some(AudioError::DeviceUnavailable(m)) => {
                    Err(AudioError::DeviceUnavailable(m.clone()))
                }
                Some(_) | None => Ok(()),
            }
        }

        fn open(&mut self) -> Result<(), AudioError> {
            match self.open_err.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(0)
                }
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for_frame(buffer: &SharedRingBuffer) -> AudioFrame {
        for _ in 0..200 {
            if let Some(frame) = buffer.try_pop() {
                return frame;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no frame captured within deadline");
    }

    #[test]
    fn volume_one_is_byte_identical() {
        let samples = [0i16, 1, -1, 12345, -12345, i16::MAX, i16::MIN];
        let out = scale_samples(&samples, 1.0);
        let mut expected = BytesMut::new();
        for &s in &samples {
            expected.put_i16_le(s);
        }
        assert_eq!(out, expected.freeze());
    }

    #[test]
    fn volume_zero_silences() {
        let samples = [500i16, -500, i16::MAX];
        let out = scale_samples(&samples, 0.0);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(out.len(), samples.len() * 2);
    }

    #[test]
    fn boosted_volume_clamps_to_i16_range() {
        let samples = [30000i16, -30000, i16::MAX, i16::MIN];
        let out = scale_samples(&samples, 2.0);
        let decoded: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded, vec![32767, -32768, 32767, -32768]);
    }

    #[test]
    fn rms_bounds() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0, 0, 0]), 0.0);
        let full = rms_level(&[i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
        assert!(full > 0.99 && full <= 1.0);
    }

    #[test]
    fn smoothing_weights() {
        let first = smooth_loudness(0.0, 1.0);
        assert!((first - 0.3).abs() < 1e-6);
        let second = smooth_loudness(first, 1.0);
        assert!((second - (0.7 * 0.3 + 0.3)).abs() < 1e-6);
    }

    #[test]
    fn set_volume_clamps() {
        let pipeline =
            AudioCapturePipeline::new(AudioConfig::default(), create_shared_buffer(8));
        pipeline.set_volume(5.0);
        assert_eq!(pipeline.volume(), 2.0);
        pipeline.set_volume(-1.0);
        assert_eq!(pipeline.volume(), 0.0);
        pipeline.set_volume(1.5);
        assert_eq!(pipeline.volume(), 1.5);
    }

    #[test]
    fn permission_denied_never_starts_loop() {
        let pipeline =
            AudioCapturePipeline::new(AudioConfig::default(), create_shared_buffer(8));
        let mut source = MockSource::with_chunks(vec![vec![1; 480]]);
        source.access_err = Some(AudioError::PermissionDenied("denied".into()));
        let err = pipeline.start(Box::new(source)).unwrap_err();
        assert!(matches!(err, AudioError::PermissionDenied(_)));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn device_unavailable_surfaces_from_open() {
        let pipeline =
            AudioCapturePipeline::new(AudioConfig::default(), create_shared_buffer(8));
        let mut source = MockSource::with_chunks(vec![]);
        source.open_err = Some(AudioError::DeviceUnavailable("busy".into()));
        let err = pipeline.start(Box::new(source)).unwrap_err();
        assert!(matches!(err, AudioError::DeviceUnavailable(_)));
        assert!(!pipeline.is_running());
    }

    #[test]
    fn captured_frames_flow_to_buffer() {
        let buffer = create_shared_buffer(8);
        let pipeline = AudioCapturePipeline::new(AudioConfig::default(), buffer.clone());
        let source = MockSource::with_chunks(vec![vec![1000i16; 480]]);
        pipeline.start(Box::new(source)).unwrap();

        let frame = wait_for_frame(&buffer);
        assert_eq!(frame.payload().len(), 960);
        assert_eq!(frame.sample_count(), 480);

        let loudness = *pipeline.loudness_rx().borrow();
        assert!(loudness > 0.0);

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert_eq!(*pipeline.loudness_rx().borrow(), 0.0);
    }

    #[test]
    fn mute_zeroes_frames_and_loudness_immediately() {
        let buffer = create_shared_buffer(8);
        let pipeline = AudioCapturePipeline::new(AudioConfig::default(), buffer.clone());
        pipeline.set_muted(true);
        let source = MockSource::with_chunks(vec![vec![i16::MAX; 480]]);
        pipeline.start(Box::new(source)).unwrap();

        let frame = wait_for_frame(&buffer);
        assert_eq!(frame.payload().len(), 960);
        assert!(frame.payload().iter().all(|&b| b == 0));
        // No smoothing lag: loudness is forced straight to zero
        assert_eq!(*pipeline.loudness_rx().borrow(), 0.0);

        pipeline.stop();
    }

    #[test]
    fn stop_closes_source() {
        let buffer = create_shared_buffer(8);
        let pipeline = AudioCapturePipeline::new(AudioConfig::default(), buffer);
        let source = MockSource::with_chunks(vec![]);
        let closed = source.closed.clone();
        pipeline.start(Box::new(source)).unwrap();
        pipeline.stop();
        assert!(closed.load(Ordering::SeqCst));
    }
}
