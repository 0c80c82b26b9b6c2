//! Microphone capture: ALSA → float blocks → PCM16 frames.
//!
//! The ALSA read loop runs on its own OS thread. Frames are handed to the
//! event loop tagged with the capture generation that produced them, so a
//! frame still in flight after `stop()` (or after a restart) is recognised
//! and discarded there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::alsa_device;
use super::pcm::{encode_pcm16, BLOCK_SIZE, SAMPLE_RATE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MicrophoneError {
    #[error("Microphone access denied")]
    AccessDenied,
    #[error("Microphone unavailable: {0}")]
    Unavailable(String),
}

/// One encoded block from the microphone.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub generation: u64,
    pub pcm: Bytes,
}

/// Handle to a running capture source. Dropping it stops the source.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn new(running: Arc<AtomicBool>, thread: Option<JoinHandle<()>>) -> Self {
        Self { running, thread }
    }

    /// Clear the run flag and wait for the reader thread to release the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A microphone that can be opened at 16 kHz mono.
///
/// `open` resolves once the device is granted (or refused); frames are then
/// delivered on `frames` until the returned handle is stopped.
#[async_trait]
pub trait Microphone: Send {
    async fn open(
        &mut self,
        generation: u64,
        frames: mpsc::Sender<CaptureFrame>,
    ) -> Result<CaptureHandle, MicrophoneError>;
}

pub struct AlsaMicrophone {
    device: String,
}

impl AlsaMicrophone {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

#[async_trait]
impl Microphone for AlsaMicrophone {
    async fn open(
        &mut self,
        generation: u64,
        frames: mpsc::Sender<CaptureFrame>,
    ) -> Result<CaptureHandle, MicrophoneError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = {
            let running = running.clone();
            let device = self.device.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || capture_thread(&device, generation, frames, &running, ready_tx))
                .map_err(|e| MicrophoneError::Unavailable(e.to_string()))?
        };

        let mut handle = CaptureHandle::new(running, Some(thread));
        match ready_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.stop();
                Err(e)
            }
            Err(_) => {
                handle.stop();
                Err(MicrophoneError::Unavailable("capture thread exited".into()))
            }
        }
    }
}

fn capture_thread(
    device: &str,
    generation: u64,
    frames: mpsc::Sender<CaptureFrame>,
    running: &AtomicBool,
    ready: oneshot::Sender<Result<(), MicrophoneError>>,
) {
    let (pcm, params) = match alsa_device::open_capture(device, SAMPLE_RATE, 1, BLOCK_SIZE) {
        Ok(opened) => opened,
        Err(e) => {
            log::error!("Failed to open capture device '{}': {}", device, e);
            let err = if e.is_permission_denied() {
                MicrophoneError::AccessDenied
            } else {
                MicrophoneError::Unavailable(e.to_string())
            };
            let _ = ready.send(Err(err));
            return;
        }
    };

    let io = match pcm.io_f32() {
        Ok(io) => io,
        Err(e) => {
            let _ = ready.send(Err(MicrophoneError::Unavailable(e.to_string())));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        return;
    }

    let channels = params.channels.max(1) as usize;
    let mut read_buf = vec![0f32; params.period_size * channels];
    let mut accum_buf: Vec<f32> = Vec::with_capacity(BLOCK_SIZE * 2);

    log::info!(
        "Capture started: generation={}, rate={}, ch={}, period={}",
        generation,
        params.sample_rate,
        channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(n) => {
                // Downmix interleaved → mono
                for frame in read_buf[..n * channels].chunks_exact(channels) {
                    accum_buf.push(frame.iter().sum::<f32>() / channels as f32);
                }

                while accum_buf.len() >= BLOCK_SIZE {
                    let pcm16 = encode_pcm16(&accum_buf[..BLOCK_SIZE]);
                    accum_buf.drain(..BLOCK_SIZE);

                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    let frame = CaptureFrame {
                        generation,
                        pcm: Bytes::from(pcm16),
                    };
                    match frames.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!("Capture queue full, dropping block");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            log::warn!("Capture receiver dropped");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Capture stopped: generation={}", generation);
}

/// Owns the microphone for the lifetime of a capturing session.
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    frames_tx: mpsc::Sender<CaptureFrame>,
    active: Option<CaptureHandle>,
    generation: u64,
}

impl CapturePipeline {
    pub fn new(microphone: Box<dyn Microphone>, frames_tx: mpsc::Sender<CaptureFrame>) -> Self {
        Self {
            microphone,
            frames_tx,
            active: None,
            generation: 0,
        }
    }

    /// Acquire the microphone. Any previous capture is stopped first.
    pub async fn start(&mut self) -> Result<(), MicrophoneError> {
        self.stop();
        self.generation += 1;
        let handle = self
            .microphone
            .open(self.generation, self.frames_tx.clone())
            .await?;
        self.active = Some(handle);
        log::info!("Microphone acquired (generation {})", self.generation);
        Ok(())
    }

    /// Release the microphone. No-op when not started.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.stop();
            log::info!("Microphone released (generation {})", self.generation);
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Returns the frame payload if it belongs to the live capture.
    pub fn accept(&self, frame: CaptureFrame) -> Option<Bytes> {
        if self.is_capturing() && frame.generation == self.generation {
            Some(frame.pcm)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubMicrophone {
        deny: bool,
    }

    #[async_trait]
    impl Microphone for StubMicrophone {
        async fn open(
            &mut self,
            _generation: u64,
            _frames: mpsc::Sender<CaptureFrame>,
        ) -> Result<CaptureHandle, MicrophoneError> {
            if self.deny {
                return Err(MicrophoneError::AccessDenied);
            }
            Ok(CaptureHandle::new(Arc::new(AtomicBool::new(true)), None))
        }
    }

    fn pipeline(deny: bool) -> CapturePipeline {
        let (tx, _rx) = mpsc::channel(8);
        CapturePipeline::new(
            Box::new(StubMicrophone { deny }),
            tx,
        )
    }

    fn frame(generation: u64) -> CaptureFrame {
        CaptureFrame {
            generation,
            pcm: Bytes::from_static(&[0, 0]),
        }
    }

    #[test]
    fn test_stop_when_not_started_is_noop() {
        let mut p = pipeline(false);
        p.stop();
        p.stop();
        assert!(!p.is_capturing());
    }

    #[tokio::test]
    async fn test_frames_after_stop_are_discarded() {
        let mut p = pipeline(false);
        p.start().await.unwrap();
        assert!(p.accept(frame(1)).is_some());

        p.stop();
        assert!(p.accept(frame(1)).is_none());
    }

    #[tokio::test]
    async fn test_stale_generation_is_discarded_after_restart() {
        let mut p = pipeline(false);
        p.start().await.unwrap();
        p.start().await.unwrap();
        assert!(p.accept(frame(1)).is_none());
        assert!(p.accept(frame(2)).is_some());
    }

    #[tokio::test]
    async fn test_denied_leaves_pipeline_idle() {
        let mut p = pipeline(true);
        assert_eq!(p.start().await, Err(MicrophoneError::AccessDenied));
        assert!(!p.is_capturing());
    }

    #[test]
    fn test_handle_stop_clears_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let mut handle = CaptureHandle::new(running.clone(), None);
        handle.stop();
        assert!(!running.load(Ordering::SeqCst));
    }
}
