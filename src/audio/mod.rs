//! audio - Microphone capture, PCM16 framing and scheduled playback
//!
//! Uses ALSA for audio I/O on dedicated OS threads; the wire format is raw
//! PCM16 mono at 16 kHz, so no codec sits between the device and the socket.

mod alsa_device;
pub mod capture;
pub mod pcm;
pub mod playback;

pub use capture::{AlsaMicrophone, CaptureFrame, CaptureHandle, CapturePipeline, Microphone, MicrophoneError};
pub use playback::{AlsaPlayback, PlaybackClock, PlaybackEngine, PlaybackScheduler, ScheduledBuffer};
