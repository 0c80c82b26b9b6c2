//! Gap-free playback of inbound PCM16 frames.
//!
//! - `PlaybackScheduler` decides *when* each frame starts (`PlaybackClock`).
//! - `AlsaPlayback` is the engine: a playback thread that renders a sample
//!   timeline to ALSA, writing silence wherever nothing is scheduled, so its
//!   clock advances in real time like a hardware audio context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Result;

use super::alsa_device;
use super::pcm::{decode_pcm16, duration_secs, float_to_i16, visualizer_levels, SAMPLE_RATE, VISUALIZER_BARS};

/// An output that plays sample buffers at absolute times on its own clock.
pub trait PlaybackEngine: Send {
    /// Current engine time in seconds.
    fn current_time(&self) -> f64;
    /// Play `samples` (mono, [`SAMPLE_RATE`]) starting at `start_at` seconds.
    fn schedule(&mut self, samples: Vec<f32>, start_at: f64);
}

/// Scheduler's notion of the next safe start time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackClock {
    next_play_time: f64,
}

impl PlaybackClock {
    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    /// Start time for a buffer arriving when the engine reads `now`.
    /// Falls forward to `now` on underflow, never backward.
    fn start_time(&self, now: f64) -> f64 {
        self.next_play_time.max(now)
    }

    fn advance(&mut self, start: f64, duration: f64) {
        self.next_play_time = start + duration;
    }

    fn reset(&mut self, now: f64) {
        self.next_play_time = self.next_play_time.max(now);
    }
}

/// Placement of one inbound frame plus its visualizer levels.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub duration: f64,
    pub levels: Vec<f32>,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    engine: Box<dyn PlaybackEngine>,
    clock: PlaybackClock,
    enabled: bool,
}

impl PlaybackScheduler {
    pub fn new(engine: Box<dyn PlaybackEngine>) -> Self {
        Self {
            engine,
            clock: PlaybackClock::default(),
            enabled: false,
        }
    }

    /// Begin accepting frames; the clock starts at the engine's current time.
    pub fn start(&mut self) {
        self.clock.reset(self.engine.current_time());
        self.enabled = true;
    }

    /// Stop accepting frames. Buffers already handed to the engine still play.
    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn clock(&self) -> PlaybackClock {
        self.clock
    }

    /// Decode and schedule one PCM16 frame. Returns `None` when disabled or empty.
    pub fn enqueue(&mut self, frame: &[u8]) -> Option<ScheduledBuffer> {
        if !self.enabled {
            return None;
        }
        let samples = decode_pcm16(frame);
        if samples.is_empty() {
            return None;
        }

        let levels = visualizer_levels(&samples, VISUALIZER_BARS);
        let duration = duration_secs(samples.len());
        let now = self.engine.current_time();
        let start = self.clock.start_time(now);
        if self.clock.next_play_time() < now {
            log::debug!(
                "Playback underflow: clock {:.3}s behind, restarting at {:.3}s",
                now - self.clock.next_play_time(),
                now
            );
        }

        self.engine.schedule(samples, start);
        self.clock.advance(start, duration);

        Some(ScheduledBuffer {
            start,
            duration,
            levels,
        })
    }
}

// ======================== ALSA engine ========================

struct Pending {
    start: u64,
    samples: Vec<f32>,
}

impl Pending {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Sample-indexed mix timeline rendered one period at a time.
#[derive(Default)]
pub struct Timeline {
    cursor: u64,
    pending: VecDeque<Pending>,
}

impl Timeline {
    /// Frames already rendered to the device.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn schedule(&mut self, start: u64, samples: Vec<f32>) {
        // Anything before the cursor has already been rendered.
        let (start, samples) = if start < self.cursor {
            let skip = (self.cursor - start) as usize;
            if skip >= samples.len() {
                return;
            }
            (self.cursor, samples[skip..].to_vec())
        } else {
            (start, samples)
        };
        self.pending.push_back(Pending { start, samples });
    }

    /// Mix every scheduled sample that falls in the next `out.len()` frames.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let begin = self.cursor;
        let end = begin + out.len() as u64;

        for buf in &self.pending {
            if buf.start >= end || buf.end() <= begin {
                continue;
            }
            let from = buf.start.max(begin);
            let to = buf.end().min(end);
            for f in from..to {
                out[(f - begin) as usize] += buf.samples[(f - buf.start) as usize];
            }
        }

        self.pending.retain(|b| b.end() > end);
        self.cursor = end;
    }
}

/// ALSA output driven by a [`Timeline`] on a dedicated thread.
pub struct AlsaPlayback {
    timeline: Arc<Mutex<Timeline>>,
    running: Arc<AtomicBool>,
    play_handle: Option<JoinHandle<()>>,
}

impl AlsaPlayback {
    /// Open `device` and start rendering (silence until something is scheduled).
    pub fn start(device: &str, period_size: usize) -> Result<Self> {
        let period = if period_size > 0 { Some(period_size) } else { None };
        let (pcm, params) = alsa_device::open_playback(device, SAMPLE_RATE, 1, period)?;

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let running = Arc::new(AtomicBool::new(true));

        let play_handle = {
            let timeline = timeline.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(pcm, params, &timeline, &running) {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        Ok(Self {
            timeline,
            running,
            play_handle: Some(play_handle),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.play_handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PlaybackEngine for AlsaPlayback {
    fn current_time(&self) -> f64 {
        match self.timeline.lock() {
            Ok(t) => t.cursor() as f64 / SAMPLE_RATE as f64,
            Err(poisoned) => poisoned.into_inner().cursor() as f64 / SAMPLE_RATE as f64,
        }
    }

    fn schedule(&mut self, samples: Vec<f32>, start_at: f64) {
        let start = (start_at * SAMPLE_RATE as f64).round() as u64;
        match self.timeline.lock() {
            Ok(mut t) => t.schedule(start, samples),
            Err(poisoned) => poisoned.into_inner().schedule(start, samples),
        }
    }
}

fn play_thread(
    pcm: alsa::PCM,
    params: alsa_device::AlsaParams,
    timeline: &Mutex<Timeline>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels.max(1) as usize;
    let period = params.period_size.max(1);

    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period * channels];

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while running.load(Ordering::Relaxed) {
        {
            let mut t = timeline.lock().map_err(|_| anyhow::anyhow!("timeline lock poisoned"))?;
            t.render(&mut mix);
        }
        for (i, &s) in mix.iter().enumerate() {
            let v = float_to_i16(s);
            for ch in 0..channels {
                out[i * channels + ch] = v;
            }
        }

        // Write with retry to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{encode_pcm16, BLOCK_SIZE};

    /// Engine whose clock is moved by hand.
    struct ManualEngine {
        now: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(f64, usize)>>>,
    }

    impl PlaybackEngine for ManualEngine {
        fn current_time(&self) -> f64 {
            *self.now.lock().unwrap()
        }

        fn schedule(&mut self, samples: Vec<f32>, start_at: f64) {
            self.scheduled.lock().unwrap().push((start_at, samples.len()));
        }
    }

    fn scheduler_at(now: f64) -> (PlaybackScheduler, Arc<Mutex<f64>>, Arc<Mutex<Vec<(f64, usize)>>>) {
        let now = Arc::new(Mutex::new(now));
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let engine = ManualEngine {
            now: now.clone(),
            scheduled: scheduled.clone(),
        };
        (PlaybackScheduler::new(Box::new(engine)), now, scheduled)
    }

    fn block() -> Vec<u8> {
        encode_pcm16(&vec![0.1; BLOCK_SIZE])
    }

    #[test]
    fn test_disabled_scheduler_drops_frames() {
        let (mut sched, _, scheduled) = scheduler_at(0.0);
        assert!(sched.enqueue(&block()).is_none());
        assert!(scheduled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_steady_frames_are_back_to_back() {
        let (mut sched, _, scheduled) = scheduler_at(2.0);
        sched.start();

        let mut prev_end: Option<f64> = None;
        for _ in 0..100 {
            let buf = sched.enqueue(&block()).unwrap();
            if let Some(end) = prev_end {
                assert_eq!(buf.start, end);
            } else {
                assert_eq!(buf.start, 2.0);
            }
            prev_end = Some(buf.end());
        }
        assert_eq!(scheduled.lock().unwrap().len(), 100);
        assert!((sched.clock().next_play_time() - (2.0 + 100.0 * 0.064)).abs() < 1e-9);
    }

    #[test]
    fn test_underflow_resets_to_now() {
        let (mut sched, now, _) = scheduler_at(0.0);
        sched.start();
        sched.enqueue(&block()).unwrap();

        // Stall: engine moves well past the scheduled audio.
        *now.lock().unwrap() = 5.0;
        let buf = sched.enqueue(&block()).unwrap();
        assert_eq!(buf.start, 5.0);
        assert!((sched.clock().next_play_time() - 5.064).abs() < 1e-9);
    }

    #[test]
    fn test_clock_never_moves_backward() {
        let (mut sched, now, _) = scheduler_at(1.0);
        sched.start();

        let mut last = sched.clock().next_play_time();
        for t in [1.0, 1.01, 9.0, 3.0, 9.5, 0.0, 20.0, 20.0] {
            *now.lock().unwrap() = t;
            let buf = sched.enqueue(&block()).unwrap();
            assert!(buf.start >= t);
            let next = sched.clock().next_play_time();
            assert!(next >= last);
            last = next;
        }

        // Restarting a session never rewinds past pending audio.
        *now.lock().unwrap() = 0.5;
        sched.stop();
        sched.start();
        assert!(sched.clock().next_play_time() >= last);
    }

    #[test]
    fn test_levels_are_reported() {
        let (mut sched, _, _) = scheduler_at(0.0);
        sched.start();
        let buf = sched.enqueue(&block()).unwrap();
        assert_eq!(buf.levels.len(), VISUALIZER_BARS);
    }

    #[test]
    fn test_timeline_renders_silence_when_empty() {
        let mut t = Timeline::default();
        let mut out = vec![1.0; 8];
        t.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(t.cursor(), 8);
    }

    #[test]
    fn test_timeline_places_buffers_contiguously() {
        let mut t = Timeline::default();
        t.schedule(2, vec![0.5; 4]);
        t.schedule(6, vec![0.25; 4]);

        let mut out = vec![0.0; 8];
        t.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.25, 0.25]);
        assert_eq!(t.pending_len(), 1);

        t.render(&mut out);
        assert_eq!(&out[..2], &[0.25, 0.25]);
        assert!(out[2..].iter().all(|&s| s == 0.0));
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn test_timeline_trims_late_buffers() {
        let mut t = Timeline::default();
        let mut out = vec![0.0; 4];
        t.render(&mut out);

        t.schedule(2, vec![0.5, 0.5, 0.5, 0.75]);
        t.render(&mut out);
        assert_eq!(out, vec![0.5, 0.75, 0.0, 0.0]);

        t.schedule(0, vec![1.0; 3]);
        assert_eq!(t.pending_len(), 0);
    }
}
