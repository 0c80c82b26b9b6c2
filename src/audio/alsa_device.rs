//! ALSA PCM device wrappers for microphone capture and speaker playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for capture. Samples are delivered as FLOAT_LE.
///
/// Errors from the open itself are returned unwrapped so callers can inspect
/// the errno (permission denial vs. missing device).
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> std::result::Result<(PCM, AlsaParams), OpenError> {
    let pcm = PCM::new(device, Direction::Capture, false).map_err(OpenError::Open)?;
    let params = configure(&pcm, Format::FloatLE, sample_rate, channels, Some(period_size), device, "Capture")
        .map_err(OpenError::Configure)?;
    Ok((pcm, params))
}

/// Open a PCM device for playback as S16_LE.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Playback, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Playback", device))?;
    let params = configure(&pcm, Format::S16LE, sample_rate, channels, period_size, device, "Playback")?;
    Ok((pcm, params))
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("open failed: {0}")]
    Open(alsa::Error),
    #[error("configure failed: {0:#}")]
    Configure(anyhow::Error),
}

impl OpenError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            OpenError::Open(e) => {
                std::io::Error::from_raw_os_error(e.errno()).kind()
                    == std::io::ErrorKind::PermissionDenied
            }
            OpenError::Configure(_) => false,
        }
    }
}

fn configure(
    pcm: &PCM,
    format: Format,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    device: &str,
    dir_name: &str,
) -> Result<AlsaParams> {
    // Configure hardware parameters
    {
        let hwp = HwParams::any(pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(format)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    if actual_rate != sample_rate {
        log::warn!(
            "ALSA {}: device {} negotiated {}Hz instead of {}Hz",
            dir_name,
            device,
            actual_rate,
            sample_rate
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok(AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
    })
}
