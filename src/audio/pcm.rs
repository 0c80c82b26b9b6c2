//! PCM16 framing shared by capture and playback.
//!
//! Wire format is fixed: little-endian 16-bit signed, mono, 16 kHz.

/// Sample rate of every frame on the wire.
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per captured block. Changing this changes the frame size on the wire.
pub const BLOCK_SIZE: usize = 1024;

/// Number of visualizer bars derived from each decoded frame.
pub const VISUALIZER_BARS: usize = 24;

const LEVEL_SCALE: f32 = 200.0;
const LEVEL_MIN: f32 = 4.0;
const LEVEL_MAX: f32 = 32.0;

/// Convert one float sample to PCM16.
///
/// Negative samples scale by 32768 and non-negative by 32767, so -1.0 and 1.0
/// land exactly on `i16::MIN` and `i16::MAX`.
pub fn float_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

pub fn i16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples into a little-endian PCM16 frame.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&float_to_i16(s).to_le_bytes());
    }
    out
}

/// Decode a little-endian PCM16 frame. A trailing odd byte is ignored.
pub fn decode_pcm16(frame: &[u8]) -> Vec<f32> {
    frame
        .chunks_exact(2)
        .map(|b| i16_to_float(i16::from_le_bytes([b[0], b[1]])))
        .collect()
}

/// Duration in seconds of `samples` mono samples at [`SAMPLE_RATE`].
pub fn duration_secs(samples: usize) -> f64 {
    samples as f64 / SAMPLE_RATE as f64
}

/// Visualizer levels: mean absolute amplitude per sub-window, scaled and
/// clamped to the display range.
pub fn visualizer_levels(samples: &[f32], bars: usize) -> Vec<f32> {
    if bars == 0 {
        return Vec::new();
    }
    let step = samples.len() / bars;
    if step == 0 {
        return vec![LEVEL_MIN; bars];
    }
    samples
        .chunks_exact(step)
        .take(bars)
        .map(|window| {
            let sum: f32 = window.iter().map(|s| s.abs()).sum();
            (sum / step as f32 * LEVEL_SCALE).clamp(LEVEL_MIN, LEVEL_MAX)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: f32 = 1.0 / 32768.0;

    #[test]
    fn test_half_scale_round_trip() {
        let back = i16_to_float(float_to_i16(0.5));
        assert!((back - 0.5).abs() <= STEP);

        let back = i16_to_float(float_to_i16(-0.5));
        assert!((back + 0.5).abs() <= STEP);
    }

    #[test]
    fn test_full_scale_saturates() {
        assert_eq!(float_to_i16(1.0), i16::MAX);
        assert_eq!(float_to_i16(-1.0), i16::MIN);
        assert_eq!(float_to_i16(3.7), i16::MAX);
        assert_eq!(float_to_i16(-12.0), i16::MIN);
        assert_eq!(float_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_encode_is_little_endian() {
        let frame = encode_pcm16(&[1.0, -1.0, 0.0]);
        assert_eq!(frame, vec![0xff, 0x7f, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        let samples = decode_pcm16(&[0x00, 0x80, 0x00, 0x40, 0x7f]);
        assert_eq!(samples, vec![-1.0, 0.5]);
    }

    #[test]
    fn test_block_frame_size() {
        let frame = encode_pcm16(&vec![0.25; BLOCK_SIZE]);
        assert_eq!(frame.len(), BLOCK_SIZE * 2);
        assert!((duration_secs(BLOCK_SIZE) - 0.064).abs() < 1e-9);
    }

    #[test]
    fn test_visualizer_levels() {
        let silence = visualizer_levels(&vec![0.0; BLOCK_SIZE], VISUALIZER_BARS);
        assert_eq!(silence.len(), VISUALIZER_BARS);
        assert!(silence.iter().all(|&l| l == LEVEL_MIN));

        let loud = visualizer_levels(&vec![-0.9; BLOCK_SIZE], VISUALIZER_BARS);
        assert!(loud.iter().all(|&l| l == LEVEL_MAX));

        let mid = visualizer_levels(&vec![0.1; 48], 4);
        assert_eq!(mid.len(), 4);
        assert!(mid.iter().all(|&l| (l - 20.0).abs() < 1e-3));
    }

    #[test]
    fn test_visualizer_short_frame() {
        assert_eq!(visualizer_levels(&[0.5; 3], 8), vec![LEVEL_MIN; 8]);
    }
}
