//! Sample-type and channel-layout conversions.
//!
//! All transforms work on interleaved samples. Int16 values map onto the
//! float range by dividing by 32768, so every int16 value has an exact
//! float32 representation and converts back to itself.

use super::format::{
    bytes_to_samples_f32, bytes_to_samples_i16, samples_to_bytes_f32, samples_to_bytes_i16,
    SampleType,
};

const I16_SCALE: f32 = 32768.0;

/// int16 -> float32 in [-1, 1).
pub fn int16_to_float32(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

/// float32 -> int16: clamp to [-1, 1], scale, round, saturate.
///
/// Scales by 32768 rather than 32767 so that `int16_to_float32` followed by
/// this function returns every int16 value unchanged.
pub fn float32_to_int16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * I16_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Decode little-endian PCM bytes of `sample_type` into float samples.
pub fn decode_samples(data: &[u8], sample_type: SampleType) -> Vec<f32> {
    match sample_type {
        SampleType::Int16 => bytes_to_samples_i16(data)
            .into_iter()
            .map(int16_to_float32)
            .collect(),
        SampleType::Float32 => bytes_to_samples_f32(data),
    }
}

/// Encode float samples as little-endian PCM bytes of `sample_type`.
pub fn encode_samples(samples: &[f32], sample_type: SampleType) -> Vec<u8> {
    match sample_type {
        SampleType::Int16 => {
            let ints: Vec<i16> = samples.iter().copied().map(float32_to_int16).collect();
            samples_to_bytes_i16(&ints)
        }
        SampleType::Float32 => samples_to_bytes_f32(samples),
    }
}

/// Mono -> stereo duplicates, stereo -> mono averages each frame.
pub fn convert_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    match (from, to) {
        (a, b) if a == b => samples.to_vec(),
        (1, 2) => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        (2, 1) => samples
            .chunks_exact(2)
            .map(|frame| (frame[0] + frame[1]) * 0.5)
            .collect(),
        _ => unreachable!("AudioFormat only admits mono and stereo"),
    }
}

/// Split interleaved samples into one vector per channel.
pub fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }
    planar
}

/// Inverse of [`deinterleave`]. All channels must hold the same frame count.
pub fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = planar.first() else {
        return Vec::new();
    };
    let frames = first.len();
    let mut out = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int16_round_trip_is_exact() {
        for x in i16::MIN..=i16::MAX {
            assert_eq!(float32_to_int16(int16_to_float32(x)), x, "sample {}", x);
        }
    }

    #[test]
    fn float_conversion_saturates() {
        assert_eq!(float32_to_int16(1.0), i16::MAX);
        assert_eq!(float32_to_int16(7.5), i16::MAX);
        assert_eq!(float32_to_int16(-1.0), i16::MIN);
        assert_eq!(float32_to_int16(-3.0), i16::MIN);
        assert_eq!(float32_to_int16(f32::NAN), 0);
        assert!(int16_to_float32(i16::MIN) == -1.0);
        assert!(int16_to_float32(i16::MAX) < 1.0);
    }

    #[test]
    fn mono_stereo_mono_is_lossless() {
        let mono: Vec<f32> = (-50..50).map(|i| int16_to_float32(i * 611)).collect();
        let stereo = convert_channels(&mono, 1, 2);
        assert_eq!(stereo.len(), mono.len() * 2);
        assert_eq!(convert_channels(&stereo, 2, 1), mono);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let stereo = [0.5, -0.5, 1.0, 0.0];
        assert_eq!(convert_channels(&stereo, 2, 1), vec![0.0, 0.5]);
    }

    #[test]
    fn planar_round_trip() {
        let interleaved = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let planar = deinterleave(&interleaved, 2);
        assert_eq!(planar, vec![vec![1.0, 3.0, 5.0], vec![2.0, 4.0, 6.0]]);
        assert_eq!(interleave(&planar), interleaved);
    }

    #[test]
    fn byte_codecs_match_sample_type() {
        let bytes = encode_samples(&[0.5, -0.25], SampleType::Int16);
        assert_eq!(bytes.len(), 4);
        assert_eq!(decode_samples(&bytes, SampleType::Int16), vec![0.5, -0.25]);
        let bytes = encode_samples(&[0.1], SampleType::Float32);
        assert_eq!(decode_samples(&bytes, SampleType::Float32), vec![0.1]);
    }
}
