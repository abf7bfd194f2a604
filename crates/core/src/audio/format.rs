//! PCM sample and byte-order conversions.

use pilot_protocol::AudioFormat;

use super::AudioError;

/// Convert f32 samples to i16 with proper scaling.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Convert i16 samples to f32 with proper scaling.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Serialize f32 samples as 16-bit signed little-endian PCM bytes, the
/// outbound capture format.
pub fn encode_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in f32_to_i16(samples) {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Decode a raw chunk into uniform f32 samples.
pub fn decode_chunk(format: AudioFormat, payload: &[u8]) -> Result<Vec<f32>, AudioError> {
    match format {
        AudioFormat::PcmS16le => {
            if payload.len() % 2 != 0 {
                return Err(AudioError::Decode(format!(
                    "s16le payload length {} is not sample-aligned",
                    payload.len()
                )));
            }
            Ok(payload
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
                .collect())
        }
        AudioFormat::PcmF32le => {
            if payload.len() % 4 != 0 {
                return Err(AudioError::Decode(format!(
                    "f32le payload length {} is not sample-aligned",
                    payload.len()
                )));
            }
            Ok(payload
                .chunks_exact(4)
                .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                .collect())
        }
    }
}

/// Downmix interleaved channels to mono and nearest-neighbor resample.
///
/// Good enough for speech energy detection and recognition input; devices
/// that capture at 44.1/48 kHz land on the recognizer's 16 kHz this way.
pub fn downmix_and_decimate(
    input: &[f32],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Vec<f32> {
    if channels == 0 || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }
    let mono: Vec<f32> = if channels == 1 {
        input.to_vec()
    } else {
        input
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    if source_rate == target_rate {
        return mono;
    }
    let out_len = (mono.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * source_rate as u64 / target_rate as u64) as usize;
            mono[src.min(mono.len() - 1)]
        })
        .collect()
}

/// Root-mean-square energy of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_i16_scaling() {
        let samples = vec![1.0f32, 0.5, 0.0, -0.5, -1.0];
        let ints = f32_to_i16(&samples);
        assert_eq!(ints[0], 32767);
        assert_eq!(ints[1], 16383);
        assert_eq!(ints[2], 0);
        assert_eq!(ints[3], -16383);
        assert_eq!(ints[4], -32767);
    }

    #[test]
    fn s16le_round_trip() {
        let samples = vec![0.25f32, -0.25, 0.0];
        let bytes = encode_pcm_s16le(&samples);
        assert_eq!(bytes.len(), 6);
        let decoded = decode_chunk(AudioFormat::PcmS16le, &bytes).unwrap();
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn f32le_decode() {
        let samples = [0.5f32, -0.125];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let decoded = decode_chunk(AudioFormat::PcmF32le, &bytes).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn misaligned_payload_is_a_decode_error() {
        assert!(decode_chunk(AudioFormat::PcmS16le, &[1, 2, 3]).is_err());
        assert!(decode_chunk(AudioFormat::PcmF32le, &[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn downmix_averages_and_decimates() {
        let stereo = vec![0.5, -0.5, 0.3, -0.3, 0.1, -0.1, 0.2, 0.0];
        let mono = downmix_and_decimate(&stereo, 2, 16_000, 16_000);
        assert_eq!(mono.len(), 4);
        assert!(mono[0].abs() < 1e-6);
        assert!((mono[3] - 0.1).abs() < 1e-6);

        // 48k -> 16k keeps one sample in three.
        let input: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let decimated = downmix_and_decimate(&input, 1, 48_000, 16_000);
        assert_eq!(decimated.len(), 16);
        assert_eq!(decimated[1], 3.0);
    }

    #[test]
    fn rms_of_silence_and_tone() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 128]), 0.0);
        let loud = rms(&[0.5; 128]);
        assert!((loud - 0.5).abs() < 1e-6);
    }
}
