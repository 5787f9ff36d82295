//! G.711 µ-law codec.
//!
//! - Encoder: 16-bit linear PCM → 8-bit µ-law (2:1)
//! - Decoder: 8-bit µ-law → 16-bit linear PCM
//!
//! Bit-exact with the ITU-T G.711 tables so any compliant peer can decode
//! what we send.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

// ======================== Sample codec ========================

/// Compress one linear sample to a µ-law byte.
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    magnitude = magnitude.min(CLIP) + BIAS;

    // Highest set bit above bit 7 selects one of 8 segments
    let highest_bit = 31 - (magnitude as u32).leading_zeros() as i32;
    let exponent = (highest_bit - 7).clamp(0, 7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expand one µ-law byte to a linear sample.
pub fn decode_sample(code: u8) -> i16 {
    let code = !code as i32;
    let sign = code & 0x80;
    let exponent = (code >> 4) & 0x07;
    let mantissa = code & 0x0F;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

// ======================== Frame codec ========================

/// Compress interleaved little-endian PCM16 bytes.
///
/// A trailing odd byte is ignored, so a 320-byte frame always yields 160 bytes.
pub fn encode_frame(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|b| encode_sample(i16::from_le_bytes([b[0], b[1]])))
        .collect()
}

/// Expand µ-law bytes to little-endian PCM16 bytes (one byte → two).
pub fn decode_frame(ulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ulaw.len() * 2);
    for &code in ulaw {
        out.extend_from_slice(&decode_sample(code).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{COMPRESSED_FRAME_BYTES, FRAME_BYTES, FRAME_SAMPLES};

    fn encode_samples(samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|&s| encode_sample(s)).collect()
    }

    fn decode_samples(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|&c| decode_sample(c)).collect()
    }

    #[test]
    fn reference_codes() {
        assert_eq!(encode_sample(0), 0xFF);
        assert_eq!(encode_sample(i16::MAX), 0x80);
        assert_eq!(encode_sample(i16::MIN), 0x00);
        assert_eq!(encode_sample(-1), 0x7F);

        assert_eq!(decode_sample(0xFF), 0);
        assert_eq!(decode_sample(0x7F), 0);
        assert_eq!(decode_sample(0x80), 32124);
        assert_eq!(decode_sample(0x00), -32124);
    }

    #[test]
    fn round_trip_within_quantization_error() {
        for x in i16::MIN..=i16::MAX {
            let y = decode_sample(encode_sample(x));
            let err = (x as i32 - y as i32).abs();
            let bound = ((x as i32).abs() >> 4) + 8;
            assert!(err <= bound, "x={} decoded={} err={} bound={}", x, y, err, bound);

            // Sign never flips, small values may collapse to zero
            if y != 0 {
                assert_eq!(x.signum(), y.signum(), "sign flipped for {}", x);
            }
        }
    }

    #[test]
    fn magnitude_is_monotonic() {
        let mut last = decode_sample(encode_sample(0));
        for x in (0..=i16::MAX).step_by(7) {
            let y = decode_sample(encode_sample(x));
            assert!(y >= last, "decoded {} after {} at x={}", y, last, x);
            last = y;
        }
    }

    #[test]
    fn every_code_survives_decode_encode() {
        for code in 0..=255u8 {
            let back = encode_sample(decode_sample(code));
            // 0x7F is negative zero and re-encodes as positive zero
            if code == 0x7F {
                assert_eq!(back, 0xFF);
            } else {
                assert_eq!(back, code, "code {:#04x}", code);
            }
        }
    }

    #[test]
    fn frame_sizes() {
        let pcm = vec![0x12u8; FRAME_BYTES];
        let ulaw = encode_frame(&pcm);
        assert_eq!(ulaw.len(), COMPRESSED_FRAME_BYTES);
        assert_eq!(decode_frame(&ulaw).len(), FRAME_BYTES);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        assert_eq!(encode_frame(&[0, 0, 7]).len(), 1);
    }

    #[test]
    fn silence_frame_decodes_to_near_zero() {
        let silence = vec![0xFFu8; COMPRESSED_FRAME_BYTES];
        let samples = decode_samples(&silence);
        assert_eq!(samples.len(), FRAME_SAMPLES);
        assert!(samples.iter().all(|s| s.abs() <= 8));

        let pcm = decode_frame(&silence);
        assert!(pcm.iter().all(|&b| b == 0));
    }

    #[test]
    fn frame_matches_sample_codec() {
        let samples: Vec<i16> = (0..FRAME_SAMPLES as i32)
            .map(|i| ((i * 397) % 65536 - 32768) as i16)
            .collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        assert_eq!(encode_frame(&bytes), encode_samples(&samples));

        let decoded = decode_frame(&encode_frame(&bytes));
        let expected: Vec<u8> = decode_samples(&encode_samples(&samples))
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(decoded, expected);
    }
}
