//! Conversion between float samples in [-1, 1] and 16-bit PCM.
//!
//! The float -> int16 path scales by `i16::MAX` and truncates toward zero, so
//! `0.5` becomes `16383`. Rust float casts saturate: an out-of-range sample
//! lands on `i16::MIN`/`i16::MAX` rather than wrapping around. Callers that
//! need symmetric clipping should go through [`float_to_int16_clamped`].

const SCALE: f32 = i16::MAX as f32;

/// Number of bytes per encoded sample.
pub const BYTES_PER_SAMPLE: usize = 2;

#[inline]
pub fn sample_to_int16(sample: f32) -> i16 {
    (sample * SCALE) as i16
}

#[inline]
pub fn int16_to_sample(sample: i16) -> f32 {
    sample as f32 / SCALE
}

pub fn float_to_int16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| sample_to_int16(s)).collect()
}

/// Same as [`float_to_int16`] but clamps each sample to [-1, 1] first.
pub fn float_to_int16_clamped(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| sample_to_int16(s.clamp(-1.0, 1.0)))
        .collect()
}

pub fn int16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| int16_to_sample(s)).collect()
}

/// Packs the first `size * channels` samples of `input` into `output` as
/// little-endian int16 and returns the number of bytes written.
///
/// # Panics
///
/// Panics if `input` holds fewer than `size * channels` samples or `output` is
/// too small to receive them.
pub fn float_to_byte_buffer(input: &[f32], size: usize, channels: usize, output: &mut [u8]) -> usize {
    let count = size * channels;
    assert!(
        input.len() >= count,
        "input holds {} samples, {} requested",
        input.len(),
        count
    );
    let needed = count * BYTES_PER_SAMPLE;
    assert!(
        output.len() >= needed,
        "destination holds {} bytes, {} required",
        output.len(),
        needed
    );

    for (dst, &sample) in output[..needed]
        .chunks_exact_mut(BYTES_PER_SAMPLE)
        .zip(&input[..count])
    {
        dst.copy_from_slice(&sample_to_int16(sample).to_le_bytes());
    }
    needed
}

pub fn int16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decodes little-endian int16 bytes. A trailing odd byte is ignored.
pub fn bytes_to_int16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
