//! 16-bit PCM helpers

/// Scale one sample by `gain`, rounding and clamping to the i16 range
#[inline]
pub fn scale_sample(sample: i16, gain: f32) -> i16 {
    if gain == 1.0 {
        return sample;
    }
    let scaled = (sample as f32 * gain).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Append gain-scaled samples to `out` as little-endian bytes
pub fn encode_le(samples: &[i16], gain: f32, out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&scale_sample(s, gain).to_le_bytes());
    }
}

/// Append little-endian bytes to `out` as samples; a trailing odd byte is ignored
pub fn decode_le(bytes: &[u8], out: &mut Vec<i16>) {
    out.reserve(bytes.len() / 2);
    out.extend(bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])));
}

/// Bytes of 16-bit PCM covering `millis` at the given rate and channel count
pub fn bytes_for_millis(sample_rate: u32, channels: u16, millis: u64) -> usize {
    (sample_rate as u64 * channels as u64 * 2 * millis / 1000) as usize
}
