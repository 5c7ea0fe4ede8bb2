//! Packed 24-bit sample codec.
//!
//! The driver's wire format is a signed 24-bit sample stored in the upper 24
//! bits of a 32-bit word:
//!
//! ```text
//! bit 31                 8 7      0
//!     [ 24-bit sample     | padding ]
//! ```
//!
//! The low 8 bits are don't-care on input and always written as zero.
//! Normalized samples are `f32` in `[-1.0, 1.0)`; every 24-bit value maps to
//! an exactly representable `f32`, so decode followed by encode is lossless.

/// 2^23, the magnitude of the most negative 24-bit sample.
pub const FULL_SCALE: f32 = 8_388_608.0;

/// Smallest 24-bit signed sample.
pub const SAMPLE_MIN: i32 = -8_388_608;

/// Largest 24-bit signed sample.
pub const SAMPLE_MAX: i32 = 8_388_607;

const SIGN_BIT: i32 = 0x80_0000;
const SIGN_EXTEND: i32 = !0xFF_FFFF;

/// Extract the 24-bit sample from a raw driver word.
#[inline]
pub fn unpack(raw: i32) -> i32 {
    let v = raw >> 8;
    if v & SIGN_BIT != 0 { v | SIGN_EXTEND } else { v }
}

/// Store a 24-bit sample in the upper bits of a driver word, zero padding.
///
/// Values outside the 24-bit range are clamped.
#[inline]
pub fn pack(sample: i32) -> i32 {
    sample.clamp(SAMPLE_MIN, SAMPLE_MAX) << 8
}

/// Raw driver word to normalized sample.
#[inline]
pub fn decode(raw: i32) -> f32 {
    unpack(raw) as f32 / FULL_SCALE
}

/// Normalized sample to raw driver word.
///
/// The scaled value is truncated toward zero; `NaN` encodes as silence.
#[inline]
pub fn encode(sample: f32) -> i32 {
    pack((sample * FULL_SCALE) as i32)
}
