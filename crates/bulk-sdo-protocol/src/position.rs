//! Joint position encoding.
//!
//! Host-side joint angles are `f64` radians; the wire speaks saturating
//! int32 with full scale at one turn. The scale maps `2π` radians onto
//! `i32::MAX`, so one count is about 2.9 nrad and a round trip is exact
//! to within half a count.

use std::f64::consts::TAU;

/// Counts per radian.
pub const POSITION_SCALE: f64 = i32::MAX as f64 / TAU;

/// Encode an angle in radians as a saturating raw position count.
///
/// Out-of-range inputs clamp to the int32 limits; they never wrap.
pub fn to_raw_position(angle: f64) -> i32 {
    (angle * POSITION_SCALE)
        .clamp(i32::MIN as f64, i32::MAX as f64)
        .round() as i32
}

/// Decode a raw position count back into radians.
pub fn from_raw_position(raw: i32) -> f64 {
    f64::from(raw) * (TAU / i32::MAX as f64)
}
