//! PDO joint-position burst encoding.
//!
//! The control-position PDO carries one int32 target per joint for the
//! whole hand in a single frame, plus the caller's timestamp. Joint 0 of
//! every finger but the thumb is the abduction axis and is negated on the
//! wire (the controller's sign convention).

use crate::position::to_raw_position;

/// Fingers on the hand.
pub const FINGER_COUNT: usize = 5;
/// Joints per finger.
pub const JOINTS_PER_FINGER: usize = 4;

/// PDO id of the control-position burst.
pub const PDO_CONTROL_POSITION_ID: u16 = 0x100;

/// Encoded payload length: id, 5×4 positions, timestamp.
pub const WRITE_LEN: usize = 2 + FINGER_COUNT * JOINTS_PER_FINGER * 4 + 4;

/// Encode a control-position burst into `out` (exactly [`WRITE_LEN`]
/// bytes). Angles are radians, finger-major, joint-minor.
pub fn encode_control_positions(
    out: &mut [u8],
    positions: &[[f64; JOINTS_PER_FINGER]; FINGER_COUNT],
    timestamp: u32,
) {
    assert_eq!(out.len(), WRITE_LEN);
    out[0..2].copy_from_slice(&PDO_CONTROL_POSITION_ID.to_be_bytes());
    let mut offset = 2;
    for (finger, joints) in positions.iter().enumerate() {
        for (joint, &angle) in joints.iter().enumerate() {
            let mut raw = to_raw_position(angle);
            if joint == 0 && finger != 0 {
                raw = raw.saturating_neg();
            }
            out[offset..offset + 4].copy_from_slice(&raw.to_be_bytes());
            offset += 4;
        }
    }
    out[offset..offset + 4].copy_from_slice(&timestamp.to_be_bytes());
}
