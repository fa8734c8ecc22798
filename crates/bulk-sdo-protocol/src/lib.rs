//! Wire codec for the hand's USB bulk SDO/PDO protocol.
//!
//! This crate is intentionally I/O-free and allocation-free: it encodes
//! requests into caller-provided buffers and parses responses from byte
//! slices, so it can be tested and fuzzed without hardware or USB
//! plumbing. All multi-byte fields are big-endian on the wire.
//!
//! A transfer carries one frame: an 8-byte [`frame`] header, one or more
//! payloads of a single frame type (SDO configuration traffic or a PDO
//! joint-position burst), zero padding to a 16-byte boundary, and a
//! 2-byte CRC tail the device tolerates as zero.

#![deny(static_mut_refs)]

pub mod frame;
pub mod pdo;
pub mod position;
pub mod sdo;

pub use frame::{
    FRAME_ALIGN, HEADER_LEN, TYPE_BLANK, TYPE_PDO_WRITE, TYPE_SDO, finalize_frame, frame_type,
    payload, reset_prefill, set_frame_type,
};
pub use pdo::{FINGER_COUNT, JOINTS_PER_FINGER, PDO_CONTROL_POSITION_ID};
pub use position::{from_raw_position, to_raw_position};
pub use sdo::{DataWidth, SdoResponse, SdoValue, parse_responses};
