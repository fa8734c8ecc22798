//! Host-side USB protocol handler for the openhand dextrous hand.
//!
//! The core of the driver is the [`Handler`]: it owns a storage table
//! mirroring the device's object dictionary, two pools of pre-allocated
//! outbound USB transfers, a 199 Hz tick thread that drives retries and
//! completion callbacks, and an event thread that pumps transfer
//! completions and parses device responses. Callers arm asynchronous
//! per-datum reads and writes by storage id, and push coordinated joint
//! targets through the high-rate PDO channel.
//!
//! ```no_run
//! use openhand_driver::{Handler, HandlerConfig, dictionary};
//!
//! # fn main() -> Result<(), openhand_driver::HandlerError> {
//! let handler = Handler::open(HandlerConfig::new(0x0483, 0x5740, 64))?;
//! dictionary::register_hand_dictionary(&handler, 0);
//! handler.read_async_unchecked(0)?;
//! # Ok(())
//! # }
//! ```
//!
//! Three threads touch a handler: the operating thread (bound on first
//! use, see [`Handler::disable_thread_safe_check`]), the tick thread,
//! and the event thread. Their only hot-path synchronization is the
//! per-unit atomics in the storage table.
//!
//! There is no reconnection story: a disconnect observed on an active
//! transfer aborts the process after logging.

#![deny(static_mut_refs)]
#![warn(missing_docs, rust_2018_idioms)]

// The per-unit value atomics are 64-bit; a target without lock-free
// 64-bit atomics cannot run the three-thread protocol at all.
#[cfg(not(target_has_atomic = "64"))]
compile_error!("openhand-driver requires lock-free 64-bit atomics on the target");

mod buffer8;
pub mod dictionary;
mod handler;
mod storage;
mod transmit;
pub mod transport;

pub use buffer8::Buffer8;
pub use handler::{Handler, HandlerConfig, HandlerError, TICK_RATE_HZ};
pub use openhand_bulk_sdo_protocol::pdo::{FINGER_COUNT, JOINTS_PER_FINGER};
pub use openhand_bulk_sdo_protocol::sdo::DataWidth;
pub use storage::{Policy, StorageCallback, StorageInfo};
