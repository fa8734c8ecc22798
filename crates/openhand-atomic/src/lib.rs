//! Lock-free primitives for the openhand driver hot paths.
//!
//! This crate provides the bounded, allocation-free building blocks the
//! driver core relies on: a fixed-capacity lock-free queue used as the
//! USB transfer free pool, and a counting latch used as a completion
//! barrier. All operations after construction are non-blocking except
//! [`Latch::wait`], which is the point.

#![deny(static_mut_refs)]

pub mod latch;
pub mod ring;

pub use latch::Latch;
pub use ring::RingBuffer;
