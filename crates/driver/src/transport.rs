//! The contract the protocol core assumes of the USB host stack.
//!
//! The core never talks to a USB library directly; it submits outbound
//! buffers and pumps completions through [`BulkUsb`]. Production uses
//! the [`nusb`](crate::transport::nusb_backend::NusbTransport) backend;
//! tests drive the core with a mock that records submissions and replays
//! programmed inbound frames.

pub mod nusb_backend;

use std::time::Duration;

/// Which transmit pool a buffer belongs to, so completions find their
/// way back to the right free ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOwner {
    /// The façade thread's buffer (PDO writes, explicit triggers).
    Default,
    /// The tick thread's buffer (retry/confirm traffic).
    Tick,
}

/// Terminal status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transferred in full.
    Completed,
    /// Cancelled during shutdown.
    Cancelled,
    /// Endpoint stalled.
    Stall,
    /// The device is gone.
    NoDevice,
    /// Any other transport-level failure.
    Fault,
}

/// An outbound bulk transfer handed to the transport.
#[derive(Debug)]
pub struct OutTransfer {
    /// The padded frame bytes; ownership returns via the completion.
    pub data: Vec<u8>,
    /// The pool the buffer must be recycled into.
    pub owner: TransmitOwner,
}

/// A finished outbound transfer, buffer returned for reuse.
#[derive(Debug)]
pub struct OutCompletion {
    /// The buffer (cleared of transfer bookkeeping, capacity intact).
    pub data: Vec<u8>,
    /// The pool the buffer must be recycled into.
    pub owner: TransmitOwner,
    /// Terminal status.
    pub status: TransferStatus,
    /// Bytes handed to the transport.
    pub submitted_len: usize,
    /// Bytes the device actually accepted.
    pub actual_len: usize,
}

/// Receiver for transfer completions, invoked on whichever thread calls
/// [`BulkUsb::handle_events`].
pub trait CompletionSink {
    /// An outbound transfer finished.
    fn out_completed(&mut self, completion: OutCompletion);
    /// An inbound transfer finished; `data` holds the received bytes.
    fn in_completed(&mut self, data: &[u8], status: TransferStatus);
}

/// Errors surfaced by a transport backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UsbError {
    /// No device matched the requested identity.
    #[error("device not found: vendor={vendor_id:#06x}, product={product_id:#06x}")]
    DeviceNotFound {
        /// USB vendor id.
        vendor_id: u16,
        /// USB product id.
        product_id: u16,
    },

    /// The matched device lacks a usable bulk endpoint pair.
    #[error("no bulk {direction} endpoint on interface 0")]
    MissingEndpoint {
        /// "IN" or "OUT".
        direction: &'static str,
    },

    /// Device enumeration, open, or claim failed.
    #[error("usb setup failed: {0}")]
    Setup(String),

    /// The event pump is gone; nothing can be submitted any more.
    #[error("usb event pump terminated")]
    PumpTerminated,
}

/// Asynchronous bulk transport to one device.
///
/// Submissions must not block. Completions are delivered only from
/// `handle_events`, so whoever pumps events is the completion thread:
/// the event thread in steady state, the handler's destructor during the
/// final drain.
pub trait BulkUsb: Send + Sync {
    /// Queue an outbound bulk transfer. Non-blocking.
    fn submit_out(&self, transfer: OutTransfer) -> Result<(), UsbError>;

    /// Keep `count` inbound transfers of `len` bytes in flight; each is
    /// resubmitted when its completion has been delivered.
    fn start_receive_pool(&self, count: usize, len: usize) -> Result<(), UsbError>;

    /// Deliver pending completions to `sink`, blocking up to roughly
    /// `budget` when there is nothing to do. Returns after the budget,
    /// after a [`BulkUsb::wake`], or earlier once work was delivered.
    fn handle_events(&self, budget: Duration, sink: &mut dyn CompletionSink)
    -> Result<(), UsbError>;

    /// Interrupt a blocking `handle_events` call.
    fn wake(&self);
}
