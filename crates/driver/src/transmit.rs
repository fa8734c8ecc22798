//! The outbound transfer pool.
//!
//! Each [`AsyncTransmitBuffer`] owns a ring of pre-allocated transfer
//! buffers. The head buffer accumulates frames until a caller predicate
//! rejects it (wrong frame type, not enough room) or transmission is
//! triggered explicitly; it is then popped, padded, described, and handed
//! to the transport. Completions recycle buffers back into the ring on
//! the event thread.
//!
//! Concurrency contract: exactly one thread fetches from and triggers a
//! given buffer (the façade thread for the default buffer, the tick
//! thread for the tick buffer); only the event thread pushes recycled
//! buffers back. That is the single-consumer discipline the ring's
//! `front_mut` requires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use openhand_atomic::RingBuffer;
use openhand_bulk_sdo_protocol::frame;
use tracing::error;

use crate::transport::{BulkUsb, OutTransfer, TransmitOwner};

/// Transfer buffer capacity; matches the device's maximum frame size.
pub(crate) const MAX_TRANSMIT_LENGTH: usize = 192;

/// One pooled transfer buffer: the 8-byte blank header prefill plus
/// whatever frames have been appended since the last submit.
pub(crate) struct TransmitSlot {
    pub(crate) buf: Vec<u8>,
}

impl TransmitSlot {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(MAX_TRANSMIT_LENGTH);
        frame::reset_prefill(&mut buf);
        Self { buf }
    }
}

pub(crate) struct AsyncTransmitBuffer {
    usb: Arc<dyn BulkUsb>,
    owner: TransmitOwner,
    free_transfers: RingBuffer<TransmitSlot>,
    /// Edge latch so "all transfers busy" is logged once per episode,
    /// not once per tick.
    transfers_all_busy: AtomicBool,
}

impl AsyncTransmitBuffer {
    pub(crate) fn new(usb: Arc<dyn BulkUsb>, owner: TransmitOwner, transfer_count: usize) -> Self {
        let free_transfers = RingBuffer::new(transfer_count);
        let filled = free_transfers.push_back_multi(TransmitSlot::new, transfer_count);
        debug_assert_eq!(filled, transfer_count);
        Self {
            usb,
            owner,
            free_transfers,
            transfers_all_busy: AtomicBool::new(false),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.free_transfers.capacity()
    }

    /// Number of transfers currently free (not in flight).
    pub(crate) fn free_len(&self) -> usize {
        self.free_transfers.len()
    }

    /// Reserve `size` contiguous bytes in the head transfer.
    #[cfg(test)]
    pub(crate) fn try_fetch_buffer(&self, size: usize) -> Option<&mut [u8]> {
        self.try_fetch_buffer_with(|free, _| free >= size, move |_| size)
    }

    /// Reserve bytes in the head transfer, letting the caller veto the
    /// transfer first.
    ///
    /// `check_transfer(free_size, transfer)` decides whether the head
    /// transfer is acceptable; rejecting it submits the transfer as-is
    /// and retries with the next one. Once accepted,
    /// `actual_size(free_size)` picks how many bytes to reserve.
    pub(crate) fn try_fetch_buffer_with(
        &self,
        check_transfer: impl Fn(usize, &mut [u8]) -> bool,
        actual_size: impl Fn(usize) -> usize,
    ) -> Option<&mut [u8]> {
        loop {
            // SAFETY: per the module contract only this thread pops or
            // peeks this ring, so the head reference is exclusive.
            let Some(slot) = (unsafe { self.free_transfers.front_mut() }) else {
                if !self.transfers_all_busy.swap(true, Ordering::Relaxed) {
                    error!("failed to fetch free transmit buffer: all transfers are busy");
                }
                return None;
            };
            self.transfers_all_busy.store(false, Ordering::Relaxed);

            let free_size = MAX_TRANSMIT_LENGTH - slot.buf.len();
            if !check_transfer(free_size, &mut slot.buf) {
                self.trigger_transmission_nocheck();
                continue;
            }

            let size = actual_size(free_size);
            if free_size < size {
                return None;
            }
            let start = slot.buf.len();
            slot.buf.resize(start + size, 0);
            return Some(&mut slot.buf[start..]);
        }
    }

    /// Submit the head transfer if it carries any payload beyond the
    /// header prefill. Returns whether a submission happened.
    pub(crate) fn trigger_transmission(&self) -> bool {
        // SAFETY: single-consumer contract as above.
        let has_payload = unsafe { self.free_transfers.front_mut() }
            .map_or(false, |slot| slot.buf.len() > frame::HEADER_LEN);
        if !has_payload {
            return false;
        }
        self.trigger_transmission_nocheck()
    }

    fn trigger_transmission_nocheck(&self) -> bool {
        // The transfer must leave the ring before it is submitted: a
        // completion that races the submit could otherwise find the ring
        // full while recycling and report a spurious leak.
        let Some(mut slot) = self.free_transfers.pop_front() else {
            return false;
        };

        frame::finalize_frame(&mut slot.buf);
        if let Err(e) = self.usb.submit_out(OutTransfer {
            data: slot.buf,
            owner: self.owner,
        }) {
            error!("failed to submit transmit transfer: {e}; terminating");
            std::process::abort();
        }
        true
    }

    /// Return a completed transfer buffer to the free ring (event
    /// thread). The buffer is reset to the blank prefill so the next
    /// fetch starts from an unclaimed frame.
    pub(crate) fn recycle(&self, mut buf: Vec<u8>) {
        frame::reset_prefill(&mut buf);
        if self.free_transfers.push_back(TransmitSlot { buf }).is_err() {
            error!("recycled transmit transfer does not fit its free ring");
            error!(
                "a full ring on recycle should be impossible and indicates a thread \
                 synchronization bug; terminating so it is caught promptly"
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CompletionSink, UsbError};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct StubUsb {
        submitted: Mutex<Vec<OutTransfer>>,
    }

    impl BulkUsb for StubUsb {
        fn submit_out(&self, transfer: OutTransfer) -> Result<(), UsbError> {
            self.submitted.lock().unwrap().push(transfer);
            Ok(())
        }

        fn start_receive_pool(&self, _count: usize, _len: usize) -> Result<(), UsbError> {
            Ok(())
        }

        fn handle_events(
            &self,
            _budget: Duration,
            _sink: &mut dyn CompletionSink,
        ) -> Result<(), UsbError> {
            Ok(())
        }

        fn wake(&self) {}
    }

    fn buffer_with_stub(transfer_count: usize) -> (Arc<StubUsb>, AsyncTransmitBuffer) {
        let usb = Arc::new(StubUsb::default());
        let buffer = AsyncTransmitBuffer::new(
            Arc::clone(&usb) as Arc<dyn BulkUsb>,
            TransmitOwner::Default,
            transfer_count,
        );
        (usb, buffer)
    }

    #[test]
    fn trigger_without_payload_is_a_no_op() {
        let (usb, buffer) = buffer_with_stub(2);
        assert!(!buffer.trigger_transmission());
        assert!(usb.submitted.lock().unwrap().is_empty());
        assert_eq!(buffer.free_len(), 2);
    }

    #[test]
    fn frames_aggregate_until_triggered() {
        let (usb, buffer) = buffer_with_stub(2);
        buffer.try_fetch_buffer(4).unwrap().copy_from_slice(&[1; 4]);
        buffer.try_fetch_buffer(4).unwrap().copy_from_slice(&[2; 4]);
        assert!(buffer.trigger_transmission());

        let submitted = usb.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let data = &submitted[0].data;
        // 8 header + 8 payload + CRC tail -> one 16-byte block short, so 32.
        assert_eq!(data.len(), 32);
        assert_eq!(&data[8..12], &[1; 4]);
        assert_eq!(&data[12..16], &[2; 4]);
        assert_eq!(buffer.free_len(), 1);
    }

    #[test]
    fn rejecting_predicate_submits_and_moves_on() {
        let (usb, buffer) = buffer_with_stub(2);
        buffer
            .try_fetch_buffer_with(
                |_, transfer| {
                    frame::set_frame_type(transfer, frame::TYPE_SDO);
                    true
                },
                |_| 4,
            )
            .unwrap();

        // A PDO fetch must refuse the SDO transfer, flushing it out.
        let fetched = buffer.try_fetch_buffer_with(
            |_, transfer| match frame::frame_type(transfer) {
                frame::TYPE_BLANK => {
                    frame::set_frame_type(transfer, frame::TYPE_PDO_WRITE);
                    true
                }
                frame::TYPE_PDO_WRITE => true,
                _ => false,
            },
            |_| 8,
        );
        assert!(fetched.is_some());

        let submitted = usb.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(frame::frame_type(&submitted[0].data), frame::TYPE_SDO);
        assert_eq!(buffer.free_len(), 1);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let (usb, buffer) = buffer_with_stub(1);
        buffer.try_fetch_buffer(4).unwrap();
        assert!(buffer.trigger_transmission());
        assert!(buffer.try_fetch_buffer(4).is_none());
        assert_eq!(usb.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsatisfiable_request_flushes_the_pool_and_returns_none() {
        // A request no transfer can ever satisfy keeps rejecting the
        // head, so every pooled transfer is flushed out (header-only)
        // before the fetch gives up.
        let (usb, buffer) = buffer_with_stub(1);
        assert!(buffer.try_fetch_buffer(MAX_TRANSMIT_LENGTH).is_none());
        let submitted = usb.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].data.len(), 16);
        assert_eq!(buffer.free_len(), 0);
    }

    #[test]
    fn recycle_resets_the_prefill() {
        let (usb, buffer) = buffer_with_stub(1);
        buffer
            .try_fetch_buffer_with(
                |_, transfer| {
                    frame::set_frame_type(transfer, frame::TYPE_SDO);
                    true
                },
                |_| 4,
            )
            .unwrap();
        assert!(buffer.trigger_transmission());
        assert_eq!(buffer.free_len(), 0);

        let data = usb.submitted.lock().unwrap().pop().unwrap().data;
        buffer.recycle(data);
        assert_eq!(buffer.free_len(), 1);

        let fetched = buffer
            .try_fetch_buffer_with(|_, transfer| frame::frame_type(transfer) == frame::TYPE_BLANK, |_| 4);
        assert!(fetched.is_some());
    }
}
