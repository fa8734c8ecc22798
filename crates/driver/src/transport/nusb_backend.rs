//! Production transport on top of `nusb`.
//!
//! Outbound submissions are wrapped into boxed transfer futures and
//! shipped to the pump over a channel, so `submit_out` never blocks the
//! calling thread. The pump itself runs inside `handle_events` on a
//! small `futures` executor: it races the control channel, the inbound
//! transfer queue, and the set of in-flight outbound transfers, and
//! feeds every completion to the caller's sink. A heartbeat ticker
//! bounds each `handle_events` call so stop flags and drain deadlines
//! are honored even when the bus is silent.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::{self, BoxFuture, Either};
use futures::stream::{FuturesUnordered, StreamExt};
use nusb::Interface;
use nusb::transfer::{
    Completion, Direction, EndpointType, Queue, RequestBuffer, ResponseBuffer, TransferError,
};
use tracing::debug;

use super::{BulkUsb, CompletionSink, OutCompletion, OutTransfer, TransferStatus, UsbError};

/// Heartbeat period for the pump; the ceiling on stop latency.
const TICK_PERIOD: Duration = Duration::from_millis(50);

struct OutDone {
    owner: super::TransmitOwner,
    submitted_len: usize,
    completion: Completion<ResponseBuffer>,
}

enum PumpMessage {
    Submit(BoxFuture<'static, OutDone>),
    Wake,
}

struct PumpState {
    ctrl_rx: UnboundedReceiver<PumpMessage>,
    in_queue: Option<Queue<RequestBuffer>>,
    in_len: usize,
    out_pending: FuturesUnordered<BoxFuture<'static, OutDone>>,
}

enum PumpEvent {
    Ctrl(Option<PumpMessage>),
    In(Completion<Vec<u8>>),
    Out(OutDone),
}

/// Bulk transport to one claimed interface of one device.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    ctrl_tx: UnboundedSender<PumpMessage>,
    pump: Mutex<PumpState>,
    ticker_stop: std::sync::Arc<AtomicBool>,
    ticker: Option<thread::JoinHandle<()>>,
}

impl NusbTransport {
    /// Open the first device matching `(vendor_id, product_id)` and,
    /// when given, `serial_number`; then claim interface 0 and discover
    /// its first bulk IN and bulk OUT endpoints.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<&str>,
    ) -> Result<Self, UsbError> {
        let device_info = nusb::list_devices()
            .map_err(|e| UsbError::Setup(format!("usb enumeration: {e}")))?
            .find(|dev| {
                dev.vendor_id() == vendor_id
                    && dev.product_id() == product_id
                    && serial_number.map_or(true, |s| dev.serial_number() == Some(s))
            })
            .ok_or(UsbError::DeviceNotFound {
                vendor_id,
                product_id,
            })?;

        let device = device_info
            .open()
            .map_err(|e| UsbError::Setup(format!("usb open: {e}")))?;
        let interface = device
            .claim_interface(0)
            .map_err(|e| UsbError::Setup(format!("claim interface 0: {e}")))?;

        let mut in_endpoint = None;
        let mut out_endpoint = None;
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoints() {
                if endpoint.transfer_type() != EndpointType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => in_endpoint = in_endpoint.or(Some(endpoint.address())),
                    Direction::Out => out_endpoint = out_endpoint.or(Some(endpoint.address())),
                }
            }
        }
        let in_endpoint = in_endpoint.ok_or(UsbError::MissingEndpoint { direction: "IN" })?;
        let out_endpoint = out_endpoint.ok_or(UsbError::MissingEndpoint { direction: "OUT" })?;
        debug!(
            "claimed hand device {vendor_id:#06x}:{product_id:#06x}, \
             bulk in 0x{in_endpoint:02x}, bulk out 0x{out_endpoint:02x}"
        );

        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let ticker_stop = std::sync::Arc::new(AtomicBool::new(false));
        let ticker = {
            let stop = std::sync::Arc::clone(&ticker_stop);
            let tx = ctrl_tx.clone();
            thread::Builder::new()
                .name("openhand-usb-tick".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(TICK_PERIOD);
                        if tx.unbounded_send(PumpMessage::Wake).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| UsbError::Setup(format!("spawn heartbeat: {e}")))?
        };

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            ctrl_tx,
            pump: Mutex::new(PumpState {
                ctrl_rx,
                in_queue: None,
                in_len: 0,
                out_pending: FuturesUnordered::new(),
            }),
            ticker_stop,
            ticker: Some(ticker),
        })
    }

    fn map_status(status: &Result<(), TransferError>) -> TransferStatus {
        match status {
            Ok(()) => TransferStatus::Completed,
            Err(TransferError::Cancelled) => TransferStatus::Cancelled,
            Err(TransferError::Stall) => TransferStatus::Stall,
            Err(TransferError::Disconnected) => TransferStatus::NoDevice,
            Err(_) => TransferStatus::Fault,
        }
    }
}

impl BulkUsb for NusbTransport {
    fn submit_out(&self, transfer: OutTransfer) -> Result<(), UsbError> {
        let OutTransfer { data, owner } = transfer;
        let submitted_len = data.len();
        let transfer_future = self.interface.bulk_out(self.out_endpoint, data);
        let done = async move {
            OutDone {
                owner,
                submitted_len,
                completion: transfer_future.await,
            }
        }
        .boxed();
        self.ctrl_tx
            .unbounded_send(PumpMessage::Submit(done))
            .map_err(|_| UsbError::PumpTerminated)
    }

    fn start_receive_pool(&self, count: usize, len: usize) -> Result<(), UsbError> {
        let mut state = self.pump.lock().expect("usb pump state poisoned");
        if state.in_queue.is_none() {
            state.in_queue = Some(self.interface.bulk_in_queue(self.in_endpoint));
        }
        state.in_len = len;
        let queue = state.in_queue.as_mut().expect("receive queue just created");
        for _ in 0..count {
            queue.submit(RequestBuffer::new(len));
        }
        Ok(())
    }

    fn handle_events(
        &self,
        budget: Duration,
        sink: &mut dyn CompletionSink,
    ) -> Result<(), UsbError> {
        let deadline = Instant::now() + budget;
        let mut state = self.pump.lock().expect("usb pump state poisoned");
        let PumpState {
            ctrl_rx,
            in_queue,
            in_len,
            out_pending,
        } = &mut *state;

        futures::executor::block_on(async {
            loop {
                let event = {
                    let in_next = match in_queue.as_mut() {
                        Some(queue) => Either::Left(queue.next_complete()),
                        None => Either::Right(future::pending()),
                    };
                    futures::select! {
                        msg = ctrl_rx.next() => PumpEvent::Ctrl(msg),
                        completion = in_next.fuse() => PumpEvent::In(completion),
                        done = out_pending.select_next_some() => PumpEvent::Out(done),
                    }
                };

                match event {
                    PumpEvent::Ctrl(Some(PumpMessage::Submit(fut))) => out_pending.push(fut),
                    // A wake (explicit or heartbeat) hands control back
                    // so the caller can re-check its stop condition.
                    PumpEvent::Ctrl(Some(PumpMessage::Wake)) | PumpEvent::Ctrl(None) => return,
                    PumpEvent::In(completion) => {
                        let status = Self::map_status(&completion.status);
                        sink.in_completed(&completion.data, status);
                        if let Some(queue) = in_queue.as_mut() {
                            queue.submit(RequestBuffer::reuse(completion.data, *in_len));
                        }
                    }
                    PumpEvent::Out(done) => {
                        let status = Self::map_status(&done.completion.status);
                        let actual_len = done.completion.data.actual_length();
                        sink.out_completed(OutCompletion {
                            data: done.completion.data.reuse(),
                            owner: done.owner,
                            status,
                            submitted_len: done.submitted_len,
                            actual_len,
                        });
                    }
                }

                if Instant::now() >= deadline {
                    return;
                }
            }
        });
        Ok(())
    }

    fn wake(&self) {
        let _ = self.ctrl_tx.unbounded_send(PumpMessage::Wake);
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Release);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}
