//! The protocol handler: public façade, tick-thread state machine, and
//! event-thread frame dispatch.
//!
//! A handler owns the whole driver core: the storage table, both
//! transmit pools, and the two background threads. Callers arm
//! asynchronous reads and writes against storage ids; the tick thread
//! turns pending operations into SDO frames at [`TICK_RATE_HZ`] and
//! fires completion callbacks; the event thread parses device responses
//! and advances the per-unit state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use openhand_bulk_sdo_protocol::sdo::{self, SdoResponse, SdoValue};
use openhand_bulk_sdo_protocol::{frame, pdo};
use tracing::{debug, error, warn};

use crate::buffer8::Buffer8;
use crate::storage::{
    self, Operation, OperationMode, OperationState, StorageCallback, StorageInfo, StorageTable,
};
use crate::transmit::{AsyncTransmitBuffer, MAX_TRANSMIT_LENGTH};
use crate::transport::nusb_backend::NusbTransport;
use crate::transport::{
    BulkUsb, CompletionSink, OutCompletion, TransferStatus, TransmitOwner, UsbError,
};

/// Tick-thread drive rate.
pub const TICK_RATE_HZ: f64 = 199.0;

/// How long the event thread blocks per pump call before re-checking its
/// stop flag.
const EVENT_BUDGET: Duration = Duration::from_millis(100);

/// Bound on the shutdown drain of outstanding transfers.
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// Handler construction parameters.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// USB vendor id to match.
    pub vendor_id: u16,
    /// USB product id to match.
    pub product_id: u16,
    /// Optional serial number; `None` matches the first device of the
    /// VID/PID.
    pub serial_number: Option<String>,
    /// Transfers pre-allocated per transmit pool (there are two pools).
    pub transmit_transfer_count: usize,
    /// Inbound transfers kept in flight.
    pub receive_transfer_count: usize,
    /// Number of storage units to allocate.
    pub storage_unit_count: usize,
}

impl HandlerConfig {
    /// Conventional pool sizes for a given device identity and
    /// dictionary size.
    pub fn new(vendor_id: u16, product_id: u16, storage_unit_count: usize) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number: None,
            transmit_transfer_count: 8,
            receive_transfer_count: 8,
            storage_unit_count,
        }
    }
}

/// Errors returned by handler operations.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// An operation was called from a thread other than the recorded
    /// operating thread.
    #[error(
        "thread safety violation: operations are bound to the first operating thread; \
         call disable_thread_safe_check() and serialize externally to use several threads"
    )]
    ThreadAffinityViolation,

    /// A checked operation found the unit busy.
    #[error("storage id {storage_id} already has a pending operation")]
    OperationPending {
        /// The busy unit.
        storage_id: usize,
    },

    /// Every transmit transfer is in flight.
    #[error("no free transmit buffer available")]
    NoFreeTransfer,

    /// A background thread could not be spawned.
    #[error("failed to spawn {name} thread")]
    ThreadSpawn {
        /// Thread name.
        name: &'static str,
        /// Spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// Transport-level failure.
    #[error(transparent)]
    Usb(#[from] UsbError),
}

enum Affinity {
    Unbound,
    Bound(ThreadId),
    Disabled,
}

struct Shared {
    storage: StorageTable,
    usb: Arc<dyn BulkUsb>,
    default_transmit_buffer: AsyncTransmitBuffer,
    tick_transmit_buffer: AsyncTransmitBuffer,
    stop_events: AtomicBool,
    stop_tick: AtomicBool,
}

/// The driver core.
///
/// Dropping a handler stops both background threads, waits up to one
/// second for outstanding USB transfers to drain, and logs anything that
/// leaked.
pub struct Handler {
    shared: Arc<Shared>,
    affinity: Mutex<Affinity>,
    event_thread: Option<JoinHandle<()>>,
    tick_thread: Option<JoinHandle<()>>,
}

impl Handler {
    /// Open the device described by `config` over nusb and start the
    /// driver core.
    pub fn open(config: HandlerConfig) -> Result<Self, HandlerError> {
        let transport = NusbTransport::open(
            config.vendor_id,
            config.product_id,
            config.serial_number.as_deref(),
        )?;
        Self::with_transport(Arc::new(transport), config)
    }

    /// Start the driver core on an already-open transport. This is the
    /// seam the test suite uses to run against a mock USB backend.
    pub fn with_transport(
        usb: Arc<dyn BulkUsb>,
        config: HandlerConfig,
    ) -> Result<Self, HandlerError> {
        let shared = Arc::new(Shared {
            storage: StorageTable::new(config.storage_unit_count),
            default_transmit_buffer: AsyncTransmitBuffer::new(
                Arc::clone(&usb),
                TransmitOwner::Default,
                config.transmit_transfer_count,
            ),
            tick_transmit_buffer: AsyncTransmitBuffer::new(
                Arc::clone(&usb),
                TransmitOwner::Tick,
                config.transmit_transfer_count,
            ),
            usb,
            stop_events: AtomicBool::new(false),
            stop_tick: AtomicBool::new(false),
        });

        shared
            .usb
            .start_receive_pool(config.receive_transfer_count, MAX_TRANSMIT_LENGTH)?;

        let event_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("openhand-events".into())
                .spawn(move || event_thread_main(&shared))
                .map_err(|source| HandlerError::ThreadSpawn {
                    name: "event",
                    source,
                })?
        };

        // The tick thread starts last: storage initialization must not
        // race an already-running scan.
        let tick_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("openhand-tick".into())
                .spawn(move || tick_thread_main(&shared))
                .map_err(|source| HandlerError::ThreadSpawn {
                    name: "tick",
                    source,
                })?
        };

        debug!(
            storage_units = config.storage_unit_count,
            transfers_per_pool = config.transmit_transfer_count,
            "protocol handler started"
        );

        Ok(Self {
            shared,
            affinity: Mutex::new(Affinity::Unbound),
            event_thread: Some(event_thread),
            tick_thread: Some(tick_thread),
        })
    }

    /// Describe one storage unit and register its wire address.
    ///
    /// Must be called once per storage id before any operation targets
    /// it. Panics if `storage_id` is out of range.
    pub fn init_storage_info(&self, storage_id: usize, info: StorageInfo) {
        self.shared.storage.init(storage_id, info);
    }

    /// Start a read without completion tracking. A pending operation on
    /// the unit makes this a no-op.
    pub fn read_async_unchecked(&self, storage_id: usize) -> Result<(), HandlerError> {
        self.check_operation_thread()?;

        let unit = self.shared.storage.unit(storage_id);
        if unit.load_operation(Ordering::Relaxed).mode != OperationMode::None {
            return Ok(());
        }
        unit.arm(
            None,
            Buffer8::ZERO,
            Operation {
                mode: OperationMode::Read,
                state: OperationState::Reading,
            },
        );
        Ok(())
    }

    /// Start a read and fire `callback(context, value)` from the tick
    /// thread once the value arrives.
    ///
    /// # Errors
    ///
    /// [`HandlerError::OperationPending`] when the unit is busy.
    pub fn read_async(
        &self,
        storage_id: usize,
        callback: StorageCallback,
        context: Buffer8,
    ) -> Result<(), HandlerError> {
        self.check_operation_thread()?;

        let unit = self.shared.storage.unit(storage_id);
        if unit.load_operation(Ordering::Relaxed).mode != OperationMode::None {
            return Err(HandlerError::OperationPending { storage_id });
        }
        unit.arm(
            Some(callback),
            context,
            Operation {
                mode: OperationMode::Read,
                state: OperationState::Reading,
            },
        );
        Ok(())
    }

    /// Store `data` and start a write if the unit is idle. When a write
    /// is already in flight only the stored value is updated, so the
    /// retry path picks up the newest value: an eventually-consistent
    /// latest-wins channel.
    pub fn write_async_unchecked(&self, data: Buffer8, storage_id: usize) -> Result<(), HandlerError> {
        self.check_operation_thread()?;

        let unit = self.shared.storage.unit(storage_id);
        storage::store_data(unit, data);

        if unit.load_operation(Ordering::Relaxed).mode != OperationMode::None {
            return Ok(());
        }
        unit.arm(
            None,
            Buffer8::ZERO,
            Operation {
                mode: OperationMode::Write,
                state: OperationState::Writing,
            },
        );
        Ok(())
    }

    /// Store `data`, start a write, and fire `callback` once the device
    /// confirmed it.
    ///
    /// # Errors
    ///
    /// [`HandlerError::OperationPending`] when the unit is busy.
    pub fn write_async(
        &self,
        data: Buffer8,
        storage_id: usize,
        callback: StorageCallback,
        context: Buffer8,
    ) -> Result<(), HandlerError> {
        self.check_operation_thread()?;

        let unit = self.shared.storage.unit(storage_id);
        if unit.load_operation(Ordering::Relaxed).mode != OperationMode::None {
            return Err(HandlerError::OperationPending { storage_id });
        }
        storage::store_data(unit, data);
        unit.arm(
            Some(callback),
            context,
            Operation {
                mode: OperationMode::Write,
                state: OperationState::Writing,
            },
        );
        Ok(())
    }

    /// Encode a coordinated joint-position burst and submit it
    /// immediately on the default transmit buffer.
    ///
    /// Angles are radians, finger-major; joint 0 of every finger but the
    /// thumb is negated on the wire.
    ///
    /// # Errors
    ///
    /// [`HandlerError::NoFreeTransfer`] when every transfer of the
    /// default pool is in flight.
    pub fn pdo_write_async_unchecked(
        &self,
        control_positions: &[[f64; pdo::JOINTS_PER_FINGER]; pdo::FINGER_COUNT],
        timestamp: u32,
    ) -> Result<(), HandlerError> {
        self.check_operation_thread()?;

        let out = fetch_pdo_buffer(&self.shared.default_transmit_buffer)
            .ok_or(HandlerError::NoFreeTransfer)?;
        pdo::encode_control_positions(out, control_positions, timestamp);

        self.shared.default_transmit_buffer.trigger_transmission();
        Ok(())
    }

    /// Force out whatever the default buffer currently holds. Returns
    /// whether a submission happened.
    pub fn trigger_transmission(&self) -> Result<bool, HandlerError> {
        self.check_operation_thread()?;
        Ok(self.shared.default_transmit_buffer.trigger_transmission())
    }

    /// Latest known value of a unit, transformed per its policy.
    pub fn get(&self, storage_id: usize) -> Buffer8 {
        storage::load_data(self.shared.storage.unit(storage_id))
    }

    /// Read-completion counter of a unit. Monotone modulo wrap and never
    /// 0 after the first successful read.
    pub fn version(&self, storage_id: usize) -> u32 {
        self.shared.storage.unit(storage_id).version()
    }

    /// Drop the operating-thread binding. Afterwards any thread may call
    /// operations, and the caller owns the serialization: exactly one
    /// thread may operate at a time.
    pub fn disable_thread_safe_check(&self) {
        *self.affinity.lock().expect("affinity mutex poisoned") = Affinity::Disabled;
    }

    fn check_operation_thread(&self) -> Result<(), HandlerError> {
        let mut affinity = self.affinity.lock().expect("affinity mutex poisoned");
        match *affinity {
            Affinity::Disabled => Ok(()),
            Affinity::Unbound => {
                *affinity = Affinity::Bound(thread::current().id());
                Ok(())
            }
            Affinity::Bound(id) if id == thread::current().id() => Ok(()),
            Affinity::Bound(_) => Err(HandlerError::ThreadAffinityViolation),
        }
    }

    fn drain_transmit_pools(&self) {
        const DRAIN_BUDGET: Duration = Duration::from_millis(50);

        let shared = &*self.shared;
        let total =
            shared.default_transmit_buffer.capacity() + shared.tick_transmit_buffer.capacity();
        let deadline = Instant::now() + DRAIN_DEADLINE;
        let mut sink = EventSink { shared };

        loop {
            let free =
                shared.default_transmit_buffer.free_len() + shared.tick_transmit_buffer.free_len();
            if free == total {
                return;
            }
            if Instant::now() >= deadline {
                error!(
                    "transmit transfers leaked at shutdown: {} still outstanding after {:?}",
                    total - free,
                    DRAIN_DEADLINE
                );
                return;
            }
            if let Err(e) = shared.usb.handle_events(DRAIN_BUDGET, &mut sink) {
                error!("event handling failed during shutdown drain: {e}");
                return;
            }
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.shared.stop_events.store(true, Ordering::Release);
        self.shared.usb.wake();
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }

        self.shared.stop_tick.store(true, Ordering::Release);
        if let Some(thread) = self.tick_thread.take() {
            let _ = thread.join();
        }

        self.drain_transmit_pools();
    }
}

// ── Frame assembly ──────────────────────────────────────────────────────

/// Claim `size` bytes inside an SDO transfer: the head transfer must be
/// blank (then stamped SDO) or already SDO and leave room for the frame
/// plus the CRC tail; anything else is flushed out first.
fn fetch_sdo_buffer(buffer: &AsyncTransmitBuffer, size: usize) -> Option<&mut [u8]> {
    buffer.try_fetch_buffer_with(
        |free_size, transfer| {
            if free_size < size + frame::CRC_LEN {
                return false;
            }
            match frame::frame_type(transfer) {
                frame::TYPE_BLANK => {
                    frame::set_frame_type(transfer, frame::TYPE_SDO);
                    true
                }
                frame::TYPE_SDO => true,
                _ => false,
            }
        },
        move |_| size,
    )
}

fn fetch_pdo_buffer(buffer: &AsyncTransmitBuffer) -> Option<&mut [u8]> {
    buffer.try_fetch_buffer_with(
        |free_size, transfer| {
            if free_size < pdo::WRITE_LEN + frame::CRC_LEN {
                return false;
            }
            match frame::frame_type(transfer) {
                frame::TYPE_BLANK => {
                    frame::set_frame_type(transfer, frame::TYPE_PDO_WRITE);
                    true
                }
                frame::TYPE_PDO_WRITE => true,
                _ => false,
            }
        },
        |_| pdo::WRITE_LEN,
    )
}

fn enqueue_read_request(buffer: &AsyncTransmitBuffer, index: u16, sub_index: u8) -> bool {
    match fetch_sdo_buffer(buffer, sdo::READ_REQUEST_LEN) {
        Some(out) => {
            sdo::encode_read_request(out, index, sub_index);
            true
        }
        None => false,
    }
}

fn enqueue_write_request(
    buffer: &AsyncTransmitBuffer,
    index: u16,
    sub_index: u8,
    value: SdoValue,
) -> bool {
    match fetch_sdo_buffer(buffer, sdo::write_request_len(value.width())) {
        Some(out) => {
            sdo::encode_write_request(out, index, sub_index, value);
            true
        }
        None => false,
    }
}

// ── Tick thread ─────────────────────────────────────────────────────────

fn tick_thread_main(shared: &Shared) {
    let period = Duration::from_secs_f64(1.0 / TICK_RATE_HZ);
    while !shared.stop_tick.load(Ordering::Acquire) {
        tick_once(shared);
        thread::sleep(period);
    }
}

fn tick_once(shared: &Shared) {
    for unit in shared.storage.units() {
        let mut operation = unit.load_operation(Ordering::Acquire);
        if operation.mode == OperationMode::None {
            continue;
        }

        match operation.state {
            OperationState::Success => {
                // Snapshot the callback before releasing the unit; once
                // the mode is cleared the operating thread may arm a new
                // operation and overwrite the cells.
                let (callback, context) = unit.callback();
                let value = unit.load_value();
                operation.mode = OperationMode::None;
                unit.store_operation(operation, Ordering::Relaxed);

                if let Some(callback) = callback {
                    callback(context, value);
                }
            }
            OperationState::Reading | OperationState::WritingConfirming => {
                let info = unit.info();
                if !enqueue_read_request(&shared.tick_transmit_buffer, info.index, info.sub_index) {
                    break; // pool exhausted; the next tick retries
                }
            }
            OperationState::Writing => {
                let info = unit.info();
                let value = SdoValue::from_u64(info.size, unit.load_value().as_u64());
                if !enqueue_write_request(
                    &shared.tick_transmit_buffer,
                    info.index,
                    info.sub_index,
                    value,
                ) {
                    break;
                }
            }
        }
    }
    shared.tick_transmit_buffer.trigger_transmission();
}

// ── Event thread ────────────────────────────────────────────────────────

fn event_thread_main(shared: &Shared) {
    let mut sink = EventSink { shared };
    while !shared.stop_events.load(Ordering::Acquire) {
        if let Err(e) = shared.usb.handle_events(EVENT_BUDGET, &mut sink) {
            error!("usb event handling failed: {e}; stopping event thread");
            break;
        }
    }
}

struct EventSink<'a> {
    shared: &'a Shared,
}

impl CompletionSink for EventSink<'_> {
    fn out_completed(&mut self, completion: OutCompletion) {
        if completion.status == TransferStatus::NoDevice {
            error!("usb device lost during transmission; terminating");
            std::process::abort();
        }
        if completion.status != TransferStatus::Completed {
            error!(
                "usb transmit error: transfer not completed, status {:?}",
                completion.status
            );
        } else if completion.actual_len != completion.submitted_len {
            error!(
                "usb transmit error: transmitted({}) != expected({})",
                completion.actual_len, completion.submitted_len
            );
        }

        let buffer = match completion.owner {
            TransmitOwner::Default => &self.shared.default_transmit_buffer,
            TransmitOwner::Tick => &self.shared.tick_transmit_buffer,
        };
        buffer.recycle(completion.data);
    }

    fn in_completed(&mut self, data: &[u8], status: TransferStatus) {
        if status == TransferStatus::NoDevice {
            error!("usb device lost while receiving; terminating");
            std::process::abort();
        }
        if status != TransferStatus::Completed {
            warn!("usb receive error: status {status:?}");
            return;
        }

        let Some(payload) = frame::payload(data) else {
            warn!("received runt frame of {} bytes", data.len());
            return;
        };
        if frame::frame_type(data) != frame::TYPE_SDO {
            return;
        }
        for response in sdo::parse_responses(payload) {
            if !self.apply_response(response) {
                break;
            }
        }
    }
}

impl EventSink<'_> {
    /// Apply one parsed response to the storage table. Returns `false`
    /// to drop the rest of the frame.
    fn apply_response(&mut self, response: SdoResponse) -> bool {
        match response {
            SdoResponse::ReadSuccess {
                index,
                sub_index,
                value,
            } => {
                let Some(unit) = self.shared.storage.lookup(index, sub_index) else {
                    return unknown_address(index, sub_index);
                };
                let mut operation = unit.load_operation(Ordering::Acquire);
                if operation.mode == OperationMode::None {
                    return true;
                }
                match operation.state {
                    OperationState::Reading => {
                        unit.store_value(Buffer8::from_u64(value.to_u64()));
                        unit.bump_version();
                        operation.state = OperationState::Success;
                        unit.store_operation(operation, Ordering::Release);
                    }
                    OperationState::WritingConfirming => {
                        let mask = value.width().mask();
                        let confirmed = value.to_u64() == unit.load_value().as_u64() & mask;
                        operation.state = if confirmed {
                            OperationState::Success
                        } else {
                            // The device holds a different value; go
                            // back and write again.
                            OperationState::Writing
                        };
                        unit.store_operation(operation, Ordering::Relaxed);
                    }
                    _ => {}
                }
                true
            }
            SdoResponse::WriteSuccess { index, sub_index } => {
                let Some(unit) = self.shared.storage.lookup(index, sub_index) else {
                    return unknown_address(index, sub_index);
                };
                let mut operation = unit.load_operation(Ordering::Acquire);
                if operation.mode != OperationMode::None
                    && operation.state == OperationState::Writing
                {
                    operation.state = OperationState::Success;
                    unit.store_operation(operation, Ordering::Relaxed);
                }
                true
            }
            SdoResponse::WriteError {
                index,
                sub_index,
                code,
            } => {
                let Some(unit) = self.shared.storage.lookup(index, sub_index) else {
                    return unknown_address(index, sub_index);
                };
                warn!(
                    "device rejected write to {index:#06x}:{sub_index} (code {code:#010x}); \
                     reading back to confirm"
                );
                let mut operation = unit.load_operation(Ordering::Acquire);
                if operation.mode != OperationMode::None
                    && operation.state == OperationState::Writing
                {
                    // The device may have applied the write despite the
                    // error; confirm by reading back.
                    operation.state = OperationState::WritingConfirming;
                    unit.store_operation(operation, Ordering::Relaxed);
                }
                true
            }
            SdoResponse::ReadError {
                index,
                sub_index,
                code,
            } => {
                if self.shared.storage.lookup(index, sub_index).is_none() {
                    return unknown_address(index, sub_index);
                }
                // State is left alone; the tick thread retries the read.
                warn!("device rejected read of {index:#06x}:{sub_index} (code {code:#010x})");
                true
            }
        }
    }
}

fn unknown_address(index: u16, sub_index: u8) -> bool {
    warn!("response for unknown object {index:#06x}:{sub_index}; dropping rest of frame");
    false
}
