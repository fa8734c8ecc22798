//! The storage table: the host-side mirror of the device's object
//! dictionary.
//!
//! Each addressable datum gets one [`StorageUnit`] holding its wire
//! address, the latest known raw value, a read version counter, and the
//! pending-operation word that drives the tick-thread state machine. The
//! three threads (façade, tick, event) synchronize exclusively through
//! the unit's atomics; there are no locks on the hot path.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use openhand_bulk_sdo_protocol::position::{from_raw_position, to_raw_position};
use openhand_bulk_sdo_protocol::sdo::DataWidth;

use crate::buffer8::Buffer8;

/// Completion callback: `(context, raw stored value)`.
pub type StorageCallback = fn(context: Buffer8, value: Buffer8);

/// Interpretation flags for a stored datum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy(u8);

impl Policy {
    /// No transformation; the host value is the wire value.
    pub const NONE: Policy = Policy(0);
    /// Host value is `f64` radians, wire value is a saturating int32
    /// position count.
    pub const POSITION_FLOATING: Policy = Policy(1 << 0);
    /// Negate on store and on load.
    pub const POSITION_REVERSED: Policy = Policy(1 << 1);

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: Policy) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Policy) -> Policy {
        Policy(self.0 | rhs.0)
    }
}

/// Fixed per-datum metadata, set once by `init_storage_info`.
#[derive(Debug, Clone, Copy)]
pub struct StorageInfo {
    /// 16-bit protocol object index.
    pub index: u16,
    /// 8-bit sub-field.
    pub sub_index: u8,
    /// Wire width.
    pub size: DataWidth,
    /// Host-side interpretation flags.
    pub policy: Policy,
}

/// What kind of operation is pending on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OperationMode {
    /// No pending work.
    None = 0,
    /// A read is in flight.
    Read = 1,
    /// A write is in flight.
    Write = 2,
}

/// Progress of the pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OperationState {
    /// Finished; the tick thread will fire the callback and clear the
    /// mode.
    Success = 0,
    /// Waiting for a read response.
    Reading = 1,
    /// Waiting for a write response.
    Writing = 2,
    /// Write acknowledged oddly; reading back to confirm.
    WritingConfirming = 3,
}

/// The `(mode, state)` pair packed into one 32-bit atomic word.
///
/// Invariant: `mode == None` exactly when `state == Success` and no
/// callback is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Pending operation kind.
    pub mode: OperationMode,
    /// Pending operation progress.
    pub state: OperationState,
}

impl Operation {
    /// The quiescent word: no pending work.
    pub const IDLE: Operation = Operation {
        mode: OperationMode::None,
        state: OperationState::Success,
    };

    fn to_bits(self) -> u32 {
        (self.mode as u32) | ((self.state as u32) << 16)
    }

    fn from_bits(bits: u32) -> Self {
        let mode = match bits as u16 {
            0 => OperationMode::None,
            1 => OperationMode::Read,
            2 => OperationMode::Write,
            other => unreachable!("corrupt operation mode {other}"),
        };
        let state = match (bits >> 16) as u16 {
            0 => OperationState::Success,
            1 => OperationState::Reading,
            2 => OperationState::Writing,
            3 => OperationState::WritingConfirming,
            other => unreachable!("corrupt operation state {other}"),
        };
        Operation { mode, state }
    }
}

/// One slot of the storage table.
///
/// `operation`, `version` and `value` are the cross-thread state. The
/// non-atomic fields follow the publication protocol of the reference
/// implementation: `info` is written once before any operation is armed
/// on the unit, and `callback`/`callback_context` are written by the
/// façade thread strictly before its release store of `operation`; the
/// tick thread reads them only after an acquire load observes that
/// store. The `Sync` impl below is sound under exactly that discipline,
/// which the `Handler` façade enforces (single operating thread, checked
/// unless explicitly disabled).
pub struct StorageUnit {
    info: UnsafeCell<StorageInfo>,
    operation: AtomicU32,
    version: AtomicU32,
    value: AtomicU64,
    callback: UnsafeCell<Option<StorageCallback>>,
    callback_context: UnsafeCell<Buffer8>,
}

unsafe impl Sync for StorageUnit {}

// One unit stays one cache-line-friendly 40-byte record.
const _: () = assert!(std::mem::size_of::<StorageUnit>() == 40);

impl StorageUnit {
    fn new() -> Self {
        Self {
            info: UnsafeCell::new(StorageInfo {
                index: 0,
                sub_index: 0,
                size: DataWidth::U8,
                policy: Policy::NONE,
            }),
            operation: AtomicU32::new(Operation::IDLE.to_bits()),
            version: AtomicU32::new(0),
            value: AtomicU64::new(0),
            callback: UnsafeCell::new(None),
            callback_context: UnsafeCell::new(Buffer8::ZERO),
        }
    }

    /// The unit's fixed metadata.
    pub fn info(&self) -> StorageInfo {
        // SAFETY: written only by `StorageTable::init` before any
        // operation touches the unit; reads afterwards see the final
        // value via the operation/index-map publication described above.
        unsafe { *self.info.get() }
    }

    pub(crate) fn load_operation(&self, order: Ordering) -> Operation {
        Operation::from_bits(self.operation.load(order))
    }

    pub(crate) fn store_operation(&self, operation: Operation, order: Ordering) {
        self.operation.store(operation.to_bits(), order);
    }

    /// Latest raw (wire-domain) value.
    pub(crate) fn load_value(&self) -> Buffer8 {
        Buffer8::from_bits(self.value.load(Ordering::Relaxed))
    }

    pub(crate) fn store_value(&self, value: Buffer8) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Read-completion counter; wraps around zero.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the version after a read success, skipping 0 so "never read"
    /// stays distinguishable.
    pub(crate) fn bump_version(&self) {
        let mut next = self.version.load(Ordering::Relaxed).wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.version.store(next, Ordering::Release);
    }

    /// Record the completion callback, then publish `operation`.
    ///
    /// The release store is what makes the callback cells visible to the
    /// tick thread's acquire load.
    pub(crate) fn arm(
        &self,
        callback: Option<StorageCallback>,
        context: Buffer8,
        operation: Operation,
    ) {
        // SAFETY: only the single operating thread writes these cells,
        // and only while `mode == None`, so neither the tick nor the
        // event thread is reading them concurrently.
        unsafe {
            *self.callback.get() = callback;
            *self.callback_context.get() = context;
        }
        self.store_operation(operation, Ordering::Release);
    }

    /// The armed callback and its context.
    pub(crate) fn callback(&self) -> (Option<StorageCallback>, Buffer8) {
        // SAFETY: called by the tick thread after an acquire load of
        // `operation` observed the arming release store; the façade does
        // not rewrite the cells until the operation completes.
        unsafe { (*self.callback.get(), *self.callback_context.get()) }
    }

    pub(crate) fn set_info(&self, info: StorageInfo) {
        // SAFETY: part of `init_storage_info`, which completes before
        // any operation is armed on this unit.
        unsafe { *self.info.get() = info }
    }
}

/// Store `data` into `unit` applying its policy transform.
pub(crate) fn store_data(unit: &StorageUnit, data: Buffer8) {
    let info = unit.info();
    if info.policy.contains(Policy::POSITION_FLOATING) {
        let mut raw = to_raw_position(data.as_f64());
        if info.policy.contains(Policy::POSITION_REVERSED) {
            raw = raw.saturating_neg();
        }
        unit.store_value(Buffer8::from_i32(raw));
    } else {
        unit.store_value(data);
    }
}

/// Load `unit`'s value applying the inverse policy transform.
pub(crate) fn load_data(unit: &StorageUnit) -> Buffer8 {
    let data = unit.load_value();
    let info = unit.info();
    if info.policy.contains(Policy::POSITION_FLOATING) {
        let mut angle = from_raw_position(data.as_i32());
        if info.policy.contains(Policy::POSITION_REVERSED) {
            angle = -angle;
        }
        Buffer8::from_f64(angle)
    } else {
        data
    }
}

/// The fixed-size array of storage units plus the wire-address map.
pub(crate) struct StorageTable {
    units: Box<[StorageUnit]>,
    /// `(index << 8 | sub_index)` to unit position. Built during
    /// `init_storage_info`, read-only once frames start flowing; the
    /// uncontended RwLock carries that publication.
    index_map: RwLock<BTreeMap<u32, usize>>,
}

impl StorageTable {
    pub(crate) fn new(unit_count: usize) -> Self {
        Self {
            units: (0..unit_count).map(|_| StorageUnit::new()).collect(),
            index_map: RwLock::new(BTreeMap::new()),
        }
    }

    fn key(index: u16, sub_index: u8) -> u32 {
        u32::from(index) << 8 | u32::from(sub_index)
    }

    pub(crate) fn init(&self, storage_id: usize, info: StorageInfo) {
        self.units[storage_id].set_info(info);
        self.index_map
            .write()
            .expect("storage index map poisoned")
            .insert(Self::key(info.index, info.sub_index), storage_id);
    }

    pub(crate) fn unit(&self, storage_id: usize) -> &StorageUnit {
        &self.units[storage_id]
    }

    pub(crate) fn lookup(&self, index: u16, sub_index: u8) -> Option<&StorageUnit> {
        let map = self.index_map.read().expect("storage index map poisoned");
        map.get(&Self::key(index, sub_index))
            .map(|&id| &self.units[id])
    }

    pub(crate) fn units(&self) -> impl Iterator<Item = &StorageUnit> {
        self.units.iter()
    }
}
