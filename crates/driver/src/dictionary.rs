//! Hand-level object dictionary entries.
//!
//! Wire addresses of the controller-wide data points, plus a helper that
//! registers the whole set against a handler. Per-joint entries are
//! assigned by the device façade layer on top of this crate; only the
//! hand-global addresses are fixed here.

use openhand_bulk_sdo_protocol::sdo::DataWidth;

use crate::handler::Handler;
use crate::storage::{Policy, StorageInfo};

/// A named dictionary entry.
#[derive(Debug, Clone, Copy)]
pub struct DictionaryEntry {
    /// Human-readable datum name.
    pub name: &'static str,
    /// Wire address and width.
    pub info: StorageInfo,
}

const fn plain(index: u16, sub_index: u8, size: DataWidth) -> StorageInfo {
    StorageInfo {
        index,
        sub_index,
        size,
        policy: Policy::NONE,
    }
}

/// Firmware version word (read-only).
pub const FIRMWARE_VERSION: StorageInfo = plain(0x5201, 1, DataWidth::U32);
/// Firmware build date (read-only).
pub const FIRMWARE_DATE: StorageInfo = plain(0x5201, 2, DataWidth::U32);
/// Controller uptime clock (read-only).
pub const SYSTEM_TIME: StorageInfo = plain(0x520A, 1, DataWidth::U32);
/// MCU die temperature, IEEE f32 (read-only).
pub const MCU_TEMPERATURE: StorageInfo = plain(0x520A, 9, DataWidth::U32);
/// Supply voltage, IEEE f32 (read-only).
pub const INPUT_VOLTAGE: StorageInfo = plain(0x520A, 10, DataWidth::U32);
/// PDO channel enable (write-only).
pub const PDO_ENABLED: StorageInfo = plain(0x52A0, 5, DataWidth::U8);
/// Transmit-PDO id the controller reports on (write-only).
pub const GLOBAL_TPDO_ID: StorageInfo = plain(0x52A4, 2, DataWidth::U16);
/// Joint feedback PDO interval in microseconds (write-only).
pub const JOINT_PDO_INTERVAL: StorageInfo = plain(0x52A4, 5, DataWidth::U32);

/// Every hand-level dictionary entry, in registration order.
pub const HAND_DICTIONARY: [DictionaryEntry; 8] = [
    DictionaryEntry {
        name: "firmware_version",
        info: FIRMWARE_VERSION,
    },
    DictionaryEntry {
        name: "firmware_date",
        info: FIRMWARE_DATE,
    },
    DictionaryEntry {
        name: "system_time",
        info: SYSTEM_TIME,
    },
    DictionaryEntry {
        name: "mcu_temperature",
        info: MCU_TEMPERATURE,
    },
    DictionaryEntry {
        name: "input_voltage",
        info: INPUT_VOLTAGE,
    },
    DictionaryEntry {
        name: "pdo_enabled",
        info: PDO_ENABLED,
    },
    DictionaryEntry {
        name: "global_tpdo_id",
        info: GLOBAL_TPDO_ID,
    },
    DictionaryEntry {
        name: "joint_pdo_interval",
        info: JOINT_PDO_INTERVAL,
    },
];

/// Register the hand-level dictionary starting at `first_storage_id`.
/// Returns the next free storage id.
pub fn register_hand_dictionary(handler: &Handler, first_storage_id: usize) -> usize {
    for (offset, entry) in HAND_DICTIONARY.iter().enumerate() {
        handler.init_storage_info(first_storage_id + offset, entry.info);
    }
    first_storage_id + HAND_DICTIONARY.len()
}
