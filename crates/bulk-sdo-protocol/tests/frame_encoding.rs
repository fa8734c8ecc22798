//! Byte-exact images of complete outbound transfers.

use openhand_bulk_sdo_protocol::sdo::{self, SdoValue};
use openhand_bulk_sdo_protocol::{frame, pdo};

#[test]
fn sdo_read_transfer_image() {
    let mut transfer = Vec::new();
    frame::reset_prefill(&mut transfer);
    frame::set_frame_type(&mut transfer, frame::TYPE_SDO);

    let start = transfer.len();
    transfer.resize(start + sdo::READ_REQUEST_LEN, 0);
    sdo::encode_read_request(&mut transfer[start..], 0x6040, 0x01);

    let len = frame::finalize_frame(&mut transfer);
    assert_eq!(len, 16);
    assert_eq!(
        transfer,
        [
            0x55, 0xAA, 0x00, 0xA0, // magic, source, destination
            0x28, 0x00, // description: window 0xA0, 1 block
            0x21, 0x00, // type SDO, prefix
            0x30, 0x60, 0x40, 0x01, // read request
            0x00, 0x00, 0x00, 0x00, // padding + CRC tail
        ]
    );
}

#[test]
fn aggregated_sdo_transfer_shares_one_header() {
    let mut transfer = Vec::new();
    frame::reset_prefill(&mut transfer);
    frame::set_frame_type(&mut transfer, frame::TYPE_SDO);

    for sub_index in 1..=3u8 {
        let start = transfer.len();
        transfer.resize(start + sdo::READ_REQUEST_LEN, 0);
        sdo::encode_read_request(&mut transfer[start..], 0x5201, sub_index);
    }
    let start = transfer.len();
    let value = SdoValue::U32(0x0000_01F4);
    transfer.resize(start + sdo::write_request_len(value.width()), 0);
    sdo::encode_write_request(&mut transfer[start..], 0x52A4, 5, value);

    // 8 header + 3*4 reads + 8 write = 28 bytes; +2 CRC -> 2 blocks.
    let len = frame::finalize_frame(&mut transfer);
    assert_eq!(len, 32);
    assert_eq!(frame::frame_type(&transfer), frame::TYPE_SDO);
    let (_, compressed) = frame::unpack_description(u16::from_be_bytes([transfer[4], transfer[5]]));
    assert_eq!(compressed, 2);

    // Parsing our own request stream must stop at the padding.
    let payload = frame::payload(&transfer).unwrap();
    assert_eq!(payload[0], 0x30);
    assert_eq!(payload[12], 0x24);
}

#[test]
fn pdo_transfer_image_is_96_bytes() {
    let mut transfer = Vec::new();
    frame::reset_prefill(&mut transfer);
    frame::set_frame_type(&mut transfer, frame::TYPE_PDO_WRITE);

    let positions = [[0.0; pdo::JOINTS_PER_FINGER]; pdo::FINGER_COUNT];
    let start = transfer.len();
    transfer.resize(start + pdo::WRITE_LEN, 0);
    pdo::encode_control_positions(&mut transfer[start..], &positions, 42);

    // 8 header + 86 payload = 94; +2 CRC -> 6 blocks of 16.
    let len = frame::finalize_frame(&mut transfer);
    assert_eq!(len, 96);
    assert_eq!(frame::frame_type(&transfer), frame::TYPE_PDO_WRITE);
    assert_eq!(&transfer[8..10], &[0x01, 0x00]);
    assert_eq!(&transfer[90..94], &[0x00, 0x00, 0x00, 42]);
    assert!(transfer[94..].iter().all(|&b| b == 0));
}
