//! SCSI constants, sense data and CDB field parsing
//!
//! Status codes, sense keys and additional sense codes follow SAM-3/SPC-3.
//! CDB parsing covers the 6/10/12/16-byte read-write forms used by the
//! block-command processor.

use byteorder::{BigEndian, ByteOrder};

/// SAM status codes
pub mod sam_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_OP_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LUN_NOT_SUPPORTED: u8 = 0x25;
    pub const INVALID_FIELD_IN_PARMS: u8 = 0x26;
    pub const WRITE_PROTECT: u8 = 0x27;
    pub const INTERNAL_TGT_FAILURE: u8 = 0x44;
}

/// SCSI command opcodes handled by the block-command processor
pub mod opcode {
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0A;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const RESERVE_6: u8 = 0x16;
    pub const RELEASE_6: u8 = 0x17;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const VERIFY_10: u8 = 0x2F;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const VERIFY_16: u8 = 0x8F;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub const READ_12: u8 = 0xA8;
    pub const WRITE_12: u8 = 0xAA;
    pub const VERIFY_12: u8 = 0xAF;
}

/// SERVICE ACTION IN (16) service action for READ CAPACITY 16
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

/// Whether the opcode is a read in any of the 6/10/12/16 forms
pub fn is_read(op: u8) -> bool {
    matches!(
        op,
        opcode::READ_6 | opcode::READ_10 | opcode::READ_12 | opcode::READ_16
    )
}

/// Whether the opcode is a write in any of the 6/10/12/16 forms
pub fn is_write(op: u8) -> bool {
    matches!(
        op,
        opcode::WRITE_6 | opcode::WRITE_10 | opcode::WRITE_12 | opcode::WRITE_16
    )
}

/// Whether the opcode is SYNCHRONIZE CACHE (10 or 16)
pub fn is_sync_cache(op: u8) -> bool {
    matches!(
        op,
        opcode::SYNCHRONIZE_CACHE_10 | opcode::SYNCHRONIZE_CACHE_16
    )
}

/// Extract the starting logical block address from a read/write CDB
///
/// Supports the 6, 10, 12 and 16 byte forms. Returns `None` for a CDB
/// that is too short or not a read/write opcode.
pub fn rw_lba(cdb: &[u8]) -> Option<u64> {
    match *cdb.first()? {
        opcode::READ_6 | opcode::WRITE_6 => {
            if cdb.len() < 6 {
                return None;
            }
            Some(((cdb[1] as u64 & 0x1f) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64)
        }
        opcode::READ_10 | opcode::WRITE_10 => {
            if cdb.len() < 10 {
                return None;
            }
            Some(BigEndian::read_u32(&cdb[2..6]) as u64)
        }
        opcode::READ_12 | opcode::WRITE_12 => {
            if cdb.len() < 12 {
                return None;
            }
            Some(BigEndian::read_u32(&cdb[2..6]) as u64)
        }
        opcode::READ_16 | opcode::WRITE_16 => {
            if cdb.len() < 16 {
                return None;
            }
            Some(BigEndian::read_u64(&cdb[2..10]))
        }
        _ => None,
    }
}

/// Extract the transfer length in blocks from a read/write CDB
///
/// In the 6-byte form a length field of zero means 256 blocks.
pub fn rw_count(cdb: &[u8]) -> Option<u32> {
    match *cdb.first()? {
        opcode::READ_6 | opcode::WRITE_6 => {
            if cdb.len() < 6 {
                return None;
            }
            Some(if cdb[4] == 0 { 256 } else { cdb[4] as u32 })
        }
        opcode::READ_10 | opcode::WRITE_10 => {
            if cdb.len() < 10 {
                return None;
            }
            Some(BigEndian::read_u16(&cdb[7..9]) as u32)
        }
        opcode::READ_12 | opcode::WRITE_12 => {
            if cdb.len() < 12 {
                return None;
            }
            Some(BigEndian::read_u32(&cdb[6..10]))
        }
        opcode::READ_16 | opcode::WRITE_16 => {
            if cdb.len() < 16 {
                return None;
            }
            Some(BigEndian::read_u32(&cdb[10..14]))
        }
        _ => None,
    }
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw10_fields() {
        let cdb = [opcode::READ_10, 0, 0, 0, 0, 100, 0, 0, 10, 0];
        assert_eq!(rw_lba(&cdb), Some(100));
        assert_eq!(rw_count(&cdb), Some(10));
    }

    #[test]
    fn test_rw16_fields() {
        let mut cdb = [0u8; 16];
        cdb[0] = opcode::WRITE_16;
        BigEndian::write_u64(&mut cdb[2..10], 0x1_0000_0001);
        BigEndian::write_u32(&mut cdb[10..14], 16);
        assert_eq!(rw_lba(&cdb), Some(0x1_0000_0001));
        assert_eq!(rw_count(&cdb), Some(16));
    }

    #[test]
    fn test_rw6_fields() {
        // 21-bit LBA, zero length means 256 blocks
        let cdb = [opcode::READ_6, 0x1f, 0xff, 0xff, 0, 0];
        assert_eq!(rw_lba(&cdb), Some(0x1f_ffff));
        assert_eq!(rw_count(&cdb), Some(256));

        let cdb = [opcode::WRITE_6, 0, 0, 8, 4, 0];
        assert_eq!(rw_lba(&cdb), Some(8));
        assert_eq!(rw_count(&cdb), Some(4));
    }

    #[test]
    fn test_rw12_fields() {
        let mut cdb = [0u8; 12];
        cdb[0] = opcode::READ_12;
        BigEndian::write_u32(&mut cdb[2..6], 42);
        BigEndian::write_u32(&mut cdb[6..10], 7);
        assert_eq!(rw_lba(&cdb), Some(42));
        assert_eq!(rw_count(&cdb), Some(7));
    }

    #[test]
    fn test_short_cdb_rejected() {
        let cdb = [opcode::READ_10, 0, 0];
        assert_eq!(rw_lba(&cdb), None);
        assert_eq!(rw_count(&cdb), None);
    }

    #[test]
    fn test_non_rw_opcode_rejected() {
        let cdb = [opcode::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(rw_lba(&cdb), None);
    }

    #[test]
    fn test_sense_data_serialization() {
        let sense =
            SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(0x1234);
        let data = sense.to_bytes();
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70);
        assert_eq!(data[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(BigEndian::read_u32(&data[3..7]), 0x1234);
        assert_eq!(data[12], asc::LBA_OUT_OF_RANGE);
        assert_eq!(data[13], 0);
    }
}
