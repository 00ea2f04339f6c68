//! SCSI block-command processor
//!
//! Validates disk commands per SBC, computes byte offset/length from the
//! CDB and the unit's block shift, and delegates I/O to the attached
//! backing store. Handlers return a SAM status synchronously; a GOOD return
//! with the command marked async-pending means the backend will finalize it
//! later through the completion bridge.

use byteorder::{BigEndian, ByteOrder};

use crate::command::CmdRef;
use crate::device::LogicalUnit;
use crate::mode;
use crate::registry::Submission;
use crate::scsi::{self, asc, opcode, sam_status, sense_key, SAI_READ_CAPACITY_16};

const DEFAULT_BLK_SHIFT: u32 = 9;

/// Route one command to its handler
pub fn dispatch(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    let op = cmd.opcode();
    log::debug!("dispatch opcode {:#04x}", op);
    match op {
        _ if scsi::is_read(op) || scsi::is_write(op) => sbc_rw(lu, cmd),
        _ if scsi::is_sync_cache(op) => sbc_sync_cache(lu, cmd),
        opcode::READ_CAPACITY_10 => sbc_read_capacity(lu, cmd),
        opcode::SERVICE_ACTION_IN_16 => sbc_service_action(lu, cmd),
        opcode::VERIFY_10 | opcode::VERIFY_12 | opcode::VERIFY_16 => sam_status::GOOD,
        opcode::RESERVE_6 => sbc_reserve(lu, cmd),
        opcode::RELEASE_6 => sbc_release(lu, cmd),
        opcode::MODE_SENSE_6 | opcode::MODE_SENSE_10 => sbc_mode_sense(lu, cmd),
        opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 => sbc_mode_select(lu, cmd),
        _ => {
            cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE, 0);
            sam_status::CHECK_CONDITION
        }
    }
}

fn check_condition(cmd: &CmdRef, key: u8, asc_code: u8) -> u8 {
    cmd.build_sense(key, asc_code, 0);
    sam_status::CHECK_CONDITION
}

/// READ/WRITE in the 6/10/12/16 forms
fn sbc_rw(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    let op = cmd.opcode();
    let cdb = cmd.cdb();

    if lu.reserved_by_other(cmd.itn_id()) {
        return sam_status::RESERVATION_CONFLICT;
    }

    // Protection-information bits are not supported on reads
    if scsi::is_read(op)
        && !matches!(op, opcode::READ_6)
        && cdb.len() > 1
        && cdb[1] & 0xe0 != 0
    {
        return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE);
    }

    if lu.attrs.readonly && scsi::is_write(op) {
        return check_condition(cmd, sense_key::DATA_PROTECT, asc::WRITE_PROTECT);
    }

    let (lba, count) = match (scsi::rw_lba(cdb), scsi::rw_count(cdb)) {
        (Some(lba), Some(count)) => (lba, count),
        _ => return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB),
    };

    if count == 0 {
        return sam_status::GOOD;
    }

    // Bounds are checked in block units so an oversized LBA from a 16-byte
    // CDB cannot overflow the byte-offset shift
    let blocks = lu.block_count();
    if lba >= blocks || count as u64 > blocks - lba {
        cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0);
        return sam_status::CHECK_CONDITION;
    }

    let off = lba << lu.blk_shift;
    let tl = (count as u64) << lu.blk_shift;

    if scsi::is_read(op) {
        cmd.alloc_in_buffer(tl as usize);
    } else if cmd.out_len() as u64 != tl {
        log::error!(
            "write payload {} bytes, transfer length {}",
            cmd.out_len(),
            tl
        );
        return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
    }

    cmd.set_offset(off);

    submit_to_backend(lu, cmd)
}

/// SYNCHRONIZE CACHE (10/16): validated here, a structural no-op in the
/// built-in backends
fn sbc_sync_cache(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    if lu.reserved_by_other(cmd.itn_id()) {
        return sam_status::RESERVATION_CONFLICT;
    }
    submit_to_backend(lu, cmd)
}

fn submit_to_backend(lu: &LogicalUnit, cmd: &CmdRef) -> u8 {
    let backend = match lu.backend() {
        Ok(b) => b,
        Err(e) => {
            log::error!("submit failed: {}", e);
            return check_condition(cmd, sense_key::HARDWARE_ERROR, asc::INTERNAL_TGT_FAILURE);
        }
    };
    match backend.submit(cmd) {
        Ok(Submission::Complete) | Ok(Submission::Pending) => sam_status::GOOD,
        Err(e) => {
            log::error!("{} submit failed: {}", backend.name(), e);
            cmd.set_offset(0);
            if !cmd.has_sense() {
                cmd.build_sense(sense_key::HARDWARE_ERROR, asc::INTERNAL_TGT_FAILURE, 0);
            }
            sam_status::CHECK_CONDITION
        }
    }
}

/// READ CAPACITY (10)
fn sbc_read_capacity(lu: &LogicalUnit, cmd: &CmdRef) -> u8 {
    let cdb = cmd.cdb();
    if cdb.len() < 10 {
        return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
    }
    // With PMI clear the logical block address field must be zero
    if cdb[8] & 0x1 == 0 && (cdb[2] | cdb[3] | cdb[4] | cdb[5]) != 0 {
        return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB);
    }

    if cmd.in_len() < 8 {
        // Graceful overflow: nothing to report into
        return sam_status::GOOD;
    }

    let blocks = lu.block_count();
    let last_lba = if blocks >> 32 != 0 {
        0xffff_ffff
    } else {
        blocks.saturating_sub(1) as u32
    };

    let mut data = [0u8; 8];
    BigEndian::write_u32(&mut data[0..4], last_lba);
    BigEndian::write_u32(&mut data[4..8], lu.block_size());
    cmd.fill_in_buffer(&data);
    sam_status::GOOD
}

/// SERVICE ACTION IN (16): READ CAPACITY 16
fn sbc_service_action(lu: &LogicalUnit, cmd: &CmdRef) -> u8 {
    let cdb = cmd.cdb();
    if cdb.len() < 16 || cdb[1] & 0x1f != SAI_READ_CAPACITY_16 {
        return check_condition(cmd, sense_key::ILLEGAL_REQUEST, asc::INVALID_OP_CODE);
    }

    if cmd.in_len() < 16 {
        return sam_status::GOOD;
    }

    let mut data = [0u8; 32];
    BigEndian::write_u64(&mut data[0..8], lu.block_count().saturating_sub(1));
    BigEndian::write_u32(&mut data[8..12], lu.block_size());
    cmd.fill_in_buffer(&data);
    sam_status::GOOD
}

fn sbc_reserve(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    if lu.reserve(cmd.itn_id()) {
        sam_status::GOOD
    } else {
        sam_status::RESERVATION_CONFLICT
    }
}

fn sbc_release(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    if lu.release(cmd.itn_id()) {
        sam_status::GOOD
    } else {
        sam_status::RESERVATION_CONFLICT
    }
}

fn sbc_mode_sense(lu: &LogicalUnit, cmd: &CmdRef) -> u8 {
    let ret = mode::mode_sense(lu, cmd);

    // A read-only unit reports the write-protect bit in the
    // device-specific parameter byte
    if lu.attrs.readonly && ret == sam_status::GOOD {
        let mode6 = cmd.opcode() == opcode::MODE_SENSE_6;
        cmd.with_in_buffer(|data| {
            let idx = if mode6 { 2 } else { 3 };
            if let Some(b) = data.get_mut(idx) {
                *b |= 0x80;
            }
        });
    }
    ret
}

fn sbc_mode_select(lu: &mut LogicalUnit, cmd: &CmdRef) -> u8 {
    mode::mode_select(lu, cmd, sbc_mode_page_update)
}

/// MODE SELECT page-update hook: only the caching page's WCE bit is writable
fn sbc_mode_page_update(lu: &mut LogicalUnit, page: &[u8], changed: &mut bool) -> bool {
    let pcode = page[0] & 0x3f;
    if pcode != 0x08 || page.len() < 3 {
        return false;
    }
    let Some(pg) = lu.mode_pages.get_mut(0x08) else {
        return false;
    };
    let old = pg.data[0];
    if page[2] & 0x4 != 0 {
        pg.data[0] |= 0x4;
    } else {
        pg.data[0] &= !0x4;
    }
    *changed = old != pg.data[0];
    true
}

/// Populate a unit's disk attributes, block descriptor and mode pages
pub fn lu_init(lu: &mut LogicalUnit) {
    if lu.blk_shift == 0 {
        lu.blk_shift = DEFAULT_BLK_SHIFT;
    }

    lu.attrs.product_id = "VIRTUAL-DISK".to_string();
    lu.attrs.version_desc = [
        0x04C0, // SBC-3 no version claimed
        0x0960, // iSCSI
        0x0300, // SPC-3
    ];

    let blocks = lu.block_count();
    let desc_blocks = if blocks >> 32 != 0 {
        0xffff_ffff
    } else {
        blocks as u32
    };
    let block_size = lu.block_size();
    BigEndian::write_u32(&mut lu.mode_block_descriptor[0..4], desc_blocks);
    BigEndian::write_u32(&mut lu.mode_block_descriptor[4..8], block_size);

    // Vendor unique page; most initiators ask for page 0
    lu.mode_pages.add(0x00, &[]);
    // Disconnect-reconnect page
    lu.mode_pages.add(
        0x02,
        &[0x80, 0x80, 0, 0xa, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    );
    // Caching page, write-cache-enable bit changeable
    lu.mode_pages.add(
        0x08,
        &[
            0x14, 0, 0xff, 0xff, 0, 0, 0xff, 0xff, 0xff, 0xff, 0x80, 0x14, 0, 0, 0, 0, 0, 0,
        ],
    );
    let mut mask = [0u8; 18];
    mask[0] = 0x4;
    lu.mode_pages.set_changeable_mask(0x08, &mask);
    // Control page
    lu.mode_pages.add(0x0a, &[2, 0x10, 0, 0, 0, 0, 0, 0, 2, 0]);
    // Informational exceptions control page
    lu.mode_pages.add(0x1c, &[8, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScsiCommand;
    use crate::error::{ScsiError, ScsiResult};
    use crate::registry::{BackingStore, OpenOutcome};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        submissions: Mutex<Vec<(u8, u64, usize)>>,
        fail_submit: bool,
    }

    impl BackingStore for RecordingStore {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn init(&mut self) -> ScsiResult<()> {
            Ok(())
        }
        fn open(&mut self, _locator: &str) -> ScsiResult<OpenOutcome> {
            Ok(OpenOutcome {
                capacity: 1 << 30,
                read_only: false,
            })
        }
        fn close(&mut self) {}
        fn exit(&mut self) {}
        fn submit(&self, cmd: &CmdRef) -> ScsiResult<Submission> {
            if self.fail_submit {
                return Err(ScsiError::Backend("forced failure".to_string()));
            }
            let len = if scsi::is_read(cmd.opcode()) {
                cmd.in_len()
            } else {
                cmd.out_len()
            };
            self.submissions
                .lock()
                .unwrap()
                .push((cmd.opcode(), cmd.offset(), len));
            Ok(Submission::Complete)
        }
    }

    fn test_lu(size: u64) -> LogicalUnit {
        let mut lu = LogicalUnit::new(size, 0);
        lu_init(&mut lu);
        lu.attach(Box::new(RecordingStore::default()));
        lu
    }

    fn read10_cdb(lba: u32, count: u16) -> [u8; 10] {
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_10;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], count);
        cdb
    }

    fn write10_cdb(lba: u32, count: u16) -> [u8; 10] {
        let mut cdb = read10_cdb(lba, count);
        cdb[0] = opcode::WRITE_10;
        cdb
    }

    #[test]
    fn test_read_offset_and_length() {
        let mut lu = test_lu(1 << 30);
        let cmd = ScsiCommand::new(&read10_cdb(100, 8), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        assert_eq!(cmd.offset(), 100 * 512);
        assert_eq!(cmd.in_len(), 8 * 512);
    }

    #[test]
    fn test_read_out_of_range() {
        let mut lu = test_lu(1 << 20); // 2048 blocks
        let cmd = ScsiCommand::new(&read10_cdb(2048, 1), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        let sense = cmd.sense().unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn test_last_block_read_in_range() {
        let mut lu = test_lu(1 << 20);
        let cmd = ScsiCommand::new(&read10_cdb(2047, 1), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
    }

    #[test]
    fn test_write_to_readonly_unit() {
        let mut lu = test_lu(1 << 20);
        lu.attrs.readonly = true;
        let cmd = ScsiCommand::new(&write10_cdb(0, 1), 1);
        cmd.set_out_data(&[0u8; 512]);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        let sense = cmd.sense().unwrap();
        assert_eq!(sense.sense_key, sense_key::DATA_PROTECT);
        assert_eq!(sense.asc, asc::WRITE_PROTECT);
        // Reads still work
        let cmd = ScsiCommand::new(&read10_cdb(0, 1), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
    }

    #[test]
    fn test_reservation_conflict_blocks_io() {
        let mut lu = test_lu(1 << 20);
        let reserve = ScsiCommand::new(&[opcode::RESERVE_6, 0, 0, 0, 0, 0], 1);
        assert_eq!(dispatch(&mut lu, &reserve), sam_status::GOOD);

        let other = ScsiCommand::new(&read10_cdb(0, 1), 2);
        assert_eq!(dispatch(&mut lu, &other), sam_status::RESERVATION_CONFLICT);

        let release = ScsiCommand::new(&[opcode::RELEASE_6, 0, 0, 0, 0, 0], 1);
        assert_eq!(dispatch(&mut lu, &release), sam_status::GOOD);
        let retry = ScsiCommand::new(&read10_cdb(0, 1), 2);
        assert_eq!(dispatch(&mut lu, &retry), sam_status::GOOD);
    }

    #[test]
    fn test_read_protection_bits_rejected() {
        let mut lu = test_lu(1 << 20);
        let mut cdb = read10_cdb(0, 1);
        cdb[1] = 0xe0;
        let cmd = ScsiCommand::new(&cdb, 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        assert_eq!(cmd.sense().unwrap().asc, asc::INVALID_OP_CODE);
    }

    #[test]
    fn test_zero_length_transfer() {
        let mut lu = test_lu(1 << 20);
        let cmd = ScsiCommand::new(&read10_cdb(0, 0), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        assert_eq!(cmd.in_len(), 0);
    }

    #[test]
    fn test_submit_failure_maps_to_hardware_error() {
        let mut lu = LogicalUnit::new(1 << 20, 0);
        lu_init(&mut lu);
        lu.attach(Box::new(RecordingStore {
            fail_submit: true,
            ..Default::default()
        }));
        let cmd = ScsiCommand::new(&read10_cdb(0, 1), 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        let sense = cmd.sense().unwrap();
        assert_eq!(sense.sense_key, sense_key::HARDWARE_ERROR);
        assert_eq!(sense.asc, asc::INTERNAL_TGT_FAILURE);
    }

    #[test]
    fn test_read_capacity_10() {
        let mut lu = test_lu(1 << 30);
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_CAPACITY_10;
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(8);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        let data = cmd.in_data();
        assert_eq!(BigEndian::read_u32(&data[0..4]), (1 << 21) - 1);
        assert_eq!(BigEndian::read_u32(&data[4..8]), 512);
    }

    #[test]
    fn test_read_capacity_10_saturates() {
        // 2^33 blocks of 512 bytes does not fit a 32-bit LBA
        let mut lu = test_lu(1u64 << 42);
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_CAPACITY_10;
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(8);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        let data = cmd.in_data();
        assert_eq!(BigEndian::read_u32(&data[0..4]), 0xffff_ffff);
    }

    #[test]
    fn test_read_capacity_10_zero_alloc_tolerated() {
        let mut lu = test_lu(1 << 30);
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_CAPACITY_10;
        let cmd = ScsiCommand::new(&cdb, 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        assert_eq!(cmd.in_actual(), 0);
    }

    #[test]
    fn test_read_capacity_10_pmi_field_check() {
        let mut lu = test_lu(1 << 30);
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_CAPACITY_10;
        cdb[2] = 1; // LBA field set while PMI clear
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(8);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        assert_eq!(cmd.sense().unwrap().asc, asc::INVALID_FIELD_IN_CDB);
    }

    #[test]
    fn test_read_capacity_16_exact() {
        let mut lu = test_lu(1u64 << 42);
        let mut cdb = [0u8; 16];
        cdb[0] = opcode::SERVICE_ACTION_IN_16;
        cdb[1] = SAI_READ_CAPACITY_16;
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(32);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        let data = cmd.in_data();
        assert_eq!(BigEndian::read_u64(&data[0..8]), (1u64 << 33) - 1);
        assert_eq!(BigEndian::read_u32(&data[8..12]), 512);
    }

    #[test]
    fn test_verify_always_good() {
        let mut lu = test_lu(1 << 20);
        let cmd = ScsiCommand::new(&[opcode::VERIFY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0], 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut lu = test_lu(1 << 20);
        let cmd = ScsiCommand::new(&[0xff, 0, 0, 0, 0, 0], 1);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        assert_eq!(cmd.sense().unwrap().asc, asc::INVALID_OP_CODE);
    }

    #[test]
    fn test_mode_sense_write_protect_bit() {
        let mut lu = test_lu(1 << 20);
        lu.attrs.readonly = true;
        let cdb = [opcode::MODE_SENSE_6, 0, 0x3f, 0, 255, 0];
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(255);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        let data = cmd.in_data();
        assert_ne!(data[2] & 0x80, 0);
    }

    #[test]
    fn test_mode_select_toggles_write_cache() {
        let mut lu = test_lu(1 << 20);
        assert_eq!(lu.mode_pages.get(0x08).unwrap().data[0] & 0x4, 0);

        // Header (4 bytes, no block descriptor) + caching page with WCE set
        let mut list = vec![0u8, 0, 0, 0];
        list.extend_from_slice(&[0x08, 18]);
        let mut pg = [0u8; 18];
        pg[0] = 0x4;
        list.extend_from_slice(&pg);

        let cdb = [opcode::MODE_SELECT_6, 0x10, 0, 0, list.len() as u8, 0];
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.set_out_data(&list);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        assert_ne!(lu.mode_pages.get(0x08).unwrap().data[0] & 0x4, 0);
    }

    #[test]
    fn test_mode_select_unknown_page_rejected() {
        let mut lu = test_lu(1 << 20);
        let mut list = vec![0u8, 0, 0, 0];
        list.extend_from_slice(&[0x02, 2, 0, 0]);
        let cdb = [opcode::MODE_SELECT_6, 0x10, 0, 0, list.len() as u8, 0];
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.set_out_data(&list);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::CHECK_CONDITION);
        assert_eq!(cmd.sense().unwrap().asc, asc::INVALID_FIELD_IN_PARMS);
    }

    #[test]
    fn test_mode_sense_caching_page_changeable_mask() {
        let mut lu = test_lu(1 << 20);
        // PC = 01b requests changeable values for the caching page
        let cdb = [opcode::MODE_SENSE_6, 0, 0x48, 0, 255, 0];
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.alloc_in_buffer(255);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        let data = cmd.in_data();
        // header(4) + block descriptor(8), then page code, length, WCE mask
        assert_eq!(data[12], 0x08);
        assert_eq!(data[13], 18);
        assert_eq!(data[14], 0x04);
    }

    #[test]
    fn test_lu_init_block_descriptor() {
        let mut lu = LogicalUnit::new(1 << 30, 0);
        lu_init(&mut lu);
        assert_eq!(lu.blk_shift, 9);
        assert_eq!(lu.attrs.product_id, "VIRTUAL-DISK");
        assert_eq!(
            BigEndian::read_u32(&lu.mode_block_descriptor[0..4]),
            1 << 21
        );
        assert_eq!(BigEndian::read_u32(&lu.mode_block_descriptor[4..8]), 512);
        for pcode in [0x00, 0x02, 0x08, 0x0a, 0x1c] {
            assert!(lu.mode_pages.get(pcode).is_some(), "page {:#x}", pcode);
        }
    }

    #[test]
    fn test_write6_offset() {
        let mut lu = test_lu(1 << 20);
        let cdb = [opcode::WRITE_6, 0, 0, 10, 2, 0];
        let cmd = ScsiCommand::new(&cdb, 1);
        cmd.set_out_data(&vec![0xab; 1024]);
        assert_eq!(dispatch(&mut lu, &cmd), sam_status::GOOD);
        assert_eq!(cmd.offset(), 10 * 512);
    }
}
