//! Mode parameter pages and the MODE SENSE / MODE SELECT engine
//!
//! Pages are stored as the raw mode data that follows the two-byte page
//! header on the wire. Each page may carry a changeable-bits mask reported
//! when the initiator asks for changeable values (PC = 01b).

use byteorder::{BigEndian, ByteOrder};

use crate::command::CmdRef;
use crate::device::LogicalUnit;
use crate::scsi::{asc, opcode, sam_status, sense_key};

/// One stored mode page
#[derive(Debug, Clone)]
pub struct ModePage {
    pub pcode: u8,
    /// Mode data after the page code and length bytes
    pub data: Vec<u8>,
    /// Changeable-bits mask, same length as `data`, all-zero when absent
    pub changeable: Vec<u8>,
}

/// Per-unit mode page store, in installation order
#[derive(Debug, Default)]
pub struct ModePages {
    pages: Vec<ModePage>,
}

impl ModePages {
    pub fn add(&mut self, pcode: u8, data: &[u8]) {
        self.pages.push(ModePage {
            pcode,
            data: data.to_vec(),
            changeable: vec![0u8; data.len()],
        });
    }

    pub fn get(&self, pcode: u8) -> Option<&ModePage> {
        self.pages.iter().find(|p| p.pcode == pcode)
    }

    pub fn get_mut(&mut self, pcode: u8) -> Option<&mut ModePage> {
        self.pages.iter_mut().find(|p| p.pcode == pcode)
    }

    pub fn set_changeable_mask(&mut self, pcode: u8, mask: &[u8]) {
        if let Some(page) = self.get_mut(pcode) {
            let n = mask.len().min(page.data.len());
            page.changeable[..n].copy_from_slice(&mask[..n]);
        }
    }

    fn iter(&self) -> impl Iterator<Item = &ModePage> {
        self.pages.iter()
    }
}

/// Hook invoked per page during MODE SELECT
///
/// `page` is the full wire page (code, length, data). The hook applies the
/// change to the unit's stored page, sets `changed` when the stored data
/// actually differs afterwards, and returns whether the page was handled.
pub type PageUpdateFn = fn(lu: &mut LogicalUnit, page: &[u8], changed: &mut bool) -> bool;

fn serialize_page(page: &ModePage, changeable: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + page.data.len());
    out.push(page.pcode);
    out.push(page.data.len() as u8);
    if changeable {
        out.extend_from_slice(&page.changeable);
    } else {
        out.extend_from_slice(&page.data);
    }
    out
}

/// Build a MODE SENSE (6/10) response into the command's in buffer
pub fn mode_sense(lu: &LogicalUnit, cmd: &CmdRef) -> u8 {
    let cdb = cmd.cdb();
    let mode6 = cmd.opcode() == opcode::MODE_SENSE_6;
    let min_len = if mode6 { 6 } else { 10 };
    if cdb.len() < min_len {
        cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0);
        return sam_status::CHECK_CONDITION;
    }

    let dbd = cdb[1] & 0x08 != 0;
    let pc = cdb[2] >> 6;
    let pcode = cdb[2] & 0x3f;
    let alloc_len = if mode6 {
        cdb[4] as usize
    } else {
        BigEndian::read_u16(&cdb[7..9]) as usize
    };
    let changeable = pc == 1;

    let mut pages = Vec::new();
    if pcode == 0x3f {
        for page in lu.mode_pages.iter() {
            pages.extend_from_slice(&serialize_page(page, changeable));
        }
    } else {
        match lu.mode_pages.get(pcode) {
            Some(page) => pages.extend_from_slice(&serialize_page(page, changeable)),
            None => {
                cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0);
                return sam_status::CHECK_CONDITION;
            }
        }
    }

    let bd = if dbd {
        &[][..]
    } else {
        &lu.mode_block_descriptor[..]
    };

    let mut data = Vec::new();
    if mode6 {
        data.push(0); // mode data length, fixed up below
        data.push(0); // medium type
        data.push(0); // device-specific parameter
        data.push(bd.len() as u8);
        data.extend_from_slice(bd);
        data.extend_from_slice(&pages);
        data[0] = (data.len() - 1) as u8;
    } else {
        data.extend_from_slice(&[0u8; 8]);
        BigEndian::write_u16(&mut data[6..8], bd.len() as u16);
        data.extend_from_slice(bd);
        data.extend_from_slice(&pages);
        let total = (data.len() - 2) as u16;
        BigEndian::write_u16(&mut data[0..2], total);
    }

    data.truncate(alloc_len);
    cmd.fill_in_buffer(&data);
    sam_status::GOOD
}

/// Apply a MODE SELECT (6/10) parameter list from the command's out buffer
pub fn mode_select(lu: &mut LogicalUnit, cmd: &CmdRef, update: PageUpdateFn) -> u8 {
    let mode6 = cmd.opcode() == opcode::MODE_SELECT_6;
    let list = cmd.with_out_buffer(|b| b.to_vec());

    let hdr_len = if mode6 { 4 } else { 8 };
    if list.len() < hdr_len {
        cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARMS, 0);
        return sam_status::CHECK_CONDITION;
    }
    let bd_len = if mode6 {
        list[3] as usize
    } else {
        BigEndian::read_u16(&list[6..8]) as usize
    };

    let mut pos = hdr_len + bd_len;
    let mut any_changed = false;
    while pos + 2 <= list.len() {
        let page_len = 2 + list[pos + 1] as usize;
        if pos + page_len > list.len() {
            cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARMS, 0);
            return sam_status::CHECK_CONDITION;
        }
        let page = &list[pos..pos + page_len];
        let mut changed = false;
        if !update(lu, page, &mut changed) {
            cmd.build_sense(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARMS, 0);
            return sam_status::CHECK_CONDITION;
        }
        any_changed |= changed;
        pos += page_len;
    }

    if any_changed {
        log::debug!("mode select changed page data");
    }
    sam_status::GOOD
}
