//! Logical unit record
//!
//! A logical unit is the SCSI-addressable virtual disk an initiator sees.
//! Exactly one backing store is attached to a unit for its lifetime; the
//! block-command processor consults the unit for geometry, write protection
//! and reservation state before delegating I/O to the backend.

use std::sync::Arc;

use crate::error::{ScsiError, ScsiResult};
use crate::event::EventSource;
use crate::mode::ModePages;
use crate::registry::{BackingStore, Registry};
use crate::sbc;

/// Identification and state attributes of a logical unit
#[derive(Debug, Clone)]
pub struct LuAttrs {
    pub vendor_id: String,
    pub product_id: String,
    pub product_rev: String,
    /// SCSI version descriptors reported in INQUIRY
    pub version_desc: [u16; 3],
    pub readonly: bool,
}

impl Default for LuAttrs {
    fn default() -> Self {
        LuAttrs {
            vendor_id: "ISCSI".to_string(),
            product_id: String::new(),
            product_rev: "0001".to_string(),
            version_desc: [0; 3],
            readonly: false,
        }
    }
}

/// A logical unit with its attached backing store
pub struct LogicalUnit {
    /// Capacity in bytes
    pub size: u64,
    /// log2 of the logical block size
    pub blk_shift: u32,
    pub attrs: LuAttrs,
    /// Block count and block size as reported in mode parameter headers
    pub mode_block_descriptor: [u8; 8],
    pub mode_pages: ModePages,
    /// RESERVE(6) holder, if any (initiator-target nexus id)
    reservation: Option<u64>,
    backend: Option<Box<dyn BackingStore>>,
}

impl LogicalUnit {
    /// Bare unit without a backend; the caller is expected to run
    /// [`sbc::lu_init`] before dispatching commands to it.
    pub fn new(size: u64, blk_shift: u32) -> Self {
        LogicalUnit {
            size,
            blk_shift,
            attrs: LuAttrs::default(),
            mode_block_descriptor: [0u8; 8],
            mode_pages: ModePages::default(),
            reservation: None,
            backend: None,
        }
    }

    /// Open a unit on the named backing store
    ///
    /// Creates the backend instance, runs its init and open steps, then
    /// initializes the unit's disk attributes and mode pages.
    pub fn open(
        registry: &Registry,
        backend_name: &str,
        locator: &str,
        ev: Arc<dyn EventSource>,
    ) -> ScsiResult<LogicalUnit> {
        let mut backend = registry.create(backend_name, ev)?;
        backend.init()?;
        let outcome = match backend.open(locator) {
            Ok(o) => o,
            Err(e) => {
                backend.exit();
                return Err(e);
            }
        };
        log::info!(
            "opened unit on {:?} backend: {} bytes, read_only={}",
            backend_name,
            outcome.capacity,
            outcome.read_only
        );

        let mut lu = LogicalUnit::new(outcome.capacity, 0);
        lu.attrs.readonly = outcome.read_only;
        sbc::lu_init(&mut lu);
        lu.backend = Some(backend);
        Ok(lu)
    }

    /// Close the backend and tear down its per-unit resources
    pub fn close(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            backend.exit();
        }
    }

    pub fn attach(&mut self, backend: Box<dyn BackingStore>) {
        self.backend = Some(backend);
    }

    pub fn backend(&self) -> ScsiResult<&dyn BackingStore> {
        self.backend
            .as_deref()
            .ok_or_else(|| ScsiError::Config("no backing store attached".to_string()))
    }

    pub fn block_size(&self) -> u32 {
        1 << self.blk_shift
    }

    /// Capacity in logical blocks
    pub fn block_count(&self) -> u64 {
        self.size >> self.blk_shift
    }

    /// Whether another initiator holds an exclusive reservation
    pub fn reserved_by_other(&self, itn_id: u64) -> bool {
        matches!(self.reservation, Some(holder) if holder != itn_id)
    }

    /// Take the reservation; fails if another initiator holds it
    pub fn reserve(&mut self, itn_id: u64) -> bool {
        match self.reservation {
            Some(holder) if holder != itn_id => false,
            _ => {
                self.reservation = Some(itn_id);
                true
            }
        }
    }

    /// Drop the reservation; fails if another initiator holds it
    pub fn release(&mut self, itn_id: u64) -> bool {
        match self.reservation {
            Some(holder) if holder != itn_id => false,
            _ => {
                self.reservation = None;
                true
            }
        }
    }
}

impl Drop for LogicalUnit {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_semantics() {
        let mut lu = LogicalUnit::new(1 << 20, 9);
        assert!(!lu.reserved_by_other(1));

        assert!(lu.reserve(1));
        assert!(lu.reserve(1)); // re-reserve by holder is fine
        assert!(!lu.reserve(2));
        assert!(lu.reserved_by_other(2));
        assert!(!lu.reserved_by_other(1));

        assert!(!lu.release(2));
        assert!(lu.release(1));
        assert!(lu.reserve(2));
    }

    #[test]
    fn test_geometry() {
        let lu = LogicalUnit::new(1 << 30, 9);
        assert_eq!(lu.block_size(), 512);
        assert_eq!(lu.block_count(), (1 << 30) / 512);
    }

    #[test]
    fn test_backend_missing() {
        let lu = LogicalUnit::new(1 << 20, 9);
        assert!(lu.backend().is_err());
    }
}
