//! SCSI command record and completion bridge
//!
//! A [`ScsiCommand`] is created by the host for each command it dispatches
//! and shared with the attached backend for the lifetime of the operation.
//! Backends that complete asynchronously hold a [`CmdRef`] clone; the
//! completion bridge guarantees the command is finalized exactly once no
//! matter which thread reports the outcome.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::scsi::SenseData;

/// Shared reference to an in-flight SCSI command
pub type CmdRef = Arc<ScsiCommand>;

struct Xfer {
    /// Device-to-initiator buffer, sized to the expected transfer
    in_buf: Vec<u8>,
    /// Bytes of `in_buf` actually filled by the handler or backend
    in_actual: usize,
    /// Initiator-to-device payload
    out_buf: Vec<u8>,
}

struct CmdState {
    status: u8,
    sense: Option<SenseData>,
    pending: bool,
    done: bool,
}

/// A SCSI command in flight through the block-command processor
pub struct ScsiCommand {
    cdb: Vec<u8>,
    /// Initiator-target nexus identifier, used for reservation checks
    itn_id: u64,
    /// Byte offset computed by the processor before backend submission
    offset: Mutex<u64>,
    xfer: Mutex<Xfer>,
    state: Mutex<CmdState>,
    done_cv: Condvar,
}

impl ScsiCommand {
    pub fn new(cdb: &[u8], itn_id: u64) -> CmdRef {
        Arc::new(ScsiCommand {
            cdb: cdb.to_vec(),
            itn_id,
            offset: Mutex::new(0),
            xfer: Mutex::new(Xfer {
                in_buf: Vec::new(),
                in_actual: 0,
                out_buf: Vec::new(),
            }),
            state: Mutex::new(CmdState {
                status: 0,
                sense: None,
                pending: false,
                done: false,
            }),
            done_cv: Condvar::new(),
        })
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn itn_id(&self) -> u64 {
        self.itn_id
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock().unwrap()
    }

    pub fn set_offset(&self, off: u64) {
        *self.offset.lock().unwrap() = off;
    }

    /// Size the device-to-initiator buffer for the expected transfer
    pub fn alloc_in_buffer(&self, len: usize) {
        let mut xfer = self.xfer.lock().unwrap();
        xfer.in_buf = vec![0u8; len];
        xfer.in_actual = 0;
    }

    /// Attach the initiator-to-device payload
    pub fn set_out_data(&self, data: &[u8]) {
        self.xfer.lock().unwrap().out_buf = data.to_vec();
    }

    pub fn in_len(&self) -> usize {
        self.xfer.lock().unwrap().in_buf.len()
    }

    pub fn out_len(&self) -> usize {
        self.xfer.lock().unwrap().out_buf.len()
    }

    /// Bytes of the in buffer actually produced
    pub fn in_actual(&self) -> usize {
        self.xfer.lock().unwrap().in_actual
    }

    pub fn set_in_actual(&self, n: usize) {
        self.xfer.lock().unwrap().in_actual = n;
    }

    /// Run `f` with mutable access to the device-to-initiator buffer
    pub fn with_in_buffer<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut xfer = self.xfer.lock().unwrap();
        f(&mut xfer.in_buf)
    }

    /// Run `f` with the initiator-to-device payload
    pub fn with_out_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let xfer = self.xfer.lock().unwrap();
        f(&xfer.out_buf)
    }

    /// Copy `data` into the in buffer, truncating to its size
    ///
    /// Returns the number of bytes copied, which is also recorded as the
    /// actual transfer length.
    pub fn fill_in_buffer(&self, data: &[u8]) -> usize {
        let mut xfer = self.xfer.lock().unwrap();
        let n = data.len().min(xfer.in_buf.len());
        xfer.in_buf[..n].copy_from_slice(&data[..n]);
        xfer.in_actual = n;
        n
    }

    /// Snapshot of the filled portion of the in buffer
    pub fn in_data(&self) -> Vec<u8> {
        let xfer = self.xfer.lock().unwrap();
        let n = xfer.in_actual.min(xfer.in_buf.len());
        xfer.in_buf[..n].to_vec()
    }

    // --- completion bridge ---

    /// Mark the command as having an asynchronous backend operation outstanding
    pub fn mark_pending(&self) {
        self.state.lock().unwrap().pending = true;
    }

    /// Clear the asynchronous-pending flag without finalizing
    pub fn clear_pending(&self) {
        self.state.lock().unwrap().pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending
    }

    /// Attach sense data ahead of a check-condition completion
    pub fn build_sense(&self, key: u8, asc: u8, ascq: u8) {
        self.state.lock().unwrap().sense = Some(SenseData::new(key, asc, ascq));
    }

    pub fn sense(&self) -> Option<SenseData> {
        self.state.lock().unwrap().sense.clone()
    }

    /// Whether sense data has already been attached
    pub fn has_sense(&self) -> bool {
        self.state.lock().unwrap().sense.is_some()
    }

    /// Finalize the command with a SAM status, exactly once
    ///
    /// A second call is a bug in the caller; it is logged and ignored so a
    /// misbehaving completion path cannot complete a command twice.
    pub fn io_done(&self, status: u8) {
        let mut state = self.state.lock().unwrap();
        if state.done {
            log::warn!(
                "duplicate completion for opcode {:#04x} ignored (status {:#04x})",
                self.opcode(),
                status
            );
            return;
        }
        state.done = true;
        state.pending = false;
        state.status = status;
        drop(state);
        self.done_cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Final SAM status, if the command has been finalized
    pub fn status(&self) -> Option<u8> {
        let state = self.state.lock().unwrap();
        if state.done {
            Some(state.status)
        } else {
            None
        }
    }

    /// Block until the command is finalized or the timeout elapses
    pub fn wait_done(&self, timeout: Duration) -> Option<u8> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .done_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        Some(state.status)
    }
}

impl std::fmt::Debug for ScsiCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ScsiCommand")
            .field("opcode", &self.opcode())
            .field("itn_id", &self.itn_id)
            .field("pending", &state.pending)
            .field("done", &state.done)
            .field("status", &state.status)
            .finish()
    }
}
