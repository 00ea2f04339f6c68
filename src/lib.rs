//! I/O execution core for a SCSI block-device target
//!
//! This library implements the path a block command travels between a target
//! front end and real storage: the SBC command processor validates CDBs and
//! computes byte offsets, a backing store executes the transfer, and the
//! completion bridge finalizes each command exactly once with SAM status and
//! sense data.
//!
//! Two backing stores are built in: a remote NBD-style client (`"nbd"`) and
//! a local-file worker pool (`"aio"`). Both complete asynchronously through
//! descriptors registered with the host's event loop; the host only needs to
//! implement [`EventSource`] over its reactor.
//!
//! # Example
//!
//! ```no_run
//! use scsi_target_core::{
//!     sbc, Interest, LogicalUnit, ManualEventSource, Registry, ScsiCommand,
//! };
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ev = ManualEventSource::new();
//! let registry = Registry::with_defaults();
//! let mut lu = LogicalUnit::open(&registry, "aio", "/var/lib/disks/disk1.img", ev.clone())?;
//!
//! // READ(10) of one block at LBA 0
//! let cmd = ScsiCommand::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0], 1);
//! sbc::dispatch(&mut lu, &cmd);
//!
//! // The host reactor drives completions; here we poll by hand
//! while !cmd.is_done() {
//!     for fd in ev.registered_fds() {
//!         ev.dispatch(fd, Interest::READABLE);
//!     }
//!     std::thread::sleep(Duration::from_millis(1));
//! }
//! # Ok(())
//! # }
//! ```

pub mod bs_aio;
pub mod bs_nbd;
pub mod command;
pub mod device;
pub mod error;
pub mod event;
pub mod mode;
pub mod registry;
pub mod sbc;
pub mod scsi;

pub use command::{CmdRef, ScsiCommand};
pub use device::{LogicalUnit, LuAttrs};
pub use error::{ScsiError, ScsiResult};
pub use event::{EventSource, Interest, ManualEventSource, Readiness};
pub use registry::{BackingStore, OpenOutcome, Registry, Submission};
pub use scsi::SenseData;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
