//! Backing-store contract and registry
//!
//! A backing store turns offset/length I/O requests from the block-command
//! processor into real storage operations. One instance is attached to a
//! logical unit for its lifetime. The registry is constructed explicitly at
//! startup, is immutable afterwards, and maps backend names to constructors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::CmdRef;
use crate::error::{ScsiError, ScsiResult};
use crate::event::EventSource;

/// What a successful open yields
#[derive(Debug, Clone, Copy)]
pub struct OpenOutcome {
    /// Device capacity in bytes
    pub capacity: u64,
    /// Whether the unit must be treated as write-protected
    pub read_only: bool,
}

/// How a submission completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The operation finished synchronously with GOOD status
    Complete,
    /// The operation is in flight; the command was marked async-pending and
    /// will be finalized through the completion bridge
    Pending,
}

/// Operations every backing store implements
///
/// `submit` must never panic across the boundary: it either returns a
/// synchronous outcome or schedules exactly one future finalize for the
/// command. An `Err` is the synchronous failure path; the backend may attach
/// sense data before returning it.
pub trait BackingStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time per-unit setup (doorbell channels, worker pools)
    fn init(&mut self) -> ScsiResult<()>;

    /// Open the backing device named by `locator`
    fn open(&mut self, locator: &str) -> ScsiResult<OpenOutcome>;

    /// Release the backing device
    fn close(&mut self);

    /// Tear down per-unit resources created by `init`
    fn exit(&mut self);

    /// Issue a validated read/write/sync-cache command
    fn submit(&self, cmd: &CmdRef) -> ScsiResult<Submission>;
}

/// Constructor for a backend instance bound to the host event source
pub type BackendCtor = fn(Arc<dyn EventSource>) -> Box<dyn BackingStore>;

/// Name-to-constructor table, built once at startup
pub struct Registry {
    table: HashMap<&'static str, BackendCtor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            table: HashMap::new(),
        }
    }

    /// Registry with the built-in backends: `"nbd"` and `"aio"`
    pub fn with_defaults() -> Self {
        let mut r = Registry::new();
        r.register("nbd", crate::bs_nbd::NbdBackend::create)
            .expect("default registry");
        r.register("aio", crate::bs_aio::AioBackend::create)
            .expect("default registry");
        r
    }

    /// Add a backend; a duplicate name is a startup configuration error
    pub fn register(&mut self, name: &'static str, ctor: BackendCtor) -> ScsiResult<()> {
        if self.table.contains_key(name) {
            return Err(ScsiError::Config(format!(
                "backing store {:?} registered twice",
                name
            )));
        }
        log::debug!("registered backing store {:?}", name);
        self.table.insert(name, ctor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<BackendCtor> {
        self.table.get(name).copied()
    }

    /// Construct a backend instance for a logical unit
    pub fn create(
        &self,
        name: &str,
        ev: Arc<dyn EventSource>,
    ) -> ScsiResult<Box<dyn BackingStore>> {
        let ctor = self
            .lookup(name)
            .ok_or_else(|| ScsiError::Config(format!("unknown backing store {:?}", name)))?;
        Ok(ctor(ev))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let r = Registry::with_defaults();
        assert!(r.lookup("nbd").is_some());
        assert!(r.lookup("aio").is_some());
        assert!(r.lookup("rbd").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut r = Registry::with_defaults();
        let err = r.register("nbd", crate::bs_nbd::NbdBackend::create);
        assert!(matches!(err, Err(ScsiError::Config(_))));
    }

    #[test]
    fn test_create_unknown_fails() {
        let r = Registry::with_defaults();
        let ev = crate::event::ManualEventSource::new();
        assert!(r.create("missing", ev).is_err());
    }
}
