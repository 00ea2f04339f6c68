//! Event-source interface boundary
//!
//! The target core does not own a reactor. Backends register descriptors and
//! readiness handlers with whatever event loop the host runs; the host calls
//! the handler from its reactor thread when the descriptor becomes readable
//! or errors. [`ManualEventSource`] is a minimal single-threaded dispatcher
//! for hosts (and tests) that drive readiness by hand.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::error::{ScsiError, ScsiResult};

/// Readiness interest mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(0x1);
    pub const ERROR: Interest = Interest(0x2);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Callback invoked on the reactor thread when a registered descriptor is ready
pub trait Readiness: Send + Sync {
    fn on_ready(&self, fd: RawFd, events: Interest);
}

/// The host reactor's registration surface
pub trait EventSource: Send + Sync {
    fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn Readiness>,
    ) -> ScsiResult<()>;

    fn deregister(&self, fd: RawFd) -> ScsiResult<()>;
}

/// Hand-driven event source
///
/// Registration records the handler; [`ManualEventSource::dispatch`] invokes
/// it as the host reactor would. Handlers may re-register or deregister
/// descriptors from within a dispatch (the reconnect path does exactly that).
#[derive(Default)]
pub struct ManualEventSource {
    handlers: Mutex<HashMap<RawFd, (Interest, Arc<dyn Readiness>)>>,
}

impl ManualEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualEventSource::default())
    }

    /// Descriptors currently registered
    pub fn registered_fds(&self) -> Vec<RawFd> {
        self.handlers.lock().unwrap().keys().copied().collect()
    }

    /// Invoke the handler registered for `fd`, if any
    ///
    /// Returns whether a handler was found. The handler runs outside the
    /// registration lock so it can deregister and re-register freely.
    pub fn dispatch(&self, fd: RawFd, events: Interest) -> bool {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&fd).map(|(_, h)| h.clone())
        };
        match handler {
            Some(h) => {
                h.on_ready(fd, events);
                true
            }
            None => false,
        }
    }
}

impl EventSource for ManualEventSource {
    fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn Readiness>,
    ) -> ScsiResult<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&fd) {
            return Err(ScsiError::Config(format!(
                "descriptor {} already registered",
                fd
            )));
        }
        handlers.insert(fd, (interest, handler));
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> ScsiResult<()> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.remove(&fd).is_none() {
            return Err(ScsiError::Config(format!(
                "descriptor {} not registered",
                fd
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl Readiness for Counter {
        fn on_ready(&self, _fd: RawFd, _events: Interest) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_register_dispatch_deregister() {
        let ev = ManualEventSource::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        ev.register(7, Interest::READABLE, counter.clone()).unwrap();
        assert!(ev.dispatch(7, Interest::READABLE));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        ev.deregister(7).unwrap();
        assert!(!ev.dispatch(7, Interest::READABLE));
        assert!(ev.deregister(7).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let ev = ManualEventSource::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        ev.register(3, Interest::READABLE, counter.clone()).unwrap();
        assert!(ev
            .register(3, Interest::READABLE | Interest::ERROR, counter)
            .is_err());
    }

    #[test]
    fn test_interest_mask() {
        let both = Interest::READABLE | Interest::ERROR;
        assert!(both.contains(Interest::READABLE));
        assert!(both.contains(Interest::ERROR));
        assert!(!Interest::READABLE.contains(Interest::ERROR));
    }
}
