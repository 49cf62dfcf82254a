// vim: tw=80
//! The I/O request object that flows through the pool core.

use std::sync::{Arc, Condvar, Mutex};

use bitfield::bitfield;

use crate::{
    types::{Error, Result},
    vdev::VdevId,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZioType {
    Read,
    Write,
    Flush,
    Trim,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZioPriority {
    SyncRead,
    SyncWrite,
    AsyncRead,
    AsyncWrite,
    Scrub,
    Trim,
}

bitfield! {
    /// Request flags, packed the way they travel with the request
    #[derive(Clone, Copy)]
    pub struct ZioFlags(u32);
    impl Debug;
    pub failfast, set_failfast: 0;
    pub scan_thread, set_scan_thread: 1;
    pub raw, set_raw: 2;
    pub canfail, set_canfail: 3;
    pub resilver, set_resilver: 4;
    pub io_retry, set_io_retry: 5;
    pub speculative, set_speculative: 6;
    /// Secure-erase rather than plain discard, for trim requests
    pub secure, set_secure: 7;
}

impl Default for ZioFlags {
    fn default() -> Self {
        ZioFlags(0)
    }
}

/// A data buffer shared between a request's issuer and its completion
#[derive(Clone, Debug)]
pub struct Abd(Arc<Mutex<Vec<u8>>>);

impl Abd {
    pub fn alloc(len: usize) -> Self {
        Abd(Arc::new(Mutex::new(vec![0u8; len])))
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        Abd(Arc::new(Mutex::new(v)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        f(&self.0.lock().unwrap())
    }

    pub fn with_mut<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        f(&mut self.0.lock().unwrap())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

/// What the caller of `io_start` should do next
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZioControl {
    /// The request was completed (or failed) inline; advance the pipeline
    Continue,
    /// The request was taken; `interrupt` will fire on completion
    Stop,
}

#[derive(Debug, Default)]
struct WaiterCore {
    done: bool,
    error: Option<Error>,
}

/// Completion handle, shared between the request and anyone waiting on it
#[derive(Clone, Debug, Default)]
pub struct ZioWaiter(Arc<(Mutex<WaiterCore>, Condvar)>);

impl ZioWaiter {
    /// Block until the request completes, returning its final status
    pub fn wait(&self) -> Result<()> {
        let (lock, cv) = &*self.0;
        let mut core = lock.lock().unwrap();
        while !core.done {
            core = cv.wait(core).unwrap();
        }
        match core.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    pub fn is_done(&self) -> bool {
        self.0 .0.lock().unwrap().done
    }

    fn complete(&self, error: Option<Error>) {
        let (lock, cv) = &*self.0;
        let mut core = lock.lock().unwrap();
        core.done = true;
        core.error = error;
        cv.notify_all();
    }
}

/// A single I/O request
pub struct Zio {
    pub ztype: ZioType,
    pub offset: u64,
    pub size: u64,
    pub data: Abd,
    pub vd: Option<VdevId>,
    pub flags: ZioFlags,
    pub priority: ZioPriority,
    /// Terminal status; `None` is success
    pub error: Option<Error>,
    done: Option<Box<dyn FnOnce(&mut Zio) + Send>>,
    waiter: ZioWaiter,
}

impl Zio {
    pub fn read(vd: VdevId, offset: u64, size: u64) -> Self {
        Zio::new(ZioType::Read, vd, offset, size, Abd::alloc(size as usize))
    }

    pub fn write(vd: VdevId, offset: u64, data: Abd) -> Self {
        let size = data.len() as u64;
        Zio::new(ZioType::Write, vd, offset, size, data)
    }

    pub fn flush(vd: VdevId) -> Self {
        Zio::new(ZioType::Flush, vd, 0, 0, Abd::alloc(0))
    }

    pub fn trim(vd: VdevId, offset: u64, size: u64) -> Self {
        Zio::new(ZioType::Trim, vd, offset, size, Abd::alloc(0))
    }

    fn new(ztype: ZioType, vd: VdevId, offset: u64, size: u64, data: Abd)
        -> Self
    {
        Zio {
            ztype,
            offset,
            size,
            data,
            vd: Some(vd),
            flags: ZioFlags::default(),
            priority: match ztype {
                ZioType::Read => ZioPriority::SyncRead,
                ZioType::Write => ZioPriority::SyncWrite,
                _ => ZioPriority::Trim,
            },
            error: None,
            done: None,
            waiter: ZioWaiter::default(),
        }
    }

    pub fn with_flags(mut self, flags: ZioFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_priority(mut self, priority: ZioPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_done<F: FnOnce(&mut Zio) + Send + 'static>(mut self, f: F)
        -> Self
    {
        self.done = Some(Box::new(f));
        self
    }

    /// A handle the issuer can block on after `io_start` returns `Stop`
    pub fn waiter(&self) -> ZioWaiter {
        self.waiter.clone()
    }

    /// Complete the request: run the done callback, then release waiters.
    /// Every started request is interrupted exactly once.
    pub fn interrupt(mut self) {
        if let Some(done) = self.done.take() {
            done(&mut self);
        }
        self.waiter.complete(self.error);
    }

    /// Set the terminal status, keeping the first error if one is already
    /// recorded.
    pub fn set_error(&mut self, e: Error) {
        self.error.get_or_insert(e);
    }

    pub fn result(&self) -> Result<()> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Zio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zio")
            .field("ztype", &self.ztype)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("vd", &self.vd)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use crate::vdev::VdevId;

    #[test]
    fn interrupt_wakes_waiter() {
        let zio = Zio::read(VdevId(0), 0, 512);
        let waiter = zio.waiter();
        assert!(!waiter.is_done());
        let jh = std::thread::spawn(move || waiter.wait());
        zio.interrupt();
        assert_eq!(jh.join().unwrap(), Ok(()));
    }

    #[test]
    fn error_propagates() {
        let mut zio = Zio::flush(VdevId(3));
        let waiter = zio.waiter();
        zio.set_error(Error::ENOTSUP);
        zio.set_error(Error::EIO); // first error wins
        zio.interrupt();
        assert_eq!(waiter.wait(), Err(Error::ENOTSUP));
    }

    #[test]
    fn done_callback_sees_final_state() {
        let mut zio = Zio::write(VdevId(1), 4096, Abd::from_vec(vec![7; 512]));
        zio.set_error(Error::ENXIO);
        let zio = zio.with_done(|z| {
            assert_eq!(z.error, Some(Error::ENXIO));
        });
        let waiter = zio.waiter();
        zio.interrupt();
        assert_eq!(waiter.wait(), Err(Error::ENXIO));
    }

    #[test]
    fn flags_pack() {
        let mut flags = ZioFlags::default();
        flags.set_scan_thread(true);
        flags.set_resilver(true);
        assert!(flags.scan_thread());
        assert!(flags.resilver());
        assert!(!flags.failfast());
        assert_eq!(flags.0, 0b1_0010);
    }
}
// LCOV_EXCL_STOP
