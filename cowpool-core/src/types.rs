// vim: tw=80
//! Constants and miscellaneous types used throughout the pool core

use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
};

/// Number of transaction groups that may exist at one time: open, quiescing,
/// and syncing.
pub const TXG_CONCURRENT_STATES: u64 = 3;

/// Size of the per-CPU hold slot ring.  Must be a power of two and at least
/// `TXG_CONCURRENT_STATES + 1`.
pub const TXG_SIZE: usize = 4;

pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;

/// Number of txgs that frees are deferred before their space is reusable.
pub const TXG_DEFER_SIZE: u64 = 2;

/// The first transaction group of a newly created pool.
pub const TXG_INITIAL: TxgT = TxgT(TXG_CONCURRENT_STATES + 1);

/// Base-2 log of the smallest supported block size
pub const SPA_MINBLOCKSHIFT: u8 = 9;

pub const SPA_MINBLOCKSIZE: u64 = 1 << SPA_MINBLOCKSHIFT;

/// Largest single I/O the pool will ever issue
pub const SPA_MAXBLOCKSIZE: u64 = 16 << 20;

/// A transaction group number.  Monotonic across the life of the pool.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TxgT(pub u64);

impl TxgT {
    /// The hold-slot index for this txg
    pub fn slot(self) -> usize {
        (self.0 & TXG_MASK) as usize
    }
}

impl fmt::Display for TxgT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Add<u64> for TxgT {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u64> for TxgT {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<u64> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self {
        TxgT(self.0 - rhs)
    }
}

/// On-disk identity of a pool or vdev.  Never zero for a valid device.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Guid(pub u64);

impl Guid {
    pub fn generate() -> Self {
        loop {
            let g = rand::random::<u64>();
            if g != 0 {
                break Guid(g);
            }
        }
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for Guid {
    fn from(g: u64) -> Self {
        Guid(g)
    }
}

/// Errno-flavored error type, in the tradition of every storage stack that
/// must eventually report through one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    EAGAIN,
    /// Reservation conflict on the target device
    EBADE,
    EBUSY,
    /// Checksum or other integrity failure
    EINTEGRITY,
    /// Protection (DIF/DIX) error
    EILSEQ,
    EINVAL,
    EIO,
    /// Medium error
    ENODATA,
    ENOENT,
    /// Transport is down
    ENOLINK,
    ENOMEM,
    ENOSPC,
    ENOTSUP,
    ENXIO,
    /// The target rejected the request
    EREMOTEIO,
    ETIMEDOUT,
}

pub type Result<T = ()> = std::result::Result<T, Error>;

impl Error {
    /// Will retrying the identical request ever succeed?
    pub fn is_transient(self) -> bool {
        matches!(self, Error::EAGAIN | Error::EBUSY | Error::ETIMEDOUT)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::EAGAIN => Error::EAGAIN,
            nix::Error::EBUSY => Error::EBUSY,
            nix::Error::EINVAL => Error::EINVAL,
            nix::Error::ENOENT => Error::ENOENT,
            nix::Error::ENOMEM => Error::ENOMEM,
            nix::Error::ENOSPC => Error::ENOSPC,
            nix::Error::ENOTSUP => Error::ENOTSUP,
            nix::Error::ENXIO => Error::ENXIO,
            nix::Error::ETIMEDOUT => Error::ETIMEDOUT,
            _ => Error::EIO,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => nix::Error::from_raw(errno).into(),
            None => Error::EIO,
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn txg_slot_wraps() {
        assert_eq!(TxgT(4).slot(), TxgT(8).slot());
        assert_eq!(TxgT(5).slot(), 1);
    }

    #[test]
    fn error_from_io() {
        let e = std::io::Error::from_raw_os_error(nix::libc::ENOSPC);
        assert_eq!(Error::from(e), Error::ENOSPC);
    }

    #[test]
    fn guid_generate_nonzero() {
        assert!(Guid::generate().is_valid());
    }
}
// LCOV_EXCL_STOP
