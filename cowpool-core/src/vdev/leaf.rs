// vim: tw=80
//! Leaf-device I/O: request construction, transport status classification,
//! cache-flush and discard policy, and the per-leaf failure policy.

use std::os::fd::AsRawFd;
use std::sync::{atomic::Ordering, Arc, Mutex};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{AsyncRequest, Vdev};
use crate::{
    taskq::Taskq,
    types::{Error, Result},
    util::TUNABLES,
    zio::{Zio, ZioControl, ZioType},
};

/// Transport-layer completion status, as reported by the block layer
#[derive(
    Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive,
)]
#[repr(u8)]
pub enum DiskStatus {
    Ok = 0,
    NotSupp,
    Timeout,
    NoSpace,
    Transport,
    Target,
    ReservationConflict,
    Medium,
    Protection,
    Resource,
    Again,
    IoErr,
}

/// The status of one transport operation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportResult {
    pub status: DiskStatus,
    /// Bytes *not* transferred
    pub residual: usize,
}

impl TransportResult {
    pub fn ok() -> Self {
        TransportResult { status: DiskStatus::Ok, residual: 0 }
    }

    pub fn error(status: DiskStatus) -> Self {
        TransportResult { status, residual: 0 }
    }
}

/// Translate a transport status into an errno-flavored error.  A successful
/// transport with residual bytes is an I/O error.
pub fn status_to_errno(result: TransportResult) -> Option<Error> {
    match result.status {
        DiskStatus::Ok => {
            if result.residual == 0 {
                None
            } else {
                Some(Error::EIO)
            }
        }
        DiskStatus::NotSupp => Some(Error::ENOTSUP),
        DiskStatus::Timeout => Some(Error::ETIMEDOUT),
        DiskStatus::NoSpace => Some(Error::ENOSPC),
        DiskStatus::Transport => Some(Error::ENOLINK),
        DiskStatus::Target => Some(Error::EREMOTEIO),
        DiskStatus::ReservationConflict => Some(Error::EBADE),
        DiskStatus::Medium => Some(Error::ENODATA),
        DiskStatus::Protection => Some(Error::EILSEQ),
        DiskStatus::Resource => Some(Error::ENOMEM),
        DiskStatus::Again => Some(Error::EAGAIN),
        DiskStatus::IoErr => Some(Error::EIO),
    }
}

fn errno_to_status(e: nix::Error) -> DiskStatus {
    match e {
        nix::Error::ENOTSUP => DiskStatus::NotSupp,
        nix::Error::ETIMEDOUT => DiskStatus::Timeout,
        nix::Error::ENOSPC => DiskStatus::NoSpace,
        nix::Error::ENOLINK => DiskStatus::Transport,
        nix::Error::ENOMEM => DiskStatus::Resource,
        nix::Error::EAGAIN => DiskStatus::Again,
        _ => DiskStatus::IoErr,
    }
}

/// Can this device deallocate sectors, and how thoroughly?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscardCap {
    None,
    Discard,
    SecureErase,
}

#[derive(Clone, Copy, Debug)]
pub struct LeafGeometry {
    /// Addressable bytes
    pub asize: u64,
    /// log2 of the smallest addressable unit
    pub ashift: u8,
    /// Does the device have a volatile write cache worth flushing?
    pub write_cache: bool,
    pub discard: DiscardCap,
    /// Largest single discard, in sectors; 0 for no limit
    pub max_discard_sectors: u64,
}

/// The physical side of a leaf vdev.
///
/// One implementation per backing store.  All methods are synchronous; the
/// leaf layer provides the asynchrony by running them on a task queue.
pub trait LeafTransport: Send + Sync {
    /// Probe the device and return its geometry
    fn open(&self) -> Result<LeafGeometry> {
        Ok(self.geometry())
    }

    fn geometry(&self) -> LeafGeometry;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> TransportResult;

    fn write_at(&self, buf: &[u8], offset: u64) -> TransportResult;

    fn flush(&self) -> TransportResult;

    fn trim(&self, offset: u64, len: u64, secure: bool) -> TransportResult;

    /// Is the transport to the device still present?
    fn accessible(&self) -> bool {
        true
    }

    /// Has the medium been changed behind our back?
    fn media_changed(&self) -> bool {
        false
    }

    fn close(&self) {}
}

/// Start a request against a leaf vdev.
///
/// Returns `Continue` with the request if it was completed (or refused)
/// inline, or `Stop` after handing it to the task queue, in which case the
/// request will be interrupted on completion.
pub(super) fn io_start(
    vd: Arc<Vdev>,
    mut zio: Zio,
    tq: &Taskq,
) -> (ZioControl, Option<Zio>) {
    debug_assert!(vd.is_leaf());

    match zio.ztype {
        ZioType::Flush => {
            if !vd.readable() {
                zio.set_error(Error::ENXIO);
                return (ZioControl::Continue, Some(zio));
            }
            if TUNABLES.nocacheflush.load(Ordering::Relaxed) {
                return (ZioControl::Continue, Some(zio));
            }
            if vd.nowritecache.load(Ordering::SeqCst) {
                zio.set_error(Error::ENOTSUP);
                return (ZioControl::Continue, Some(zio));
            }
            let write_cache = match vd.transport() {
                Ok(xport) => xport.geometry().write_cache,
                Err(e) => {
                    zio.set_error(e);
                    return (ZioControl::Continue, Some(zio));
                }
            };
            if !write_cache {
                return (ZioControl::Continue, Some(zio));
            }
            dispatch(vd, zio, tq)
        }
        ZioType::Trim => {
            let cap = match vd.transport() {
                Ok(xport) => xport.geometry().discard,
                Err(e) => {
                    zio.set_error(e);
                    return (ZioControl::Continue, Some(zio));
                }
            };
            let supported = match cap {
                DiscardCap::None => false,
                DiscardCap::Discard => !zio.flags.secure(),
                DiscardCap::SecureErase => true,
            };
            if !supported {
                zio.set_error(Error::ENOTSUP);
                return (ZioControl::Continue, Some(zio));
            }
            dispatch(vd, zio, tq)
        }
        ZioType::Read | ZioType::Write => {
            if !vd.readable() {
                zio.set_error(Error::ENXIO);
                return (ZioControl::Continue, Some(zio));
            }
            dispatch(vd, zio, tq)
        }
    }
}

fn dispatch(vd: Arc<Vdev>, zio: Zio, tq: &Taskq) -> (ZioControl, Option<Zio>)
{
    if !zio.flags.scan_thread() {
        vd.stamp_last_io();
    }
    let vd2 = vd.clone();
    let cell = Arc::new(Mutex::new(Some(zio)));
    let cell2 = cell.clone();
    match tq.dispatch(move || {
        let mut zio = cell2.lock().unwrap().take().unwrap();
        execute(&vd2, &mut zio);
        io_done(&vd2, &mut zio);
        zio.interrupt();
    }) {
        Ok(()) => (ZioControl::Stop, None),
        Err(e) => {
            // The queue is tearing down; refuse inline
            let mut zio = cell.lock().unwrap().take().unwrap();
            zio.set_error(e);
            (ZioControl::Continue, Some(zio))
        }
    }
}

/// Perform the physical transfer
fn execute(vd: &Arc<Vdev>, zio: &mut Zio) {
    let xport = match vd.transport() {
        Ok(x) => x.clone(),
        Err(e) => {
            zio.set_error(e);
            return;
        }
    };
    let unit = 1u64 << vd.ashift();
    let result = match zio.ztype {
        ZioType::Read => {
            if zio.offset % unit == 0 && zio.size % unit == 0 {
                // Whole sectors: transfer directly into the request buffer
                zio.data.with_mut(|buf| xport.read_at(buf, zio.offset))
            } else {
                bounce_read(&*xport, zio, unit)
            }
        }
        ZioType::Write => {
            if zio.offset % unit == 0 && zio.size % unit == 0 {
                zio.data.with(|buf| xport.write_at(buf, zio.offset))
            } else {
                bounce_write(&*xport, zio, unit)
            }
        }
        ZioType::Flush => xport.flush(),
        ZioType::Trim => {
            trim_chunked(&*xport, zio.offset, zio.size, zio.flags.secure())
        }
    };
    if let Some(e) = status_to_errno(result) {
        zio.set_error(e);
    }
}

/// Misaligned read: transfer the surrounding sectors, then copy the
/// interesting part out of the bounce buffer.
fn bounce_read(
    xport: &dyn LeafTransport,
    zio: &mut Zio,
    unit: u64,
) -> TransportResult {
    let start = zio.offset - zio.offset % unit;
    let end = (zio.offset + zio.size).div_ceil(unit) * unit;
    let mut bounce = vec![0u8; (end - start) as usize];
    let result = xport.read_at(&mut bounce, start);
    if result.status == DiskStatus::Ok && result.residual == 0 {
        let skip = (zio.offset - start) as usize;
        zio.data.with_mut(|buf| {
            buf.copy_from_slice(&bounce[skip..skip + zio.size as usize]);
        });
    }
    result
}

/// Misaligned write: read-modify-write through a bounce buffer so the
/// neighboring bytes in the boundary sectors survive.
fn bounce_write(
    xport: &dyn LeafTransport,
    zio: &mut Zio,
    unit: u64,
) -> TransportResult {
    let start = zio.offset - zio.offset % unit;
    let end = (zio.offset + zio.size).div_ceil(unit) * unit;
    let mut bounce = vec![0u8; (end - start) as usize];
    let result = xport.read_at(&mut bounce, start);
    if result.status != DiskStatus::Ok || result.residual != 0 {
        return result;
    }
    let skip = (zio.offset - start) as usize;
    zio.data.with(|buf| {
        bounce[skip..skip + zio.size as usize].copy_from_slice(buf);
    });
    xport.write_at(&bounce, start)
}

/// Split a discard request along the device's maximum discard size
fn trim_chunked(
    xport: &dyn LeafTransport,
    offset: u64,
    size: u64,
    secure: bool,
) -> TransportResult {
    let geom = xport.geometry();
    let max = if geom.max_discard_sectors == 0 {
        u64::MAX
    } else {
        geom.max_discard_sectors << geom.ashift
    };
    let mut offset = offset;
    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(max);
        let result = xport.trim(offset, chunk, secure);
        if result.status != DiskStatus::Ok {
            return result;
        }
        offset += chunk;
        remaining -= chunk;
    }
    TransportResult::ok()
}

/// Completion policy: classify the result and update the leaf's latches,
/// error counters, and removal requests.  Runs once per started request.
pub(super) fn io_done(vd: &Arc<Vdev>, zio: &mut Zio) {
    match zio.error {
        Some(Error::ENXIO) => {
            let accessible = vd
                .transport()
                .map(|x| x.accessible())
                .unwrap_or(false);
            if accessible {
                // The device errored but the transport is alive: close it
                // lazily rather than yanking it out from under open I/O.
                vd.delayed_close.store(true, Ordering::SeqCst);
            } else {
                vd.remove_wanted.store(true, Ordering::SeqCst);
                vd.async_queue.post(AsyncRequest::Remove(vd.id));
            }
        }
        Some(Error::EIO) if zio.ztype == ZioType::Read => {
            let changed = vd
                .transport()
                .map(|x| x.media_changed())
                .unwrap_or(false);
            if changed {
                if let Ok(xport) = vd.transport() {
                    xport.close();
                }
                vd.remove_wanted.store(true, Ordering::SeqCst);
                vd.async_queue.post(AsyncRequest::Remove(vd.id));
            }
        }
        Some(Error::ENOTSUP) if zio.ztype == ZioType::Flush => {
            // Never ask again
            vd.nowritecache.store(true, Ordering::SeqCst);
        }
        _ => {}
    }
    if zio.error.is_some() && zio.error != Some(Error::ENOTSUP) {
        vd.account_error(zio.ztype);
    }
}

/// A leaf backed by a regular file or device node
#[derive(Debug)]
pub struct FileTransport {
    file: std::fs::File,
}

impl FileTransport {
    pub fn open_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Ok(FileTransport { file })
    }

    pub fn from_file(file: std::fs::File) -> Self {
        FileTransport { file }
    }
}

impl LeafTransport for FileTransport {
    fn geometry(&self) -> LeafGeometry {
        let len = self
            .file
            .metadata()
            .map(|md| md.len())
            .unwrap_or(0);
        LeafGeometry {
            asize: len & !511,
            ashift: 9,
            write_cache: true,
            discard: DiscardCap::None,
            max_discard_sectors: 0,
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> TransportResult {
        use std::os::fd::AsFd;
        let mut done = 0;
        while done < buf.len() {
            match nix::sys::uio::pread(
                self.file.as_fd(),
                &mut buf[done..],
                (offset as i64) + done as i64,
            ) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) => return TransportResult::error(errno_to_status(e)),
            }
        }
        TransportResult { status: DiskStatus::Ok, residual: buf.len() - done }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> TransportResult {
        use std::os::fd::AsFd;
        let mut done = 0;
        while done < buf.len() {
            match nix::sys::uio::pwrite(
                self.file.as_fd(),
                &buf[done..],
                (offset as i64) + done as i64,
            ) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) => return TransportResult::error(errno_to_status(e)),
            }
        }
        TransportResult { status: DiskStatus::Ok, residual: buf.len() - done }
    }

    fn flush(&self) -> TransportResult {
        match nix::unistd::fsync(self.file.as_raw_fd()) {
            Ok(()) => TransportResult::ok(),
            Err(e) => TransportResult::error(errno_to_status(e)),
        }
    }

    fn trim(&self, _offset: u64, _len: u64, _secure: bool)
        -> TransportResult
    {
        // Regular files advertise no discard capability, so this is
        // unreachable through io_start.
        TransportResult::error(DiskStatus::NotSupp)
    }
}

/// A leaf backed by anonymous memory, for tests and simulation
#[derive(Debug)]
pub struct RamTransport {
    data: Mutex<Vec<u8>>,
    geometry: LeafGeometry,
    /// When set, every operation completes with this status instead
    fault: Mutex<Option<DiskStatus>>,
}

impl RamTransport {
    pub fn new(asize: u64) -> Self {
        RamTransport {
            data: Mutex::new(vec![0u8; asize as usize]),
            geometry: LeafGeometry {
                asize,
                ashift: 9,
                write_cache: true,
                discard: DiscardCap::Discard,
                max_discard_sectors: 0,
            },
            fault: Mutex::new(None),
        }
    }

    pub fn with_geometry(mut self, geometry: LeafGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Inject a fault: every subsequent operation fails with `status`
    pub fn set_fault(&self, status: Option<DiskStatus>) {
        *self.fault.lock().unwrap() = status;
    }

    fn faulted(&self) -> Option<TransportResult> {
        self.fault
            .lock()
            .unwrap()
            .map(TransportResult::error)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl LeafTransport for RamTransport {
    fn geometry(&self) -> LeafGeometry {
        self.geometry
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> TransportResult {
        if let Some(r) = self.faulted() {
            return r;
        }
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return TransportResult::error(DiskStatus::IoErr);
        }
        buf.copy_from_slice(&data[start..start + buf.len()]);
        TransportResult::ok()
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> TransportResult {
        if let Some(r) = self.faulted() {
            return r;
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return TransportResult::error(DiskStatus::IoErr);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        TransportResult::ok()
    }

    fn flush(&self) -> TransportResult {
        self.faulted().unwrap_or_else(TransportResult::ok)
    }

    fn trim(&self, offset: u64, len: u64, _secure: bool) -> TransportResult
    {
        if let Some(r) = self.faulted() {
            return r;
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + len as usize;
        if end > data.len() {
            return TransportResult::error(DiskStatus::IoErr);
        }
        data[start..end].fill(0);
        TransportResult::ok()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mockall::mock! {
    pub Transport {}
    impl LeafTransport for Transport {
        fn open(&self) -> Result<LeafGeometry>;
        fn geometry(&self) -> LeafGeometry;
        fn read_at(&self, buf: &mut [u8], offset: u64) -> TransportResult;
        fn write_at(&self, buf: &[u8], offset: u64) -> TransportResult;
        fn flush(&self) -> TransportResult;
        fn trim(&self, offset: u64, len: u64, secure: bool)
            -> TransportResult;
        fn accessible(&self) -> bool;
        fn media_changed(&self) -> bool;
        fn close(&self);
    }
}

// LCOV_EXCL_STOP
