// vim: tw=80
//! The seam to the object layer above the pool core.
//!
//! Space maps and the meta directory persist themselves through objects:
//! flat, append-grown byte ranges identified by a 64-bit id.  The real
//! object layer lives outside this crate; [`MemObjset`] is the in-memory
//! implementation used by the pool's own metadata and by tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use crate::{
    txg::Tx,
    types::{Error, Result},
};

pub type ObjectId = u64;

pub trait Objset: Send + Sync {
    /// Allocate a new, empty object
    fn create_object(&self) -> ObjectId;

    /// Read `buf.len()` bytes at `offset`.  Short reads are errors.
    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset`, growing the object if needed.  The write
    /// becomes durable with `tx`'s txg.
    fn write(&self, obj: ObjectId, offset: u64, data: &[u8], tx: &Tx)
        -> Result<()>;

    /// Discard the object's entire contents
    fn free_contents(&self, obj: ObjectId, tx: &Tx) -> Result<()>;

    /// Current size of the object, in bytes
    fn object_len(&self, obj: ObjectId) -> Result<u64>;

    /// Advisory readahead.  The default implementation does nothing.
    fn prefetch(&self, _obj: ObjectId, _offset: u64, _len: u64) {}
}

/// Objects in anonymous memory
#[derive(Debug, Default)]
pub struct MemObjset {
    objects: Mutex<HashMap<ObjectId, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemObjset {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Objset for MemObjset {
    fn create_object(&self) -> ObjectId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().unwrap().insert(id, Vec::new());
        id
    }

    fn read(&self, obj: ObjectId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.objects.lock().unwrap();
        let data = guard.get(&obj).ok_or(Error::ENOENT)?;
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::EINVAL)?;
        if end > data.len() {
            return Err(Error::EINVAL);
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, obj: ObjectId, offset: u64, data: &[u8], _tx: &Tx)
        -> Result<()>
    {
        let mut guard = self.objects.lock().unwrap();
        let object = guard.get_mut(&obj).ok_or(Error::ENOENT)?;
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(Error::EINVAL)?;
        if end > object.len() {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(data);
        Ok(())
    }

    fn free_contents(&self, obj: ObjectId, _tx: &Tx) -> Result<()> {
        let mut guard = self.objects.lock().unwrap();
        let object = guard.get_mut(&obj).ok_or(Error::ENOENT)?;
        object.clear();
        Ok(())
    }

    fn object_len(&self, obj: ObjectId) -> Result<u64> {
        let guard = self.objects.lock().unwrap();
        guard
            .get(&obj)
            .map(|v| v.len() as u64)
            .ok_or(Error::ENOENT)
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TxgT;

    #[test]
    fn write_read() {
        let os = MemObjset::new();
        let tx = Tx::new(TxgT::from(7));
        let obj = os.create_object();
        os.write(obj, 4, &[1, 2, 3], &tx).unwrap();
        let mut buf = [0u8; 3];
        os.read(obj, 4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(os.object_len(obj), Ok(7));
    }

    #[test]
    fn read_past_end() {
        let os = MemObjset::new();
        let obj = os.create_object();
        let mut buf = [0u8; 1];
        assert_eq!(os.read(obj, 0, &mut buf), Err(Error::EINVAL));
    }

    #[test]
    fn free_contents_resets() {
        let os = MemObjset::new();
        let tx = Tx::new(TxgT::from(1));
        let obj = os.create_object();
        os.write(obj, 0, &[9; 100], &tx).unwrap();
        os.free_contents(obj, &tx).unwrap();
        assert_eq!(os.object_len(obj), Ok(0));
    }

    #[test]
    fn unknown_object() {
        let os = MemObjset::new();
        let mut buf = [0u8; 1];
        assert_eq!(os.read(42, 0, &mut buf), Err(Error::ENOENT));
    }
}
// LCOV_EXCL_STOP
