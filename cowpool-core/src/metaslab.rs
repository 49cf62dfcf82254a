// vim: tw=80
//! Metaslabs: the allocation regions of a top-level vdev.
//!
//! Each metaslab owns a space map and an allocation policy.  The loaded
//! tree holds the *free* space; allocations and frees accumulate in
//! per-txg dirty maps that are run-length encoded onto the space map
//! object at sync time.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::{
    objset::Objset,
    space_map::{LockedSpaceMap, MapType, SpaceMap, SpaceMapObj},
    txg::Tx,
    types::{Error, Result, TxgT, TXG_SIZE},
};

/// Allocation policy hooks.  The space map is the source of truth for what
/// is free; the policy only decides placement.
pub trait MetaslabOps: Send + Sync {
    /// The free tree has just been loaded
    fn load(&self, sm: &SpaceMap);

    fn unload(&self);

    /// Choose a free offset for `size` bytes, or None if the metaslab
    /// can't satisfy the request.
    fn alloc(&self, sm: &SpaceMap, size: u64) -> Option<u64>;

    /// A specific range is being claimed (e.g. log replay)
    fn claim(&self, sm: &SpaceMap, start: u64, size: u64);

    /// A range has been returned to the free tree
    fn free(&self, sm: &SpaceMap, start: u64, size: u64);

    /// The largest contiguous allocation currently possible
    fn max_available(&self, sm: &SpaceMap) -> u64;
}

/// Lowest-offset first fit
#[derive(Debug, Default)]
pub struct FirstFit;

impl MetaslabOps for FirstFit {
    fn load(&self, _sm: &SpaceMap) {}

    fn unload(&self) {}

    fn alloc(&self, sm: &SpaceMap, size: u64) -> Option<u64> {
        let mut found = None;
        sm.walk(|start, len| {
            if found.is_none() && len >= size {
                found = Some(start);
            }
        });
        found
    }

    fn claim(&self, sm: &SpaceMap, start: u64, size: u64) {
        debug_assert!(sm.contains(start, size));
    }

    fn free(&self, _sm: &SpaceMap, _start: u64, _size: u64) {}

    fn max_available(&self, sm: &SpaceMap) -> u64 {
        let mut max = 0;
        sm.walk(|_, len| max = max.max(len));
        max
    }
}

#[derive(Debug, Default)]
struct MsFlags {
    condensing: bool,
    rebuilding: bool,
}

/// One allocation region of a top-level vdev
pub struct Metaslab {
    pub id: usize,
    pub start: u64,
    pub size: u64,
    pub shift: u8,
    /// Loaded free-space tree
    map: LockedSpaceMap,
    /// Dirty allocations, per txg slot
    allocmap: [LockedSpaceMap; TXG_SIZE],
    /// Dirty frees, per txg slot
    freemap: [LockedSpaceMap; TXG_SIZE],
    /// Frees synced this txg, applied to the free tree at sync_done
    deferred: Mutex<Vec<(u64, u64)>>,
    smo: Mutex<SpaceMapObj>,
    /// Serializes sync against readers needing a stable on-disk view
    sync_lock: Mutex<()>,
    flags: Mutex<MsFlags>,
    flags_cv: Condvar,
    ops: Box<dyn MetaslabOps>,
}

impl Metaslab {
    pub fn new(
        id: usize,
        start: u64,
        size: u64,
        shift: u8,
        os: &dyn Objset,
        ops: Box<dyn MetaslabOps>,
    ) -> Self {
        let smo = SpaceMapObj {
            object: os.create_object(),
            ..Default::default()
        };
        Metaslab::open(id, start, size, shift, smo, ops)
    }

    /// Adopt an existing space map object, e.g. at pool import
    pub fn open(
        id: usize,
        start: u64,
        size: u64,
        shift: u8,
        smo: SpaceMapObj,
        ops: Box<dyn MetaslabOps>,
    ) -> Self {
        let mk = || LockedSpaceMap::new(start, size, shift);
        Metaslab {
            id,
            start,
            size,
            shift,
            map: mk(),
            allocmap: [mk(), mk(), mk(), mk()],
            freemap: [mk(), mk(), mk(), mk()],
            deferred: Mutex::new(Vec::new()),
            smo: Mutex::new(smo),
            sync_lock: Mutex::new(()),
            flags: Mutex::new(MsFlags::default()),
            flags_cv: Condvar::new(),
            ops,
        }
    }

    /// Load the free tree from the space map object and inform the policy
    pub fn load(&self, os: &dyn Objset) -> Result<()> {
        let smo = *self.smo.lock().unwrap();
        self.map.load(MapType::Free, &smo, os)?;
        self.ops.load(&self.map.lock());
        Ok(())
    }

    pub fn unload(&self) {
        self.ops.unload();
        self.map.unload();
    }

    pub fn is_loaded(&self) -> bool {
        self.map.lock().is_loaded()
    }

    /// Free bytes currently in the loaded tree
    pub fn free_space(&self) -> u64 {
        self.map.lock().space()
    }

    pub fn max_available(&self) -> u64 {
        self.ops.max_available(&self.map.lock())
    }

    pub fn smo(&self) -> SpaceMapObj {
        *self.smo.lock().unwrap()
    }

    pub fn sync_guard(&self) -> MutexGuard<'_, ()> {
        self.sync_lock.lock().unwrap()
    }

    /// Allocate `size` bytes from this metaslab, dirtying `txg`.
    ///
    /// Blocks while the metaslab is condensing or being rebuilt.
    pub fn alloc(&self, size: u64, txg: TxgT) -> Result<u64> {
        self.wait_idle();
        let mut sm = self.map.lock();
        if !sm.is_loaded() {
            return Err(Error::EBUSY);
        }
        let start = self.ops.alloc(&sm, size).ok_or(Error::ENOSPC)?;
        sm.remove(start, size);
        drop(sm);
        self.allocmap[txg.slot()].lock().add(start, size);
        Ok(start)
    }

    /// Claim a specific range out of the free tree, dirtying `txg`
    pub fn claim(&self, start: u64, size: u64, txg: TxgT) -> Result<()> {
        self.wait_idle();
        let mut sm = self.map.lock();
        if !sm.contains(start, size) {
            return Err(Error::ENOENT);
        }
        self.ops.claim(&sm, start, size);
        sm.remove(start, size);
        drop(sm);
        self.allocmap[txg.slot()].lock().add(start, size);
        Ok(())
    }

    /// Return a range to the pool, dirtying `txg`.  The space becomes
    /// allocatable again once the txg syncs.
    pub fn free(&self, start: u64, size: u64, txg: TxgT) {
        self.freemap[txg.slot()].lock().add(start, size);
        self.ops.free(&self.map.lock(), start, size);
    }

    /// Encode this txg's dirty maps onto the space map object
    pub fn sync(
        &self,
        os: &dyn Objset,
        syncpass: u64,
        tx: &Tx,
    ) -> Result<()> {
        let _sync = self.sync_lock.lock().unwrap();
        let slot = tx.txg().slot();
        let mut smo = *self.smo.lock().unwrap();

        // Frees only become allocatable after this txg is durable; stage
        // them for sync_done.
        {
            let fm = self.freemap[slot].lock();
            let mut deferred = self.deferred.lock().unwrap();
            fm.walk(|s, len| deferred.push((s, len)));
        }

        self.allocmap[slot].sync(MapType::Alloc, syncpass, &mut smo, os, tx)?;
        self.freemap[slot].sync(MapType::Free, syncpass, &mut smo, os, tx)?;

        *self.smo.lock().unwrap() = smo;
        Ok(())
    }

    /// Apply the staged frees to the loaded tree
    pub fn sync_done(&self, _txg: TxgT) {
        let staged = std::mem::take(&mut *self.deferred.lock().unwrap());
        if staged.is_empty() {
            return;
        }
        let mut sm = self.map.lock();
        if !sm.is_loaded() {
            return;
        }
        for (start, size) in staged {
            sm.add(start, size);
            self.ops.free(&sm, start, size);
        }
    }

    /// Is there anything dirty in this txg slot?
    pub fn is_dirty(&self, txg: TxgT) -> bool {
        let slot = txg.slot();
        !self.allocmap[slot].lock().is_empty()
            || !self.freemap[slot].lock().is_empty()
    }

    /// Load a *fresh* view of the allocated set from the on-disk object.
    /// The in-memory maps may reflect an in-progress sync, so rebuilds
    /// must not trust them; this replays only what the object holds.
    pub fn load_allocated(&self, os: &dyn Objset) -> Result<SpaceMap> {
        let smo = *self.smo.lock().unwrap();
        let view = LockedSpaceMap::new(self.start, self.size, self.shift);
        view.load(MapType::Alloc, &smo, os)?;
        Ok(view.into_inner())
    }

    fn wait_idle(&self) {
        let mut flags = self.flags.lock().unwrap();
        while flags.condensing || flags.rebuilding {
            flags = self.flags_cv.wait(flags).unwrap();
        }
    }

    /// Wait out a condense, then mark this metaslab as the rebuild unit.
    /// Rebuilding and condensing are mutually exclusive.
    pub fn begin_rebuild(&self) {
        let mut flags = self.flags.lock().unwrap();
        while flags.condensing {
            flags = self.flags_cv.wait(flags).unwrap();
        }
        assert!(!flags.rebuilding);
        flags.rebuilding = true;
    }

    pub fn end_rebuild(&self) {
        let mut flags = self.flags.lock().unwrap();
        debug_assert!(flags.rebuilding);
        flags.rebuilding = false;
        drop(flags);
        self.flags_cv.notify_all();
    }

    pub fn is_rebuilding(&self) -> bool {
        self.flags.lock().unwrap().rebuilding
    }

    pub fn begin_condense(&self) {
        let mut flags = self.flags.lock().unwrap();
        while flags.rebuilding || flags.condensing {
            flags = self.flags_cv.wait(flags).unwrap();
        }
        flags.condensing = true;
    }

    pub fn end_condense(&self) {
        let mut flags = self.flags.lock().unwrap();
        flags.condensing = false;
        drop(flags);
        self.flags_cv.notify_all();
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::objset::MemObjset;

    const MS_SIZE: u64 = 1 << 20;

    fn fresh(os: &dyn Objset) -> Metaslab {
        let ms = Metaslab::new(0, 0, MS_SIZE, 9, os, Box::new(FirstFit));
        // A brand-new metaslab is entirely free
        ms.load(os).unwrap();
        ms
    }

    #[test]
    fn new_metaslab_is_all_free() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        assert_eq!(ms.free_space(), MS_SIZE);
        assert_eq!(ms.max_available(), MS_SIZE);
    }

    #[test]
    fn alloc_removes_from_free_tree() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        let txg = TxgT(4);
        let off = ms.alloc(4096, txg).unwrap();
        assert_eq!(off, 0);
        assert_eq!(ms.free_space(), MS_SIZE - 4096);
        assert!(ms.is_dirty(txg));

        // First fit: the next allocation follows the first
        let off2 = ms.alloc(512, txg).unwrap();
        assert_eq!(off2, 4096);
    }

    #[test]
    fn alloc_enospc() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        assert_eq!(
            ms.alloc(2 * MS_SIZE, TxgT(4)).unwrap_err(),
            Error::ENOSPC
        );
    }

    #[test]
    fn claim_requires_free_range() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        let txg = TxgT(4);
        ms.claim(8192, 4096, txg).unwrap();
        assert_eq!(ms.free_space(), MS_SIZE - 4096);
        // Claiming it again fails: it's no longer free
        assert_eq!(
            ms.claim(8192, 4096, txg).unwrap_err(),
            Error::ENOENT
        );
    }

    /// Frees don't come back to the free tree until sync_done
    #[test]
    fn free_is_deferred() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        let txg = TxgT(4);
        let tx = Tx::new(txg);
        let off = ms.alloc(4096, txg).unwrap();
        ms.sync(&os, 1, &tx).unwrap();
        ms.sync_done(txg);

        let txg2 = TxgT(5);
        ms.free(off, 4096, txg2);
        assert_eq!(ms.free_space(), MS_SIZE - 4096);
        ms.sync(&os, 1, &Tx::new(txg2)).unwrap();
        assert_eq!(ms.free_space(), MS_SIZE - 4096);
        ms.sync_done(txg2);
        assert_eq!(ms.free_space(), MS_SIZE);
    }

    /// The on-disk object replays to the same state across unload/load
    #[test]
    fn persistence_round_trip() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        let txg = TxgT(4);
        let a = ms.alloc(8192, txg).unwrap();
        let _b = ms.alloc(4096, txg).unwrap();
        ms.sync(&os, 1, &Tx::new(txg)).unwrap();
        ms.sync_done(txg);
        let txg2 = TxgT(5);
        ms.free(a, 8192, txg2);
        ms.sync(&os, 1, &Tx::new(txg2)).unwrap();
        ms.sync_done(txg2);
        let expect = ms.free_space();

        ms.unload();
        ms.load(&os).unwrap();
        assert_eq!(ms.free_space(), expect);
        assert_eq!(ms.free_space(), MS_SIZE - 4096);
    }

    /// The fresh view reports exactly the synced allocations
    #[test]
    fn load_allocated_fresh_view() {
        let os = MemObjset::new();
        let ms = fresh(&os);
        let txg = TxgT(4);
        ms.alloc(4096, txg).unwrap();
        ms.sync(&os, 1, &Tx::new(txg)).unwrap();
        ms.sync_done(txg);

        // Dirty, unsynced state is not part of the fresh view
        ms.alloc(512, TxgT(5)).unwrap();

        let allocd = ms.load_allocated(&os).unwrap();
        assert_eq!(allocd.space(), 4096);
        let mut segs = Vec::new();
        allocd.walk(|s, len| segs.push((s, len)));
        assert_eq!(segs, vec![(0, 4096)]);
    }

    #[test]
    fn rebuild_excludes_alloc() {
        let os = Arc::new(MemObjset::new());
        let ms = Arc::new(Metaslab::new(
            0,
            0,
            MS_SIZE,
            9,
            &*os,
            Box::new(FirstFit),
        ));
        ms.load(&*os).unwrap();
        ms.begin_rebuild();
        assert!(ms.is_rebuilding());

        let ms2 = ms.clone();
        let jh = std::thread::spawn(move || {
            ms2.alloc(4096, TxgT(4)).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!jh.is_finished());

        ms.end_rebuild();
        assert_eq!(jh.join().unwrap(), 0);
    }

    #[test]
    fn condense_excludes_rebuild() {
        let os = MemObjset::new();
        let ms = Arc::new(fresh(&os));
        ms.begin_condense();
        let ms2 = ms.clone();
        let jh = std::thread::spawn(move || {
            ms2.begin_rebuild();
            ms2.end_rebuild();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!jh.is_finished());
        ms.end_condense();
        jh.join().unwrap();
    }
}
// LCOV_EXCL_STOP
