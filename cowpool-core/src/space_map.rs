// vim: tw=80
//! Space maps: the log-structured record of allocation decisions for one
//! region of a device, paired with an in-memory tree of live segments.
//!
//! The on-disk form is an append-only sequence of packed 64-bit entries.
//! The in-memory form is an ordered map of non-overlapping, non-touching
//! segments.  At sync time the tree *is* the dirty set: it is run-length
//! encoded onto the end of the object and then emptied.

use std::{
    collections::BTreeMap,
    sync::{Condvar, Mutex, MutexGuard},
};

use bitfield::bitfield;

use crate::{
    objset::{ObjectId, Objset},
    panic_recover,
    txg::Tx,
    types::{Result, TxgT},
    util::is_shift_aligned,
};

/// Size of the buffer used for load and sync I/O, as a shift
pub const SM_BLOCKSHIFT: u32 = 12;

/// Longest run expressible by a single entry, in units of `1 << shift`
pub const SM_RUN_MAX: u64 = 1 << 15;

/// Which side of the ledger an entry (or a whole load) describes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapType {
    Alloc,
    Free,
}

impl MapType {
    fn encode(self) -> u64 {
        match self {
            MapType::Alloc => 0,
            MapType::Free => 1,
        }
    }

    fn decode(bits: u64) -> Self {
        if bits == 0 { MapType::Alloc } else { MapType::Free }
    }
}

bitfield! {
    /// Raw 64-bit on-disk entry.  Debug and run entries overlay the same
    /// word; bit 63 discriminates.
    struct RawEntry(u64);
    impl Debug;
    u64;
    run_m1, set_run_m1: 14, 0;
    map_type, set_map_type: 15, 15;
    offset, set_offset: 62, 16;
    debug_txg, set_debug_txg: 49, 0;
    debug_syncpass, set_debug_syncpass: 59, 50;
    debug_action, set_debug_action: 62, 60;
    debug, set_debug: 63;
}

/// A decoded space map entry
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SmEntry {
    /// Bookkeeping only; loaders skip these
    Debug {
        action: MapType,
        syncpass: u64,
        txg: TxgT,
    },
    /// `run` consecutive units starting at `offset`, both in units of the
    /// map's `1 << shift`
    Run {
        offset: u64,
        map_type: MapType,
        run: u64,
    },
}

impl SmEntry {
    pub fn encode(self) -> u64 {
        let mut raw = RawEntry(0);
        match self {
            SmEntry::Debug { action, syncpass, txg } => {
                raw.set_debug(true);
                raw.set_debug_action(action.encode());
                raw.set_debug_syncpass(syncpass);
                raw.set_debug_txg(txg.0);
            }
            SmEntry::Run { offset, map_type, run } => {
                debug_assert!(run >= 1 && run <= SM_RUN_MAX);
                raw.set_offset(offset);
                raw.set_map_type(map_type.encode());
                raw.set_run_m1(run - 1);
            }
        }
        raw.0
    }

    pub fn decode(word: u64) -> Self {
        let raw = RawEntry(word);
        if raw.debug() {
            SmEntry::Debug {
                action: MapType::decode(raw.debug_action()),
                syncpass: raw.debug_syncpass(),
                txg: TxgT(raw.debug_txg()),
            }
        } else {
            SmEntry::Run {
                offset: raw.offset(),
                map_type: MapType::decode(raw.map_type()),
                run: raw.run_m1() + 1,
            }
        }
    }
}

/// The on-disk object backing a space map, and its counters.  `objsize`
/// only ever grows between truncations; `alloc` tracks live allocated
/// bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpaceMapObj {
    pub object: ObjectId,
    pub objsize: u64,
    pub alloc: u64,
}

/// In-memory segment tree over one region
#[derive(Debug)]
pub struct SpaceMap {
    start: u64,
    size: u64,
    shift: u8,
    /// segment start -> segment end, half-open
    root: BTreeMap<u64, u64>,
    space: u64,
    loaded: bool,
    loading: bool,
}

impl SpaceMap {
    pub fn new(start: u64, size: u64, shift: u8) -> Self {
        SpaceMap {
            start,
            size,
            shift,
            root: BTreeMap::new(),
            space: 0,
            loaded: false,
            loading: false,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn shift(&self) -> u8 {
        self.shift
    }

    /// Total bytes covered by segments in the tree
    pub fn space(&self) -> u64 {
        self.space
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn num_segs(&self) -> usize {
        self.root.len()
    }

    /// The tree must be empty and unloaded before its owner drops it.
    pub fn assert_destroyable(&self) {
        assert!(!self.loaded && !self.loading);
        assert_eq!(self.space, 0);
    }

    fn check_range(&self, start: u64, size: u64) {
        debug_assert!(size != 0);
        debug_assert!(start >= self.start);
        debug_assert!(start + size <= self.start + self.size);
        debug_assert!(is_shift_aligned(start, self.shift));
        debug_assert!(is_shift_aligned(size, self.shift));
    }

    /// Insert `[start, start + size)`, coalescing with abutting neighbors.
    ///
    /// Inserting over an already-present range is a recoverable invariant
    /// failure: the map is left unchanged.
    pub fn add(&mut self, start: u64, size: u64) {
        self.check_range(start, size);
        debug_assert!(self.space + size <= self.size);
        let end = start + size;

        let before = self
            .root
            .range(..=start)
            .next_back()
            .map(|(s, e)| (*s, *e));
        let after = self
            .root
            .range(start + 1..)
            .next()
            .map(|(s, e)| (*s, *e));

        if let Some((bs, be)) = before {
            if be > start || (bs == start) {
                panic_recover!(
                    "allocating allocated segment (offset={start} size={size})"
                );
                return;
            }
        }
        if let Some((as_, _)) = after {
            if as_ < end {
                panic_recover!(
                    "allocating allocated segment (offset={start} size={size})"
                );
                return;
            }
        }

        let merge_before = matches!(before, Some((_, be)) if be == start);
        let merge_after = matches!(after, Some((as_, _)) if as_ == end);

        match (merge_before, merge_after) {
            (true, true) => {
                let (bs, _) = before.unwrap();
                let (as_, ae) = after.unwrap();
                self.root.remove(&as_);
                self.root.insert(bs, ae);
            }
            (true, false) => {
                let (bs, _) = before.unwrap();
                self.root.insert(bs, end);
            }
            (false, true) => {
                let (as_, ae) = after.unwrap();
                self.root.remove(&as_);
                self.root.insert(start, ae);
            }
            (false, false) => {
                self.root.insert(start, end);
            }
        }

        self.space += size;
    }

    /// Remove `[start, start + size)`.  The range must lie entirely within
    /// one segment; removing from the middle splits it.
    ///
    /// Removing a range that isn't present is a recoverable invariant
    /// failure: the map is left unchanged.
    pub fn remove(&mut self, start: u64, size: u64) {
        self.check_range(start, size);
        let end = start + size;

        let seg = self
            .root
            .range(..=start)
            .next_back()
            .map(|(s, e)| (*s, *e));
        let (ss, se) = match seg {
            Some((ss, se)) if ss <= start && se >= end => (ss, se),
            _ => {
                panic_recover!(
                    "freeing free segment (offset={start} size={size})"
                );
                return;
            }
        };

        let left_over = ss != start;
        let right_over = se != end;

        self.root.remove(&ss);
        if left_over {
            self.root.insert(ss, start);
        }
        if right_over {
            self.root.insert(end, se);
        }

        self.space -= size;
    }

    /// Is `[start, start + size)` entirely present?
    pub fn contains(&self, start: u64, size: u64) -> bool {
        self.check_range(start, size);
        let end = start + size;
        matches!(self.root.range(..=start).next_back(),
            Some((&ss, &se)) if ss <= start && se >= end)
    }

    /// Visit every segment as `(start, size)`, in ascending start order
    pub fn walk<F: FnMut(u64, u64)>(&self, mut func: F) {
        for (&s, &e) in &self.root {
            func(s, e - s);
        }
    }

    /// Empty the tree, optionally forwarding each segment
    pub fn vacate(&mut self, mut func: Option<&mut dyn FnMut(u64, u64)>) {
        if let Some(f) = func.as_mut() {
            for (&s, &e) in &self.root {
                f(s, e - s);
            }
        }
        self.root.clear();
        self.space = 0;
    }

    fn apply_entry(&mut self, entry: SmEntry, maptype: MapType) {
        if let SmEntry::Run { offset, map_type, run } = entry {
            let start = (offset << self.shift) + self.start;
            let size = run << self.shift;
            if map_type == maptype {
                self.add(start, size);
            } else {
                self.remove(start, size);
            }
        }
    }
}

/// A space map plus the lock and condvar that serialize loads of it.
///
/// `load` and `sync` drop the lock across each block of object I/O;
/// concurrent loads are excluded by the `loading` flag, and sync is
/// single-writer by contract.
#[derive(Debug)]
pub struct LockedSpaceMap {
    sm: Mutex<SpaceMap>,
    load_cv: Condvar,
}

impl LockedSpaceMap {
    pub fn new(start: u64, size: u64, shift: u8) -> Self {
        LockedSpaceMap {
            sm: Mutex::new(SpaceMap::new(start, size, shift)),
            load_cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceMap> {
        self.sm.lock().unwrap()
    }

    /// Consume the wrapper, returning the bare tree
    pub fn into_inner(self) -> SpaceMap {
        self.sm.into_inner().unwrap()
    }

    /// Wait for any in-progress load to complete
    pub fn load_wait(&self) {
        let mut guard = self.sm.lock().unwrap();
        while guard.loading {
            debug_assert!(!guard.loaded);
            guard = self.load_cv.wait(guard).unwrap();
        }
    }

    /// Replay the on-disk log into the tree.
    ///
    /// A `Free` load starts from a fully-populated region, so the result is
    /// the free set; an `Alloc` load starts empty, so the result is the
    /// allocated set.  Errors leave the tree vacated.
    pub fn load(
        &self,
        maptype: MapType,
        smo: &SpaceMapObj,
        os: &dyn Objset,
    ) -> Result<()> {
        let mut guard = self.sm.lock().unwrap();
        assert!(!guard.loaded);
        assert!(!guard.loading);
        guard.loading = true;

        let end = smo.objsize;
        let mut space = smo.alloc;
        debug_assert_eq!(guard.space, 0);

        if maptype == MapType::Free {
            let (s, sz) = (guard.start, guard.size);
            guard.add(s, sz);
            space = guard.size - space;
        }

        let bufsize = 1usize << SM_BLOCKSHIFT;
        let mut buf = vec![0u8; bufsize];

        drop(guard);
        if end > bufsize as u64 {
            os.prefetch(smo.object, bufsize as u64, end - bufsize as u64);
        }
        guard = self.sm.lock().unwrap();

        let mut error = Ok(());
        let mut offset = 0;
        while offset < end {
            let size = (end - offset).min(bufsize as u64) as usize;
            debug_assert_eq!(size % 8, 0);

            tracing::debug!(
                object = smo.object,
                offset,
                size,
                "space map load chunk"
            );

            drop(guard);
            error = os.read(smo.object, offset, &mut buf[0..size]);
            guard = self.sm.lock().unwrap();
            if error.is_err() {
                break;
            }

            for word in buf[0..size].chunks_exact(8) {
                let e = u64::from_ne_bytes(word.try_into().unwrap());
                guard.apply_entry(SmEntry::decode(e), maptype);
            }
            offset += size as u64;
        }

        match error {
            Ok(()) => {
                if guard.space != space {
                    panic_recover!(
                        "space map space {} != expected {space}",
                        guard.space
                    );
                }
                guard.loaded = true;
            }
            Err(_) => guard.vacate(None),
        }

        guard.loading = false;
        self.load_cv.notify_all();
        error
    }

    pub fn unload(&self) {
        let mut guard = self.sm.lock().unwrap();
        guard.loaded = false;
        guard.vacate(None);
    }

    /// Run-length encode the tree onto the end of the object, then empty
    /// it.  One debug entry precedes the runs.
    pub fn sync(
        &self,
        maptype: MapType,
        syncpass: u64,
        smo: &mut SpaceMapObj,
        os: &dyn Objset,
        tx: &Tx,
    ) -> Result<()> {
        let mut guard = self.sm.lock().unwrap();
        if guard.space == 0 {
            return Ok(());
        }

        tracing::debug!(
            object = smo.object,
            txg = tx.txg().0,
            syncpass,
            action = ?maptype,
            count = guard.root.len(),
            space = guard.space,
            "space map sync"
        );

        match maptype {
            MapType::Alloc => smo.alloc += guard.space,
            MapType::Free => smo.alloc -= guard.space,
        }

        let bufwords =
            (8 + guard.root.len()).min((1usize << SM_BLOCKSHIFT) / 8);
        let mut entries: Vec<u64> = Vec::with_capacity(bufwords);

        entries.push(
            SmEntry::Debug { action: maptype, syncpass, txg: tx.txg() }
                .encode(),
        );

        while let Some((ss, se)) = guard.root.pop_first() {
            let size = se - ss;
            guard.space -= size;
            let mut start = (ss - guard.start) >> guard.shift;
            let mut len = size >> guard.shift;

            while len > 0 {
                let run = len.min(SM_RUN_MAX);

                if entries.len() == bufwords {
                    drop(guard);
                    write_words(os, smo, &entries, tx)?;
                    guard = self.sm.lock().unwrap();
                    entries.clear();
                }

                entries.push(
                    SmEntry::Run { offset: start, map_type: maptype, run }
                        .encode(),
                );
                start += run;
                len -= run;
            }
        }

        debug_assert_eq!(guard.space, 0);
        if !entries.is_empty() {
            drop(guard);
            write_words(os, smo, &entries, tx)?;
        }
        Ok(())
    }

    /// Discard the object's contents and reset its counters
    pub fn truncate(
        &self,
        smo: &mut SpaceMapObj,
        os: &dyn Objset,
        tx: &Tx,
    ) -> Result<()> {
        os.free_contents(smo.object, tx)?;
        smo.objsize = 0;
        smo.alloc = 0;
        Ok(())
    }
}

fn write_words(
    os: &dyn Objset,
    smo: &mut SpaceMapObj,
    words: &[u64],
    tx: &Tx,
) -> Result<()> {
    let bytes: Vec<u8> =
        words.iter().flat_map(|w| w.to_ne_bytes()).collect();
    os.write(smo.object, smo.objsize, &bytes, tx)?;
    smo.objsize += bytes.len() as u64;
    Ok(())
}

/// Reference trees generalize space maps: members carry arbitrary
/// reference counts rather than an implicit 0 or 1, which makes unions and
/// intersections of several maps cheap.  The union of N maps is the subset
/// with refcnt >= 1; the intersection, refcnt >= N.
#[derive(Debug, Default)]
pub struct RefTree {
    /// (offset, refcount delta), unsorted until generation
    entries: Vec<(u64, i64)>,
}

impl RefTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_seg(&mut self, start: u64, end: u64, refcnt: i64) {
        self.entries.push((start, refcnt));
        self.entries.push((end, -refcnt));
    }

    /// Add every segment of `sm` with the given reference count
    pub fn add_map(&mut self, sm: &SpaceMap, refcnt: i64) {
        sm.walk(|start, size| self.add_seg(start, start + size, refcnt));
    }

    /// Rebuild `sm` as the subset of this tree with a running reference
    /// count of at least `minref`.
    pub fn generate_map(&self, sm: &mut SpaceMap, minref: i64) {
        sm.vacate(None);

        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|&(offset, _)| offset);

        let mut refcnt = 0i64;
        let mut start: Option<u64> = None;
        for (offset, delta) in sorted {
            refcnt += delta;
            if refcnt >= minref {
                start.get_or_insert(offset);
            } else if let Some(s) = start.take() {
                debug_assert!(s <= offset);
                if offset > s {
                    sm.add(s, offset - s);
                }
            }
        }
        debug_assert_eq!(refcnt, 0);
        debug_assert_eq!(start, None);
    }
}

// LCOV_EXCL_STOP
