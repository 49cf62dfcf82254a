// vim: tw=80
//! Sequential rebuild: walk the allocated space of a top-level vdev,
//! metaslab by metaslab, and issue reconstruction I/O for everything the
//! failed leaf should have held.
//!
//! The controller reads a *fresh* view of each metaslab's space map (the
//! in-memory one may reflect a sync in progress), throttles itself against
//! an outstanding-bytes watermark, and records the highest contiguously
//! completed metaslab each txg so a crashed or exported pool resumes where
//! it left off.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};

use fixedbitset::FixedBitSet;

use crate::{
    spa::{
        Event, ScanFunc, ScanState, Spa, SyncTask, DIR_REBUILDING,
    },
    txg::Tx,
    types::{
        Error, Guid, Result, TxgT, SPA_MAXBLOCKSIZE,
        TXG_CONCURRENT_STATES,
    },
    util::{delay, lbolt, TUNABLES},
    vdev::{VdevId, VdevKind},
    zio::{Zio, ZioFlags, ZioPriority},
};

/// Meta directory key holding the scan bookkeeping
pub const DIR_SCAN: &str = "scan";

/// Persisted rebuild progress: highest contiguously completed metaslab
/// (-1 before any), plus the identities of the scanned top-level vdev and
/// the failed leaf.
#[derive(Clone, Copy, Debug, Default)]
struct RebuildPhys {
    ms: i64,
    vdev_guid: u64,
    oldvd_guid: u64,
}

#[derive(Default)]
struct ScanCore {
    thread: Option<std::thread::JoinHandle<()>>,
    ms_done: Option<FixedBitSet>,
    /// Highest index such that every metaslab at or below it is complete
    msi_synced: i64,
}

#[derive(Default)]
struct IoCore {
    outstanding_asize: u64,
}

/// One active sequential rebuild
pub struct VdevScan {
    /// The failed leaf whose contents are being reconstructed
    oldvd: VdevId,
    top: VdevId,
    start_ms: usize,
    dtl_max: TxgT,
    core: Mutex<ScanCore>,
    cv: Condvar,
    io: Mutex<IoCore>,
    io_cv: Condvar,
    thread_exit: AtomicBool,
    phys: Mutex<RebuildPhys>,
}

impl VdevScan {
    /// Begin rebuilding `oldvd`'s side of its top-level vdev, starting at
    /// `start_ms`.  Waits for `dtl_max` to sync (so DTL propagation from
    /// the attach is visible) before scanning.
    pub fn start(
        spa: &Arc<Spa>,
        oldvd: VdevId,
        start_ms: usize,
        dtl_max: TxgT,
    ) {
        let top = spa.tree().top_of(oldvd);
        let ms_count = spa.metaslabs_of(top).len();
        assert!(start_ms < ms_count);

        let to_examine: u64 = spa
            .metaslabs_of(top)
            .iter()
            .map(|ms| ms.smo().alloc)
            .sum();
        let max_txg = spa.txg().generations().open;
        {
            let mut scan = spa.scan();
            debug_assert!(scan.state != ScanState::Scanning);
            *scan = Default::default();
            scan.func = ScanFunc::Rebuild;
            scan.state = ScanState::Scanning;
            scan.max_txg = max_txg;
            scan.to_examine = to_examine;
        }

        let svs = Arc::new(VdevScan {
            oldvd,
            top,
            start_ms,
            dtl_max,
            core: Mutex::new(ScanCore {
                thread: None,
                ms_done: None,
                msi_synced: start_ms as i64 - 1,
            }),
            cv: Condvar::new(),
            io: Mutex::new(IoCore::default()),
            io_cv: Condvar::new(),
            thread_exit: AtomicBool::new(false),
            phys: Mutex::new(RebuildPhys {
                ms: -1,
                vdev_guid: spa.tree().get(top).guid.0,
                oldvd_guid: spa.tree().get(oldvd).guid.0,
            }),
        });
        spa.set_vdev_scan(Some(svs.clone()));
        spa.txg().set_scan_active(true);
        spa.post_event(Event::RebuildStart);

        let spa2 = spa.clone();
        let svs2 = svs.clone();
        let jh = std::thread::Builder::new()
            .name("vdev_rebuild".to_owned())
            .spawn(move || svs2.thread(spa2))
            .unwrap();
        svs.core.lock().unwrap().thread = Some(jh);
    }

    /// Ask the rebuild thread to stop at the next boundary and wait for it
    pub fn suspend(spa: &Spa) {
        let svs = match spa.vdev_scan() {
            Some(svs) => svs,
            None => return,
        };
        svs.thread_exit.store(true, Ordering::SeqCst);
        svs.io_cv.notify_all();
        let jh = svs.core.lock().unwrap().thread.take();
        if let Some(jh) = jh {
            let _ = jh.join();
        }
        spa.txg().set_scan_active(false);
    }

    /// Tear down a finished or suspended rebuild
    pub fn destroy(spa: &Spa) {
        if let Some(svs) = spa.vdev_scan() {
            let core = svs.core.lock().unwrap();
            assert!(core.thread.is_none());
            debug_assert_eq!(
                svs.io.lock().unwrap().outstanding_asize,
                0
            );
            drop(core);
            spa.set_vdev_scan(None);
        }
    }

    /// Persist progress and scan bookkeeping.  Called from the sync
    /// thread once per txg.
    pub fn sync_state(&self, spa: &Spa, _tx: &Tx) {
        let mut phys = self.phys.lock().unwrap();
        phys.ms = self.core.lock().unwrap().msi_synced;
        spa.dir_update(
            DIR_REBUILDING,
            &[phys.ms as u64, phys.vdev_guid, phys.oldvd_guid],
        );
        let scan = *spa.scan();
        spa.dir_update(
            DIR_SCAN,
            &[
                scan_func_to_u64(scan.func),
                scan_state_to_u64(scan.state),
                scan.max_txg.0,
                scan.to_examine,
                scan.examined,
                scan.issued,
                scan.errors,
            ],
        );
    }

    pub fn msi_synced(&self) -> i64 {
        self.core.lock().unwrap().msi_synced
    }

    fn exiting(&self) -> bool {
        self.thread_exit.load(Ordering::SeqCst)
    }

    fn thread(self: Arc<Self>, spa: Arc<Spa>) {
        // Wait for the attach's DTL changes to become visible
        spa.txg().wait_synced(self.dtl_max);

        let ms_count = spa.metaslabs_of(self.top).len();
        {
            let mut core = self.core.lock().unwrap();
            let mut done = FixedBitSet::with_capacity(ms_count);
            for msi in 0..self.start_ms {
                done.insert(msi);
            }
            core.ms_done = Some(done);
            core.msi_synced = self.start_ms as i64 - 1;
        }

        for msi in self.start_ms..ms_count {
            if self.exiting() {
                break;
            }
            // The source leaf may have been replaced or detached while we
            // were scanning; revalidate before every metaslab.
            let oldvd_guid =
                Guid(self.phys.lock().unwrap().oldvd_guid);
            match spa.tree().lookup_by_guid(oldvd_guid) {
                Some(vd) if spa.tree().top_of(vd.id) == self.top => {}
                _ => {
                    tracing::warn!(
                        "rebuild source vanished; stopping at \
                         metaslab {msi}"
                    );
                    break;
                }
            }

            let ms = spa.metaslabs_of(self.top)[msi].clone();
            let allocd = {
                let _sync = ms.sync_guard();
                ms.begin_rebuild();
                match ms.load_allocated(&**spa.objset()) {
                    Ok(allocd) => allocd,
                    Err(e) => {
                        tracing::error!(
                            ms = msi,
                            error = %e,
                            "cannot load metaslab space map"
                        );
                        ms.end_rebuild();
                        break;
                    }
                }
            };
            tracing::debug!(
                ms = msi,
                segments = allocd.num_segs(),
                "scanning metaslab"
            );

            let mut segs = Vec::new();
            allocd.walk(|s, len| segs.push((s, len)));
            for (offset, length) in segs {
                if self.exiting() {
                    break;
                }
                match &spa.tree().get(self.top).kind {
                    VdevKind::Draid { .. } => self
                        .draid_rebuild(&spa, offset, length),
                    _ => self.rebuild(
                        &spa,
                        offset,
                        length,
                        SPA_MAXBLOCKSIZE,
                    ),
                }
            }

            // Per-metaslab barrier: every issued reconstruction I/O has
            // completed before the metaslab is marked done.
            self.wait_drained();
            let exiting = self.exiting();
            let mut core = self.core.lock().unwrap();
            if !exiting {
                core.ms_done.as_mut().unwrap().insert(msi);
                let synced = {
                    let done = core.ms_done.as_ref().unwrap();
                    let mut synced = core.msi_synced;
                    while ((synced + 1) as usize) < ms_count
                        && done.contains((synced + 1) as usize)
                    {
                        synced += 1;
                    }
                    synced
                };
                core.msi_synced = synced;
                tracing::debug!(ms = msi, "completed metaslab");
            } else {
                // The thread may have been interrupted partway through
                // this metaslab, so it can't be marked done.
                tracing::debug!(ms = msi, "aborted metaslab");
            }
            drop(core);
            ms.end_rebuild();
        }

        self.wait_drained();

        let complete = {
            let core = self.core.lock().unwrap();
            core.msi_synced + 1 == ms_count as i64
        };
        if complete {
            let mut scan = spa.scan();
            scan.state = ScanState::Finished;
            drop(scan);
            spa.post_event(Event::RebuildFinish);
        }
        spa.txg().set_scan_active(false);

        let mut core = self.core.lock().unwrap();
        core.ms_done = None;
        drop(core);
        self.cv.notify_all();
        tracing::info!(complete, "rebuild thread exiting");
    }

    /// Issue reconstruction I/O for `[offset, offset + length)` in chunks
    /// of at most `max_asize`.
    fn rebuild(
        &self,
        spa: &Arc<Spa>,
        mut offset: u64,
        mut length: u64,
        max_asize: u64,
    ) {
        while length > 0 && !self.exiting() {
            let chunksz = length.min(max_asize);
            self.rebuild_block(spa, offset, chunksz);
            length -= chunksz;
            offset += chunksz;
        }
    }

    /// Like [`VdevScan::rebuild`], but clipped to redundancy group
    /// boundaries, skipping groups the failed leaf doesn't participate in.
    fn draid_rebuild(&self, spa: &Arc<Spa>, offset: u64, length: u64) {
        let top = spa.tree().get(self.top);
        let (map, unit) = match &top.kind {
            VdevKind::Draid { map, .. } => {
                (map.clone(), 1u64 << top.ashift())
            }
            _ => unreachable!(),
        };
        let failed_pos = match self.failed_position(spa) {
            Some(pos) => pos,
            None => return,
        };

        let mut offset = offset;
        let mut length = length;
        while length > 0 && !self.exiting() {
            let group_left = map.group_bounds(offset, unit).1 - offset;
            let chunksz = length.min(group_left);
            if map.group_degraded(offset, unit, failed_pos) {
                let max = map.max_rebuildable(offset, unit);
                self.rebuild(spa, offset, chunksz, max);
            } else {
                let mut scan = spa.scan();
                scan.examined += chunksz;
                tracing::trace!(offset, chunksz, "skipping healthy group");
            }
            length -= chunksz;
            offset += chunksz;
        }
    }

    /// The index of the failed leaf's branch within the top-level vdev
    fn failed_position(&self, spa: &Arc<Spa>) -> Option<u32> {
        let tree = spa.tree();
        let mut cur = self.oldvd;
        loop {
            let parent = tree.get(cur).parent?;
            if parent == self.top {
                let top = tree.get(self.top);
                return top
                    .children
                    .iter()
                    .position(|c| *c == cur)
                    .map(|p| p as u32);
            }
            cur = parent;
        }
    }

    /// Issue one reconstruction read, throttled by the outstanding-bytes
    /// watermark and the scan-delay policy.
    fn rebuild_block(&self, spa: &Arc<Spa>, offset: u64, asize: u64) {
        let tree = spa.tree();
        let top = tree.get(self.top);
        let nchildren = top.children.len() as u64;

        let mut scan_delay =
            TUNABLES.vdev_scan_delay.load(Ordering::Relaxed);
        if tree.faults_remaining(self.top) == 0 {
            // No redundancy left; run at full speed
            scan_delay = 0;
        }

        let limit = TUNABLES
            .rebuild_mem_limit
            .load(Ordering::Relaxed)
            .min(4 * SPA_MAXBLOCKSIZE * nchildren);
        {
            let mut io = self.io.lock().unwrap();
            while io.outstanding_asize >= limit && !self.exiting() {
                io = self.io_cv.wait(io).unwrap();
            }
            if self.exiting() {
                return;
            }
            io.outstanding_asize += asize;
        }

        if scan_delay != 0 {
            // Recent non-scan I/O means the pool is busy; stay out of
            // its way.
            let idle = TUNABLES.vdev_scan_idle.load(Ordering::Relaxed);
            if lbolt() - top.last_io() <= idle {
                delay(scan_delay);
            }
        }

        let (source, leaf_offset) = match self.pick_source(spa, offset) {
            Some(s) => s,
            None => {
                // Nothing readable; count the I/O as errored
                let mut scan = spa.scan();
                scan.errors += 1;
                drop(scan);
                let mut io = self.io.lock().unwrap();
                io.outstanding_asize -= asize;
                drop(io);
                self.io_cv.notify_all();
                return;
            }
        };

        let mut flags = ZioFlags::default();
        flags.set_scan_thread(true);
        flags.set_raw(true);
        flags.set_canfail(true);
        flags.set_resilver(true);

        let spa2 = spa.clone();
        let svs = spa.vdev_scan().expect("active scan");
        let zio = Zio::read(source, leaf_offset, asize)
            .with_flags(flags)
            .with_priority(ZioPriority::Scrub)
            .with_done(move |zio| {
                let mut scan = spa2.scan();
                scan.examined += asize;
                scan.issued += asize;
                if let Some(e) = zio.error {
                    if e != Error::EINTEGRITY || !zio.flags.speculative()
                    {
                        scan.errors += 1;
                    }
                }
                drop(scan);
                let mut io = svs.io.lock().unwrap();
                debug_assert!(io.outstanding_asize >= asize);
                io.outstanding_asize -= asize;
                drop(io);
                svs.io_cv.notify_all();
            });
        // The repair write is the vdev layer's business; the controller
        // only drives and accounts the reads.
        let _ = tree.submit(zio, spa.io_tq());
    }

    /// Choose a readable leaf (and the leaf-local offset) to source the
    /// reconstruction read from.
    fn pick_source(&self, spa: &Arc<Spa>, offset: u64)
        -> Option<(VdevId, u64)>
    {
        let tree = spa.tree();
        let top = tree.get(self.top);
        match &top.kind {
            VdevKind::Draid { map, .. } => {
                let unit = 1u64 << top.ashift();
                let failed = self.failed_position(spa)?;
                let pos = map
                    .group_children(offset, unit)
                    .iter()
                    .copied()
                    .find(|&p| {
                        p != failed
                            && self
                                .leaf_under(spa, top.children[p as usize])
                                .is_some()
                    })?;
                let leaf =
                    self.leaf_under(spa, top.children[pos as usize])?;
                // One unit per device per logical row span
                let stripe = offset / map.row_span(unit);
                Some((leaf, stripe * unit))
            }
            _ => {
                // Mirror-style: children hold identical copies
                let child = top.children.iter().copied().find(|&c| {
                    !self.contains_oldvd(spa, c)
                        && self.leaf_under(spa, c).is_some()
                })?;
                Some((self.leaf_under(spa, child)?, offset))
            }
        }
    }

    fn contains_oldvd(&self, spa: &Arc<Spa>, id: VdevId) -> bool {
        let tree = spa.tree();
        let mut cur = Some(self.oldvd);
        while let Some(c) = cur {
            if c == id {
                return true;
            }
            cur = tree.get(c).parent;
        }
        false
    }

    /// First readable disk leaf in the subtree
    fn leaf_under(&self, spa: &Arc<Spa>, id: VdevId) -> Option<VdevId> {
        let tree = spa.tree();
        let vd = tree.get(id);
        match &vd.kind {
            VdevKind::Disk { .. } if vd.readable() => Some(id),
            VdevKind::Disk { .. } | VdevKind::DraidSpare => None,
            _ => vd
                .children
                .iter()
                .find_map(|c| self.leaf_under(spa, *c)),
        }
    }

    fn wait_drained(&self) {
        let mut io = self.io.lock().unwrap();
        while io.outstanding_asize != 0 {
            io = self.io_cv.wait(io).unwrap();
        }
    }
}

/// Validate persisted rebuild state and resume from it.
///
/// Returns `ENOENT` if there is nothing (valid) to resume, `ENOTSUP` if
/// the recorded top-level vdev isn't a dRAID.
pub fn restart(spa: &Arc<Spa>) -> Result<()> {
    assert!(spa.vdev_scan().is_none());

    let phys = spa.dir_lookup(DIR_REBUILDING).ok_or(Error::ENOENT)?;
    if phys.len() != 3 {
        return Err(Error::ENOENT);
    }
    let (sr_ms, sr_vdev, sr_oldvd) =
        (phys[0] as i64, phys[1], phys[2]);

    let scan = spa.dir_lookup(DIR_SCAN).ok_or(Error::ENOENT)?;
    if scan.len() != 7
        || scan[0] != scan_func_to_u64(ScanFunc::Rebuild)
        || scan[1] == scan_state_to_u64(ScanState::Finished)
    {
        return Err(Error::ENOENT);
    }

    if sr_vdev == 0 || sr_oldvd == 0 || sr_ms < -1 {
        return Err(Error::ENOENT);
    }

    let tree = spa.tree();
    let tvd = tree
        .lookup_by_guid(Guid(sr_vdev))
        .ok_or(Error::ENOENT)?;
    let oldvd = tree
        .lookup_by_guid(Guid(sr_oldvd))
        .ok_or(Error::ENOENT)?;
    if tree.top_of(oldvd.id) != tvd.id {
        return Err(Error::ENOENT);
    }
    if !matches!(tvd.kind, VdevKind::Draid { .. }) {
        return Err(Error::ENOTSUP);
    }
    let ms_count = spa.metaslabs_of(tvd.id).len() as i64;
    if sr_ms >= ms_count - 1 {
        return Err(Error::ENOENT);
    }

    let pvd_id = oldvd.parent.ok_or(Error::ENOENT)?;
    let pvd = tree.get(pvd_id);
    if !matches!(pvd.kind, VdevKind::Spare) || pvd.children.len() != 2 {
        return Err(Error::ENOENT);
    }
    let dspare = tree.get(pvd.children[1]);
    if !matches!(dspare.kind, VdevKind::DraidSpare)
        || !dspare.resilver_needed()
    {
        return Err(Error::ENOENT);
    }

    tracing::info!(ms = sr_ms + 1, "restarting rebuild");
    let last_synced = spa.txg().generations().synced;
    let oldvd_id = oldvd.id;
    VdevScan::start(
        spa,
        oldvd_id,
        (sr_ms + 1) as usize,
        last_synced + 1 + TXG_CONCURRENT_STATES,
    );
    Ok(())
}

/// A sync task that records the scan setup in the same txg that made the
/// attach durable.
pub fn setup_sync_task() -> SyncTask {
    Box::new(|spa: &Spa, tx: &Tx| {
        if let Some(svs) = spa.vdev_scan() {
            svs.sync_state(spa, tx);
        }
    })
}

fn scan_func_to_u64(f: ScanFunc) -> u64 {
    match f {
        ScanFunc::None => 0,
        ScanFunc::Rebuild => 1,
    }
}

fn scan_state_to_u64(s: ScanState) -> u64 {
    match s {
        ScanState::None => 0,
        ScanState::Scanning => 1,
        ScanState::Finished => 2,
        ScanState::Canceled => 3,
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        objset::MemObjset,
        spa::ScanState,
        vdev::{RamTransport, VdevTree},
    };

    fn mirror_pool_with_data() -> (Arc<Spa>, VdevId, Vec<VdevId>) {
        let mut tree = VdevTree::new();
        let mirror =
            tree.add_node(Some(VdevTree::ROOT), VdevKind::Mirror, 9);
        let disks: Vec<VdevId> = (0..2)
            .map(|_| {
                tree.add_disk(
                    mirror,
                    Arc::new(RamTransport::new(1 << 20)),
                )
            }).collect();
        tree.set_ms_shift(mirror, 16);
        let spa =
            Spa::create("rbpool", tree, Arc::new(MemObjset::new()))
                .unwrap();
        spa.start();

        // Dirty a few metaslabs and sync them out
        let mut th = spa.txg().hold_open();
        let txg = th.txg();
        th.rele_to_quiesce();
        for _ in 0..4 {
            spa.alloc(mirror, 8192, txg).unwrap();
        }
        th.rele_to_sync();
        spa.txg().wait_synced(txg);
        (spa, mirror, disks)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_secs(30);
        while !f() {
            assert!(
                std::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test_log::test]
    fn mirror_rebuild_completes() {
        let (spa, mirror, disks) = mirror_pool_with_data();
        let ms_count = spa.metaslabs_of(mirror).len();

        VdevScan::start(&spa, disks[0], 0, TxgT(0));
        wait_for("scan finish", || {
            spa.scan().state == ScanState::Finished
        });
        let svs = spa.vdev_scan().unwrap();
        assert_eq!(svs.msi_synced(), ms_count as i64 - 1);
        assert!(spa.events().contains(&Event::RebuildFinish));

        // All four 8 KiB allocations were examined and issued
        let scan = *spa.scan();
        assert_eq!(scan.examined, 4 * 8192);
        assert_eq!(scan.issued, 4 * 8192);
        assert_eq!(scan.errors, 0);

        spa.export();
    }

    /// Progress persisted at sync time is the highest contiguous
    /// completed metaslab.
    #[test]
    fn progress_is_persisted() {
        let (spa, mirror, disks) = mirror_pool_with_data();
        let ms_count = spa.metaslabs_of(mirror).len();

        VdevScan::start(&spa, disks[0], 0, TxgT(0));
        wait_for("scan finish", || {
            spa.scan().state == ScanState::Finished
        });
        spa.txg().wait_synced(TxgT(0));

        let phys = spa.dir_lookup(DIR_REBUILDING).unwrap();
        assert_eq!(phys[0] as i64, ms_count as i64 - 1);
        assert_eq!(
            phys[1],
            spa.tree().get(mirror).guid.0
        );
        assert_eq!(phys[2], spa.tree().get(disks[0]).guid.0);
        spa.export();
    }

    #[test]
    fn suspend_stops_cleanly() {
        let (spa, _mirror, disks) = mirror_pool_with_data();
        VdevScan::start(&spa, disks[0], 0, TxgT(0));
        VdevScan::suspend(&spa);
        let svs = spa.vdev_scan().unwrap();
        assert!(svs.core.lock().unwrap().thread.is_none());
        assert_eq!(svs.io.lock().unwrap().outstanding_asize, 0);
        spa.export();
    }

    #[test]
    fn starting_later_skips_earlier_metaslabs() {
        let (spa, mirror, disks) = mirror_pool_with_data();
        let ms_count = spa.metaslabs_of(mirror).len();

        // Allocations all landed in metaslab 0, so starting at 1 scans
        // nothing.
        VdevScan::start(&spa, disks[0], 1, TxgT(0));
        wait_for("scan finish", || {
            spa.scan().state == ScanState::Finished
        });
        let svs = spa.vdev_scan().unwrap();
        assert_eq!(svs.msi_synced(), ms_count as i64 - 1);
        assert_eq!(spa.scan().issued, 0);
        spa.export();
    }

    mod restart_validation {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn no_state_is_enoent() {
            let (spa, _mirror, _disks) = mirror_pool_with_data();
            assert_eq!(restart(&spa).unwrap_err(), Error::ENOENT);
            spa.export();
        }

        /// A mirror top-level can't restart a sequential rebuild
        #[test]
        fn mirror_is_enotsup() {
            let (spa, mirror, disks) = mirror_pool_with_data();
            spa.dir_update(
                DIR_REBUILDING,
                &[
                    0u64,
                    spa.tree().get(mirror).guid.0,
                    spa.tree().get(disks[0]).guid.0,
                ],
            );
            spa.dir_update(
                DIR_SCAN,
                &[1, 1, 8, 32768, 8192, 8192, 0],
            );
            assert_eq!(restart(&spa).unwrap_err(), Error::ENOTSUP);
            spa.export();
        }

        #[test]
        fn finished_scan_is_enoent() {
            let (spa, mirror, disks) = mirror_pool_with_data();
            spa.dir_update(
                DIR_REBUILDING,
                &[
                    0u64,
                    spa.tree().get(mirror).guid.0,
                    spa.tree().get(disks[0]).guid.0,
                ],
            );
            spa.dir_update(
                DIR_SCAN,
                &[1, 2, 8, 32768, 8192, 8192, 0],
            );
            assert_eq!(restart(&spa).unwrap_err(), Error::ENOENT);
            spa.export();
        }
    }
}
// LCOV_EXCL_STOP
