// vim: tw=80
//! The virtual device tree.
//!
//! Vdevs form a strict tree: interior nodes (mirror, raidz, draid, spare)
//! aggregate children, and leaves talk to physical devices.  The tree is an
//! arena of nodes addressed by stable indices; children are index vectors
//! and the parent backreference is non-owning.

pub mod draid;
mod label;
mod leaf;

pub use draid::DraidMap;
pub use label::{
    decode_phys, encode_phys, label_offset, read_config,
    repair_label_cksum, write_all_labels, LabelVerdict, VDEV_LABELS,
    VDEV_LABEL_SIZE, VDEV_PHYS_SIZE, VDEV_SKIP_SIZE,
};
pub use leaf::{
    DiscardCap, DiskStatus, FileTransport, LeafGeometry, LeafTransport,
    RamTransport, TransportResult,
};

use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
    Arc, Condvar, Mutex,
};

use atomic_enum::atomic_enum;

use crate::{
    types::{Error, Guid},
    util::lbolt,
    zio::{Zio, ZioControl, ZioType},
};

/// Stable index of a vdev within its tree
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VdevId(pub usize);

/// Overall health of a vdev
#[atomic_enum]
#[derive(Eq, PartialEq, PartialOrd)]
pub enum VdevState {
    Unknown,
    Closed,
    Offline,
    Removed,
    CantOpen,
    Faulted,
    Degraded,
    Healthy,
}

/// Why a vdev cannot be opened (or was faulted)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum VdevAux {
    #[default]
    None,
    OpenFailed,
    BadLabel,
    CorruptData,
    SplitPool,
    TooSmall,
    IoFailure,
}

/// Structural role of a node, with its per-variant data
pub enum VdevKind {
    Root,
    Mirror,
    RaidZ {
        nparity: u8,
    },
    Draid {
        map: DraidMap,
        nparity: u8,
    },
    /// Interior node pairing a failing device with its replacement
    Spare,
    /// A leaf backed by a physical device (or file)
    Disk {
        transport: Arc<dyn LeafTransport>,
    },
    /// A leaf backed by distributed spare space within a dRAID
    DraidSpare,
}

impl std::fmt::Debug for VdevKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VdevKind::Root => write!(f, "Root"),
            VdevKind::Mirror => write!(f, "Mirror"),
            VdevKind::RaidZ { nparity } => {
                write!(f, "RaidZ{nparity}")
            }
            VdevKind::Draid { map, nparity } => write!(
                f,
                "Draid{nparity}(d={} g={} s={})",
                map.ndevs(),
                map.ngroups(),
                map.nspares()
            ),
            VdevKind::Spare => write!(f, "Spare"),
            VdevKind::Disk { .. } => write!(f, "Disk"),
            VdevKind::DraidSpare => write!(f, "DraidSpare"),
        }
    }
}

/// Requests a vdev wants the pool to service asynchronously
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncRequest {
    Remove(VdevId),
}

/// Queue of async requests, shared by every vdev in a tree
#[derive(Debug, Default)]
pub struct AsyncQueue {
    queue: Mutex<Vec<AsyncRequest>>,
    cv: Condvar,
}

impl AsyncQueue {
    pub fn post(&self, req: AsyncRequest) {
        let mut q = self.queue.lock().unwrap();
        q.push(req);
        self.cv.notify_all();
    }

    pub fn drain(&self) -> Vec<AsyncRequest> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }
}

/// One node of the vdev tree
pub struct Vdev {
    pub id: VdevId,
    pub guid: Guid,
    pub parent: Option<VdevId>,
    pub children: Vec<VdevId>,
    pub kind: VdevKind,
    state: AtomicVdevState,
    aux: Mutex<VdevAux>,
    /// log2 of the smallest addressable unit; leaves refine it at open
    ashift: AtomicU8,
    /// addressable bytes, set at open
    asize: AtomicU64,
    /// log2 of the metaslab size; top-level vdevs only
    pub ms_shift: u8,
    // Leaf I/O latches and flags
    nowritecache: AtomicBool,
    delayed_close: AtomicBool,
    remove_wanted: AtomicBool,
    pub scan_removing: AtomicBool,
    pub resilver_deferred: AtomicBool,
    pub noalloc: AtomicBool,
    resilver_needed: AtomicBool,
    /// Tick stamp of the last non-scan I/O
    last_io: AtomicI64,
    // Error accumulation, leaves only
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub slow_ios: AtomicU64,
    async_queue: Arc<AsyncQueue>,
}

/// Read errors accumulated before a healthy leaf is marked degraded
const DEGRADE_THRESHOLD: u64 = 10;
/// ... and before a degraded leaf is faulted
const FAULT_THRESHOLD: u64 = 100;

impl Vdev {
    pub fn state(&self) -> VdevState {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: VdevState, aux: VdevAux) {
        let old = self.state.swap(state, Ordering::SeqCst);
        *self.aux.lock().unwrap() = aux;
        if old != state {
            tracing::info!(
                vdev = self.id.0,
                guid = self.guid.0,
                ?old,
                new = ?state,
                ?aux,
                "vdev state change"
            );
        }
    }

    pub fn aux(&self) -> VdevAux {
        *self.aux.lock().unwrap()
    }

    pub fn asize(&self) -> u64 {
        self.asize.load(Ordering::SeqCst)
    }

    pub fn ashift(&self) -> u8 {
        self.ashift.load(Ordering::SeqCst)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, VdevKind::Disk { .. } | VdevKind::DraidSpare)
    }

    pub fn readable(&self) -> bool {
        matches!(self.state(), VdevState::Healthy | VdevState::Degraded)
    }

    pub fn writeable(&self) -> bool {
        matches!(self.state(), VdevState::Healthy | VdevState::Degraded)
    }

    pub fn nowritecache(&self) -> bool {
        self.nowritecache.load(Ordering::SeqCst)
    }

    /// Discard capability of the underlying device, for leaves that have
    /// one
    pub fn discard_capability(&self) -> DiscardCap {
        self.transport()
            .map(|x| x.geometry().discard)
            .unwrap_or(DiscardCap::None)
    }

    pub fn delayed_close(&self) -> bool {
        self.delayed_close.load(Ordering::SeqCst)
    }

    pub fn remove_wanted(&self) -> bool {
        self.remove_wanted.load(Ordering::SeqCst)
    }

    pub fn resilver_needed(&self) -> bool {
        self.resilver_needed.load(Ordering::SeqCst)
    }

    pub fn set_resilver_needed(&self, v: bool) {
        self.resilver_needed.store(v, Ordering::SeqCst);
    }

    pub fn last_io(&self) -> i64 {
        self.last_io.load(Ordering::SeqCst)
    }

    pub fn stamp_last_io(&self) {
        self.last_io.store(lbolt(), Ordering::SeqCst);
    }

    fn transport(&self) -> crate::types::Result<&Arc<dyn LeafTransport>> {
        match &self.kind {
            VdevKind::Disk { transport } => Ok(transport),
            _ => Err(Error::ENOTSUP),
        }
    }

    /// Record an I/O failure against a leaf and escalate its state if the
    /// error count warrants.
    pub(crate) fn account_error(&self, ztype: ZioType) {
        let counter = match ztype {
            ZioType::Read => &self.read_errors,
            ZioType::Write => &self.write_errors,
            _ => return,
        };
        let total = counter.fetch_add(1, Ordering::SeqCst) + 1
            + match ztype {
                ZioType::Read => self.write_errors.load(Ordering::SeqCst),
                _ => self.read_errors.load(Ordering::SeqCst),
            };
        match self.state() {
            VdevState::Healthy if total >= DEGRADE_THRESHOLD => {
                self.set_state(VdevState::Degraded, VdevAux::IoFailure);
            }
            VdevState::Degraded if total >= FAULT_THRESHOLD => {
                self.set_state(VdevState::Faulted, VdevAux::IoFailure);
            }
            _ => {}
        }
    }
}

/// An arena of vdevs rooted at a single `Root` node
pub struct VdevTree {
    nodes: Vec<Arc<Vdev>>,
    async_queue: Arc<AsyncQueue>,
}

impl VdevTree {
    pub fn new() -> Self {
        let async_queue = Arc::new(AsyncQueue::default());
        let mut tree = VdevTree { nodes: Vec::new(), async_queue };
        tree.add_node(None, VdevKind::Root, 0);
        tree
    }

    pub const ROOT: VdevId = VdevId(0);

    pub fn add_node(
        &mut self,
        parent: Option<VdevId>,
        kind: VdevKind,
        ashift: u8,
    ) -> VdevId {
        let id = VdevId(self.nodes.len());
        let vdev = Vdev {
            id,
            guid: Guid::generate(),
            parent,
            children: Vec::new(),
            kind,
            state: AtomicVdevState::new(VdevState::Unknown),
            aux: Mutex::new(VdevAux::None),
            ashift: AtomicU8::new(ashift),
            asize: AtomicU64::new(0),
            ms_shift: 0,
            nowritecache: AtomicBool::new(false),
            delayed_close: AtomicBool::new(false),
            remove_wanted: AtomicBool::new(false),
            scan_removing: AtomicBool::new(false),
            resilver_deferred: AtomicBool::new(false),
            noalloc: AtomicBool::new(false),
            resilver_needed: AtomicBool::new(false),
            last_io: AtomicI64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            slow_ios: AtomicU64::new(0),
            async_queue: self.async_queue.clone(),
        };
        self.nodes.push(Arc::new(vdev));
        if let Some(pid) = parent {
            let parent_node = Arc::get_mut(&mut self.nodes[pid.0])
                .expect("tree construction must finish before sharing");
            parent_node.children.push(id);
        }
        id
    }

    /// Add a leaf disk under `parent`
    pub fn add_disk(
        &mut self,
        parent: VdevId,
        transport: Arc<dyn LeafTransport>,
    ) -> VdevId {
        self.add_node(Some(parent), VdevKind::Disk { transport }, 0)
    }

    /// Set the metaslab shift of a top-level vdev.  Only valid during tree
    /// construction.
    pub fn set_ms_shift(&mut self, id: VdevId, ms_shift: u8) {
        let node = Arc::get_mut(&mut self.nodes[id.0])
            .expect("tree construction must finish before sharing");
        node.ms_shift = ms_shift;
    }

    /// Assign the on-disk guid recorded in the config, replacing the
    /// generated one.  Only valid during tree construction.
    pub fn set_guid(&mut self, id: VdevId, guid: Guid) {
        let node = Arc::get_mut(&mut self.nodes[id.0])
            .expect("tree construction must finish before sharing");
        node.guid = guid;
    }

    pub fn get(&self, id: VdevId) -> &Arc<Vdev> {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vdev>> {
        self.nodes.iter()
    }

    pub fn async_queue(&self) -> &Arc<AsyncQueue> {
        &self.async_queue
    }

    pub fn lookup_by_guid(&self, guid: Guid) -> Option<&Arc<Vdev>> {
        self.nodes.iter().find(|vd| vd.guid == guid)
    }

    /// The top-level ancestor of `id` (the child of the root)
    pub fn top_of(&self, id: VdevId) -> VdevId {
        let mut cur = id;
        loop {
            let node = self.get(cur);
            match node.parent {
                None | Some(Self::ROOT) => break cur,
                Some(p) => cur = p,
            }
        }
    }

    /// Open a vdev and everything below it, computing asize and state
    pub fn open(&self, id: VdevId) -> crate::types::Result<()> {
        let vd = self.get(id);
        match &vd.kind {
            VdevKind::Disk { transport } => match transport.open() {
                Ok(geom) => {
                    vd.ashift.store(
                        geom.ashift.max(vd.ashift()),
                        Ordering::SeqCst,
                    );
                    vd.asize.store(geom.asize, Ordering::SeqCst);
                    // Clear the latch so a reopened device gets another
                    // chance at cache flushes.
                    vd.nowritecache.store(false, Ordering::SeqCst);
                    vd.set_state(VdevState::Healthy, VdevAux::None);
                    Ok(())
                }
                Err(e) => {
                    vd.set_state(VdevState::CantOpen, VdevAux::OpenFailed);
                    Err(e)
                }
            },
            VdevKind::DraidSpare => {
                vd.set_state(VdevState::Healthy, VdevAux::None);
                Ok(())
            }
            _ => {
                let mut healthy = 0usize;
                let mut min_child_asize = u64::MAX;
                for child in &vd.children {
                    if self.open(*child).is_ok() {
                        healthy += 1;
                        // Distributed spares have no capacity of their
                        // own and must not drag the minimum down.
                        let ca = self.get(*child).asize();
                        if ca > 0 {
                            min_child_asize = min_child_asize.min(ca);
                        }
                    }
                }
                let asize =
                    self.compute_asize(id, min_child_asize, healthy);
                vd.asize.store(asize, Ordering::SeqCst);
                self.state_change(id);
                if vd.readable() {
                    Ok(())
                } else {
                    Err(Error::ENXIO)
                }
            }
        }
    }

    pub fn close(&self, id: VdevId) {
        let vd = self.get(id);
        if let VdevKind::Disk { transport } = &vd.kind {
            transport.close();
        }
        for child in &vd.children {
            self.close(*child);
        }
        vd.set_state(VdevState::Closed, VdevAux::None);
    }

    /// Bytes of physical capacity this vdev offers, given its childrens'
    fn compute_asize(
        &self,
        id: VdevId,
        min_child_asize: u64,
        nchildren: usize,
    ) -> u64 {
        if nchildren == 0 || min_child_asize == u64::MAX {
            return 0;
        }
        let vd = self.get(id);
        match &vd.kind {
            // A mirror is as big as its smallest child
            VdevKind::Mirror | VdevKind::Spare | VdevKind::Root => {
                min_child_asize
            }
            // Striped layouts scale with the data columns
            VdevKind::RaidZ { .. } => {
                min_child_asize * nchildren as u64
            }
            VdevKind::Draid { map, .. } => {
                min_child_asize * (map.ndevs() - map.nspares()) as u64
            }
            VdevKind::Disk { .. } | VdevKind::DraidSpare => min_child_asize,
        }
    }

    /// Recompute an interior vdev's state from its children's, and
    /// propagate to its ancestors.
    pub fn state_change(&self, id: VdevId) {
        let vd = self.get(id);
        if !vd.is_leaf() {
            let (total, healthy, usable) = vd.children.iter().fold(
                (0usize, 0usize, 0usize),
                |(t, h, u), c| {
                    let cs = self.get(*c).state();
                    (
                        t + 1,
                        h + usize::from(cs == VdevState::Healthy),
                        u + usize::from(
                            cs == VdevState::Healthy
                                || cs == VdevState::Degraded,
                        ),
                    )
                },
            );
            let faults_tolerated = match &vd.kind {
                VdevKind::Mirror | VdevKind::Spare | VdevKind::Root => {
                    total.saturating_sub(1)
                }
                VdevKind::RaidZ { nparity }
                | VdevKind::Draid { nparity, .. } => *nparity as usize,
                _ => 0,
            };
            let state = if usable == total && healthy == total {
                VdevState::Healthy
            } else if total - usable <= faults_tolerated {
                VdevState::Degraded
            } else {
                VdevState::Faulted
            };
            vd.set_state(state, VdevAux::None);
        }
        if let Some(parent) = vd.parent {
            self.state_change(parent);
        }
    }

    /// How many faults until this top-level vdev loses data?  Zero means no
    /// redundancy remains.
    pub fn faults_remaining(&self, id: VdevId) -> usize {
        let vd = self.get(id);
        let unusable = vd
            .children
            .iter()
            .filter(|c| !self.get(**c).readable())
            .count();
        let tolerated = match &vd.kind {
            VdevKind::Mirror | VdevKind::Spare => {
                vd.children.len().saturating_sub(1)
            }
            VdevKind::RaidZ { nparity }
            | VdevKind::Draid { nparity, .. } => *nparity as usize,
            _ => 0,
        };
        tolerated.saturating_sub(unusable)
    }

    /// Start a request against a leaf.  Returns `Continue` if the request
    /// was completed (or refused) inline; `Stop` if it was accepted and
    /// will be interrupted on completion.
    pub fn io_start(
        &self,
        zio: Zio,
        tq: &crate::taskq::Taskq,
    ) -> (ZioControl, Option<Zio>) {
        let vd = match zio.vd {
            Some(id) => self.get(id).clone(),
            None => {
                let mut zio = zio;
                zio.set_error(Error::EINVAL);
                return (ZioControl::Continue, Some(zio));
            }
        };
        leaf::io_start(vd, zio, tq)
    }

    /// Submit a request and run the completion policy inline if `io_start`
    /// didn't take it.  Returns a waiter for the caller to block on.
    pub fn submit(
        &self,
        zio: Zio,
        tq: &crate::taskq::Taskq,
    ) -> crate::zio::ZioWaiter {
        let waiter = zio.waiter();
        if let (ZioControl::Continue, Some(zio)) = self.io_start(zio, tq) {
            zio.interrupt();
        }
        waiter
    }
}

impl Default for VdevTree {
    fn default() -> Self {
        Self::new()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ram_mirror(nchildren: usize) -> (VdevTree, VdevId, Vec<VdevId>) {
        let mut tree = VdevTree::new();
        let mirror =
            tree.add_node(Some(VdevTree::ROOT), VdevKind::Mirror, 9);
        let disks = (0..nchildren)
            .map(|_| {
                let xport = Arc::new(RamTransport::new(1 << 20));
                tree.add_disk(mirror, xport)
            }).collect();
        tree.open(VdevTree::ROOT).unwrap();
        (tree, mirror, disks)
    }

    mod topology {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn top_of_leaf() {
            let (tree, mirror, disks) = ram_mirror(2);
            assert_eq!(tree.top_of(disks[0]), mirror);
            assert_eq!(tree.top_of(mirror), mirror);
        }

        #[test]
        fn lookup_by_guid() {
            let (tree, _mirror, disks) = ram_mirror(2);
            let guid = tree.get(disks[1]).guid;
            assert_eq!(tree.lookup_by_guid(guid).unwrap().id, disks[1]);
            assert!(tree.lookup_by_guid(Guid(0)).is_none());
        }
    }

    mod state {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn open_makes_healthy() {
            let (tree, mirror, disks) = ram_mirror(2);
            assert_eq!(tree.get(disks[0]).state(), VdevState::Healthy);
            assert_eq!(tree.get(mirror).state(), VdevState::Healthy);
            assert_eq!(
                tree.get(VdevTree::ROOT).state(),
                VdevState::Healthy
            );
        }

        #[test]
        fn mirror_degrades_then_faults() {
            let (tree, mirror, disks) = ram_mirror(2);
            tree.get(disks[0])
                .set_state(VdevState::Removed, VdevAux::None);
            tree.state_change(disks[0]);
            assert_eq!(tree.get(mirror).state(), VdevState::Degraded);

            tree.get(disks[1])
                .set_state(VdevState::Faulted, VdevAux::IoFailure);
            tree.state_change(disks[1]);
            assert_eq!(tree.get(mirror).state(), VdevState::Faulted);
        }

        #[test]
        fn faults_remaining() {
            let (tree, mirror, disks) = ram_mirror(3);
            assert_eq!(tree.faults_remaining(mirror), 2);
            tree.get(disks[0])
                .set_state(VdevState::Faulted, VdevAux::IoFailure);
            assert_eq!(tree.faults_remaining(mirror), 1);
        }

        #[test]
        fn error_accumulation_escalates() {
            let (tree, _mirror, disks) = ram_mirror(2);
            let vd = tree.get(disks[0]);
            for _ in 0..DEGRADE_THRESHOLD {
                vd.account_error(ZioType::Read);
            }
            assert_eq!(vd.state(), VdevState::Degraded);
            for _ in 0..FAULT_THRESHOLD {
                vd.account_error(ZioType::Write);
            }
            assert_eq!(vd.state(), VdevState::Faulted);
        }
    }

    mod asize {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn mirror_is_min_child() {
            let mut tree = VdevTree::new();
            let mirror =
                tree.add_node(Some(VdevTree::ROOT), VdevKind::Mirror, 9);
            tree.add_disk(mirror, Arc::new(RamTransport::new(1 << 20)));
            tree.add_disk(mirror, Arc::new(RamTransport::new(1 << 21)));
            tree.open(VdevTree::ROOT).unwrap();
            assert_eq!(tree.get(mirror).asize(), 1 << 20);
        }

        #[test]
        fn raidz_scales_with_children() {
            let mut tree = VdevTree::new();
            let raidz = tree.add_node(
                Some(VdevTree::ROOT),
                VdevKind::RaidZ { nparity: 1 },
                9,
            );
            for _ in 0..4 {
                tree.add_disk(raidz, Arc::new(RamTransport::new(1 << 20)));
            }
            tree.open(VdevTree::ROOT).unwrap();
            assert_eq!(tree.get(raidz).asize(), 4 << 20);
        }
    }

    mod async_queue {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn post_and_drain() {
            let (tree, _mirror, disks) = ram_mirror(2);
            tree.async_queue().post(AsyncRequest::Remove(disks[0]));
            assert_eq!(
                tree.async_queue().drain(),
                vec![AsyncRequest::Remove(disks[0])]
            );
            assert!(tree.async_queue().drain().is_empty());
        }
    }
}
// LCOV_EXCL_STOP
