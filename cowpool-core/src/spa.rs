// vim: tw=80
//! The pool itself: ties the txg engine, the vdev tree, the metaslab
//! allocator, and the rebuild controller together, and owns the pool-wide
//! metadata directory.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    metaslab::{FirstFit, Metaslab},
    nvlist::Nvlist,
    objset::{ObjectId, Objset},
    rebuild::VdevScan,
    space_map::SpaceMapObj,
    taskq::Taskq,
    txg::{Tx, TxgState},
    types::{Error, Guid, Result, TxgT, TXG_INITIAL, TXG_SIZE},
    vdev::{AsyncRequest, VdevAux, VdevId, VdevState, VdevTree},
};

/// Object number of the pool's metadata directory
pub const META_DIR_OBJECT: ObjectId = 1;

/// Meta directory key holding rebuild progress
pub const DIR_REBUILDING: &str = "rebuilding";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScanFunc {
    #[default]
    None,
    Rebuild,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScanState {
    #[default]
    None,
    Scanning,
    Finished,
    Canceled,
}

/// Scan bookkeeping, reset at scan setup
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanPhys {
    pub func: ScanFunc,
    pub state: ScanState,
    pub min_txg: TxgT,
    pub max_txg: TxgT,
    /// Bytes the scan expects to visit
    pub to_examine: u64,
    pub examined: u64,
    pub issued: u64,
    pub errors: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    RebuildStart,
    RebuildFinish,
    DeviceRemoval(Guid),
}

pub type SyncTask = Box<dyn FnOnce(&Spa, &Tx) + Send>;

pub struct Spa {
    name: String,
    guid: Guid,
    os: Arc<dyn Objset>,
    tree: VdevTree,
    txg: Arc<TxgState>,
    io_tq: Taskq,
    /// Metaslab arrays, keyed by top-level vdev
    metaslabs: HashMap<VdevId, Vec<Arc<Metaslab>>>,
    meta_dir: Mutex<BTreeMap<String, Vec<u64>>>,
    scan: Mutex<ScanPhys>,
    sync_pass: AtomicU64,
    events: Mutex<Vec<Event>>,
    vdev_scan: Mutex<Option<Arc<VdevScan>>>,
    sync_tasks: [Mutex<Vec<SyncTask>>; TXG_SIZE],
}

impl Spa {
    /// Create a pool over a freshly built vdev tree.  Object
    /// `META_DIR_OBJECT` of `os` becomes the pool directory.
    pub fn create(
        name: &str,
        tree: VdevTree,
        os: Arc<dyn Objset>,
    ) -> Result<Arc<Spa>> {
        let dir = os.create_object();
        assert_eq!(dir, META_DIR_OBJECT);
        tree.open(VdevTree::ROOT)?;

        let mut metaslabs = HashMap::new();
        for top in &tree.get(VdevTree::ROOT).children {
            let vd = tree.get(*top);
            if vd.ms_shift == 0 {
                continue;
            }
            let ms_size = 1u64 << vd.ms_shift;
            let count = (vd.asize() >> vd.ms_shift).max(1) as usize;
            let mss = (0..count)
                .map(|i| {
                    let ms = Metaslab::new(
                        i,
                        i as u64 * ms_size,
                        ms_size,
                        vd.ashift(),
                        &*os,
                        Box::new(FirstFit),
                    );
                    ms.load(&*os)?;
                    Ok(Arc::new(ms))
                }).collect::<Result<Vec<_>>>()?;
            metaslabs.insert(*top, mss);
        }

        Ok(Arc::new(Spa {
            name: name.to_owned(),
            guid: Guid::generate(),
            os,
            tree,
            txg: TxgState::new(TXG_INITIAL),
            io_tq: Taskq::new("spa_io", num_cpus::get()),
            metaslabs,
            meta_dir: Mutex::new(BTreeMap::new()),
            scan: Mutex::new(ScanPhys::default()),
            sync_pass: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            vdev_scan: Mutex::new(None),
            sync_tasks: Default::default(),
        }))
    }

    /// Import a pool whose metadata directory already lives in `os`
    pub fn import(
        name: &str,
        tree: VdevTree,
        os: Arc<dyn Objset>,
    ) -> Result<Arc<Spa>> {
        tree.open(VdevTree::ROOT)?;
        let meta_dir = read_meta_dir(&*os)?;

        let mut metaslabs = HashMap::new();
        for top in &tree.get(VdevTree::ROOT).children {
            let vd = tree.get(*top);
            if vd.ms_shift == 0 {
                continue;
            }
            let ms_size = 1u64 << vd.ms_shift;
            let count = (vd.asize() >> vd.ms_shift).max(1) as usize;
            let mss = (0..count)
                .map(|i| {
                    let key = ms_dir_key(vd.guid, i);
                    let smo = match meta_dir.get(&key) {
                        Some(v) if v.len() == 3 => SpaceMapObj {
                            object: v[0],
                            objsize: v[1],
                            alloc: v[2],
                        },
                        _ => SpaceMapObj {
                            object: os.create_object(),
                            ..Default::default()
                        },
                    };
                    let ms = Metaslab::open(
                        i,
                        i as u64 * ms_size,
                        ms_size,
                        vd.ashift(),
                        smo,
                        Box::new(FirstFit),
                    );
                    ms.load(&*os)?;
                    Ok(Arc::new(ms))
                }).collect::<Result<Vec<_>>>()?;
            metaslabs.insert(*top, mss);
        }

        Ok(Arc::new(Spa {
            name: name.to_owned(),
            guid: Guid::generate(),
            os,
            tree,
            txg: TxgState::new(TXG_INITIAL),
            io_tq: Taskq::new("spa_io", num_cpus::get()),
            metaslabs,
            meta_dir: Mutex::new(meta_dir),
            scan: Mutex::new(ScanPhys::default()),
            sync_pass: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            vdev_scan: Mutex::new(None),
            sync_tasks: Default::default(),
        }))
    }

    /// Start the txg machinery.  Must be called exactly once before any
    /// transactional operation.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.txg.sync_start(move |txg| {
            if let Some(spa) = weak.upgrade() {
                spa.spa_sync(txg);
            }
        });
    }

    /// Stop the rebuild (if any) and the txg threads, syncing everything
    /// out first.
    pub fn export(&self) {
        VdevScan::suspend(self);
        self.txg.sync_stop();
        self.tree.close(VdevTree::ROOT);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn objset(&self) -> &Arc<dyn Objset> {
        &self.os
    }

    pub fn tree(&self) -> &VdevTree {
        &self.tree
    }

    pub fn txg(&self) -> &Arc<TxgState> {
        &self.txg
    }

    pub fn io_tq(&self) -> &Taskq {
        &self.io_tq
    }

    pub fn metaslabs_of(&self, top: VdevId) -> &[Arc<Metaslab>] {
        self.metaslabs
            .get(&top)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn scan(&self) -> std::sync::MutexGuard<'_, ScanPhys> {
        self.scan.lock().unwrap()
    }

    pub fn sync_pass(&self) -> u64 {
        self.sync_pass.load(Ordering::SeqCst)
    }

    pub fn vdev_scan(&self) -> Option<Arc<VdevScan>> {
        self.vdev_scan.lock().unwrap().clone()
    }

    pub(crate) fn set_vdev_scan(&self, svs: Option<Arc<VdevScan>>) {
        *self.vdev_scan.lock().unwrap() = svs;
    }

    pub fn post_event(&self, event: Event) {
        tracing::info!(pool = %self.name, ?event, "pool event");
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Queue a task to run (atomically, exactly once) when `txg` syncs
    pub fn add_sync_task(&self, txg: TxgT, task: SyncTask) {
        self.sync_tasks[txg.slot()].lock().unwrap().push(task);
    }

    // Meta directory

    pub fn dir_update(&self, key: &str, vals: &[u64]) {
        self.meta_dir
            .lock()
            .unwrap()
            .insert(key.to_owned(), vals.to_vec());
    }

    pub fn dir_lookup(&self, key: &str) -> Option<Vec<u64>> {
        self.meta_dir.lock().unwrap().get(key).cloned()
    }

    pub fn dir_remove(&self, key: &str) {
        self.meta_dir.lock().unwrap().remove(key);
    }

    // Allocation, by top-level vdev

    /// Allocate from the first metaslab that can satisfy the request,
    /// skipping any being rebuilt.
    pub fn alloc(&self, top: VdevId, size: u64, txg: TxgT) -> Result<u64> {
        if self.tree.get(top).noalloc.load(Ordering::SeqCst) {
            return Err(Error::ENOSPC);
        }
        for ms in self.metaslabs_of(top) {
            if ms.is_rebuilding() {
                continue;
            }
            match ms.alloc(size, txg) {
                Ok(start) => return Ok(start),
                Err(Error::ENOSPC) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::ENOSPC)
    }

    pub fn claim(
        &self,
        top: VdevId,
        offset: u64,
        size: u64,
        txg: TxgT,
    ) -> Result<()> {
        self.ms_for(top, offset)?.claim(offset, size, txg)
    }

    pub fn free(
        &self,
        top: VdevId,
        offset: u64,
        size: u64,
        txg: TxgT,
    ) -> Result<()> {
        self.ms_for(top, offset)?.free(offset, size, txg);
        Ok(())
    }

    fn ms_for(&self, top: VdevId, offset: u64) -> Result<&Arc<Metaslab>> {
        let ms_shift = self.tree.get(top).ms_shift;
        let idx = (offset >> ms_shift) as usize;
        self.metaslabs_of(top).get(idx).ok_or(Error::EINVAL)
    }

    /// One full sync of `txg`: sync tasks, dirty metaslabs, scan
    /// progress, async requests, and finally the meta directory.
    fn spa_sync(self: &Arc<Self>, txg: TxgT) {
        self.sync_pass.store(1, Ordering::SeqCst);
        let tx = Tx::new(txg);
        tracing::debug!(pool = %self.name, txg = txg.0, "spa_sync");

        let tasks = std::mem::take(
            &mut *self.sync_tasks[txg.slot()].lock().unwrap(),
        );
        for task in tasks {
            task(self, &tx);
        }

        for (top, mss) in &self.metaslabs {
            let guid = self.tree.get(*top).guid;
            for ms in mss {
                if ms.is_dirty(txg) {
                    if let Err(e) =
                        ms.sync(&*self.os, self.sync_pass(), &tx)
                    {
                        tracing::error!(
                            ms = ms.id,
                            error = %e,
                            "metaslab sync failed"
                        );
                        continue;
                    }
                    let smo = ms.smo();
                    self.dir_update(
                        &ms_dir_key(guid, ms.id),
                        &[smo.object, smo.objsize, smo.alloc],
                    );
                }
                ms.sync_done(txg);
            }
        }

        if let Some(svs) = self.vdev_scan() {
            svs.sync_state(self, &tx);
        }

        for req in self.tree.async_queue().drain() {
            match req {
                AsyncRequest::Remove(id) => {
                    let vd = self.tree.get(id);
                    vd.set_state(VdevState::Removed, VdevAux::None);
                    self.tree.state_change(id);
                    self.post_event(Event::DeviceRemoval(vd.guid));
                }
            }
        }

        if let Err(e) = self.persist_meta_dir(&tx) {
            tracing::error!(error = %e, "cannot persist pool directory");
        }
    }

    fn persist_meta_dir(&self, tx: &Tx) -> Result<()> {
        let mut nvl = Nvlist::new();
        for (key, vals) in self.meta_dir.lock().unwrap().iter() {
            nvl.add_uint64_array(key, vals);
        }
        let packed = nvl.pack();
        let mut buf = (packed.len() as u64).to_ne_bytes().to_vec();
        buf.extend_from_slice(&packed);
        self.os.write(META_DIR_OBJECT, 0, &buf, tx)
    }
}

fn ms_dir_key(top_guid: Guid, ms_id: usize) -> String {
    format!("ms:{}:{}", top_guid.0, ms_id)
}

fn read_meta_dir(os: &dyn Objset) -> Result<BTreeMap<String, Vec<u64>>> {
    let len = os.object_len(META_DIR_OBJECT)?;
    if len < 8 {
        return Ok(BTreeMap::new());
    }
    let mut hdr = [0u8; 8];
    os.read(META_DIR_OBJECT, 0, &mut hdr)?;
    let nvlen = u64::from_ne_bytes(hdr) as usize;
    if (nvlen + 8) as u64 > len {
        return Err(Error::EINVAL);
    }
    let mut buf = vec![0u8; nvlen];
    os.read(META_DIR_OBJECT, 8, &mut buf)?;
    let nvl = Nvlist::unpack(&buf)?;
    let mut dir = BTreeMap::new();
    for pair in nvl.pairs() {
        if let Ok(vals) = nvl.lookup_uint64_array(&pair.name) {
            dir.insert(pair.name.clone(), vals.to_vec());
        }
    }
    Ok(dir)
}

// LCOV_EXCL_STOP
