// vim: tw=80
//! Pool-wide transaction groups.
//!
//! Three generations are live at once: open, quiescing, and syncing.  Writers
//! hold the open txg; a dedicated quiesce thread freezes it and waits out the
//! holders; a dedicated sync thread consumes quiesced txgs and makes them
//! durable.  Commit callbacks run on a worker pool strictly after their txg
//! has synced.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
};

use crate::{
    taskq::Taskq,
    types::{TxgT, TXG_DEFER_SIZE, TXG_SIZE},
    util::{lbolt, HZ, TUNABLES},
};

/// A transaction: the handle the object layer uses to tag writes with the
/// txg they must commit in.
#[derive(Clone, Copy, Debug)]
pub struct Tx {
    txg: TxgT,
}

impl Tx {
    pub fn new(txg: TxgT) -> Self {
        Tx { txg }
    }

    pub fn txg(&self) -> TxgT {
        self.txg
    }
}

pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TxCpuCore {
    count: [u64; TXG_SIZE],
    callbacks: [Vec<CommitCallback>; TXG_SIZE],
}

struct TxCpu {
    lock: Mutex<TxCpuCore>,
    cv: [Condvar; TXG_SIZE],
}

impl TxCpu {
    fn new() -> Self {
        TxCpu {
            lock: Mutex::new(TxCpuCore::default()),
            cv: Default::default(),
        }
    }
}

#[derive(Default)]
struct TxSyncCore {
    /// txg currently being frozen by the quiesce thread, or 0
    quiescing_txg: TxgT,
    /// quiesced txg waiting for the sync thread, or 0
    quiesced_txg: TxgT,
    /// txg currently inside spa_sync, or 0
    syncing_txg: TxgT,
    /// last fully synced txg
    synced_txg: TxgT,
    sync_txg_waiting: TxgT,
    quiesce_txg_waiting: TxgT,
    exiting: bool,
    threads: u32,
}

/// Observed generation numbers, for diagnostics and assertions
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxgGenerations {
    pub open: TxgT,
    pub quiescing: TxgT,
    pub quiesced: TxgT,
    pub syncing: TxgT,
    pub synced: TxgT,
}

/// Per-pool transaction group state.  Exactly one exists per open pool.
pub struct TxgState {
    cpu: Box<[TxCpu]>,
    /// The txg new holders bind to.  Written only while every per-CPU lock
    /// is held.
    open_txg: AtomicU64,
    sync: Mutex<TxSyncCore>,
    sync_more_cv: Condvar,
    sync_done_cv: Condvar,
    quiesce_more_cv: Condvar,
    quiesce_done_cv: Condvar,
    exit_cv: Condvar,
    /// Set while a scan (rebuild) is active; keeps the sync thread cycling
    scan_active: AtomicBool,
    commit_cb_taskq: Mutex<Option<Taskq>>,
    joins: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

/// A hold on the open transaction group.  Until `rele_to_quiesce`, the
/// holder also pins its CPU slot's lock, which blocks quiescence outright;
/// afterwards only the slot count does.
pub struct TxgHandle<'a> {
    state: &'a TxgState,
    cpu_idx: usize,
    txg: TxgT,
    guard: Option<MutexGuard<'a, TxCpuCore>>,
}

impl TxgState {
    pub fn new(txg: TxgT) -> Arc<Self> {
        let ncpus = num_cpus::get();
        let cpu = (0..ncpus).map(|_| TxCpu::new()).collect();
        Arc::new(TxgState {
            cpu,
            open_txg: AtomicU64::new(txg.0),
            sync: Mutex::new(TxSyncCore::default()),
            sync_more_cv: Condvar::new(),
            sync_done_cv: Condvar::new(),
            quiesce_more_cv: Condvar::new(),
            quiesce_done_cv: Condvar::new(),
            exit_cv: Condvar::new(),
            scan_active: AtomicBool::new(false),
            commit_cb_taskq: Mutex::new(None),
            joins: Mutex::new(Vec::new()),
        })
    }

    fn open(&self) -> TxgT {
        TxgT(self.open_txg.load(Ordering::SeqCst))
    }

    pub fn generations(&self) -> TxgGenerations {
        let core = self.sync.lock().unwrap();
        TxgGenerations {
            open: self.open(),
            quiescing: core.quiescing_txg,
            quiesced: core.quiesced_txg,
            syncing: core.syncing_txg,
            synced: core.synced_txg,
        }
    }

    pub fn set_scan_active(&self, active: bool) {
        self.scan_active.store(active, Ordering::SeqCst);
        if active {
            let _core = self.sync.lock().unwrap();
            self.sync_more_cv.notify_all();
        }
    }

    /// Start the quiesce and sync threads.  `sync_fn` is called once per
    /// consumed txg, outside all engine locks.
    pub fn sync_start(
        self: &Arc<Self>,
        sync_fn: impl Fn(TxgT) + Send + 'static,
    ) {
        let mut core = self.sync.lock().unwrap();
        assert_eq!(core.threads, 0);
        core.threads = 2;
        drop(core);

        let this = self.clone();
        let quiesce = std::thread::Builder::new()
            .name("txg_quiesce".to_owned())
            .spawn(move || this.quiesce_thread())
            .unwrap();
        let this = self.clone();
        let sync = std::thread::Builder::new()
            .name("txg_sync".to_owned())
            .spawn(move || this.sync_thread(sync_fn))
            .unwrap();
        self.joins.lock().unwrap().extend([quiesce, sync]);
    }

    /// Stop both threads, after syncing out everything in flight including
    /// deferred frees.
    pub fn sync_stop(&self) {
        self.wait_synced(self.open() + TXG_DEFER_SIZE);

        let mut core = self.sync.lock().unwrap();
        assert_eq!(core.threads, 2);
        core.exiting = true;
        self.quiesce_more_cv.notify_all();
        self.quiesce_done_cv.notify_all();
        self.sync_more_cv.notify_all();
        while core.threads != 0 {
            core = self.exit_cv.wait(core).unwrap();
        }
        core.exiting = false;
        drop(core);

        for jh in self.joins.lock().unwrap().drain(..) {
            let _ = jh.join();
        }
        if let Some(tq) = self.commit_cb_taskq.lock().unwrap().take() {
            tq.destroy();
        }
    }

    /// Bind the calling thread to the open txg
    pub fn hold_open(&self) -> TxgHandle<'_> {
        let cpu_idx = cpu_seqid(self.cpu.len());
        let tc = &self.cpu[cpu_idx];
        let mut guard = tc.lock.lock().unwrap();

        let txg = self.open();
        guard.count[txg.slot()] += 1;

        TxgHandle { state: self, cpu_idx, txg, guard: Some(guard) }
    }

    fn quiesce(&self, txg: TxgT) {
        // Take every per-CPU lock, in index order, so nobody else can enter
        // this txg.
        let guards: Vec<_> = self
            .cpu
            .iter()
            .map(|tc| tc.lock.lock().unwrap())
            .collect();

        debug_assert_eq!(txg, self.open());
        self.open_txg.store(txg.0 + 1, Ordering::SeqCst);

        // Holders may enter the next txg as soon as the locks drop
        drop(guards);

        // Wait for everyone still in `txg` to rele_to_sync
        let g = txg.slot();
        for tc in self.cpu.iter() {
            let mut guard = tc.lock.lock().unwrap();
            while guard.count[g] != 0 {
                guard = tc.cv[g].wait(guard).unwrap();
            }
        }
    }

    /// Dispatch the commit callbacks registered on `txg` to worker threads
    fn dispatch_callbacks(&self, txg: TxgT) {
        let g = txg.slot();
        for tc in self.cpu.iter() {
            let mut guard = tc.lock.lock().unwrap();
            if guard.callbacks[g].is_empty() {
                continue;
            }
            let cbs = std::mem::take(&mut guard.callbacks[g]);
            drop(guard);

            let mut tq_guard = self.commit_cb_taskq.lock().unwrap();
            let tq = tq_guard.get_or_insert_with(|| {
                Taskq::new("tx_commit_cb", num_cpus::get())
            });
            tq.dispatch(move || {
                for cb in cbs {
                    cb();
                }
            }).unwrap();
        }
    }

    fn sync_thread(self: Arc<Self>, sync_fn: impl Fn(TxgT)) {
        let mut start = 0i64;
        let mut delta = 0i64;
        let mut core = self.sync.lock().unwrap();
        loop {
            let timeout =
                TUNABLES.txg_timeout.load(Ordering::Relaxed) as i64 * HZ;

            // Sync when scanning, when someone is waiting on us, when the
            // quiesce thread has handed off a txg, or at the timeout.
            let mut timer = if delta >= timeout { 0 } else { timeout - delta };
            while !self.scan_active.load(Ordering::SeqCst)
                && !core.exiting
                && timer > 0
                && core.synced_txg >= core.sync_txg_waiting
                && core.quiesced_txg == TxgT(0)
            {
                tracing::trace!(
                    synced = core.synced_txg.0,
                    waiting = core.sync_txg_waiting.0,
                    "sync thread waiting"
                );
                let ms = (timer * 1000 / HZ) as u64;
                let (guard, _) = self
                    .sync_more_cv
                    .wait_timeout(
                        core,
                        std::time::Duration::from_millis(ms),
                    ).unwrap();
                core = guard;
                delta = lbolt() - start;
                timer = if delta > timeout { 0 } else { timeout - delta };
            }

            // Wait for a quiesced txg, prodding the quiesce thread if
            // necessary.
            while !core.exiting && core.quiesced_txg == TxgT(0) {
                let open = self.open();
                if core.quiesce_txg_waiting < open + 1 {
                    core.quiesce_txg_waiting = open + 1;
                }
                self.quiesce_more_cv.notify_all();
                core = self.quiesce_done_cv.wait(core).unwrap();
            }

            if core.exiting {
                core.threads -= 1;
                self.exit_cv.notify_all();
                return;
            }

            let txg = core.quiesced_txg;
            core.quiesced_txg = TxgT(0);
            core.syncing_txg = txg;
            self.quiesce_more_cv.notify_all();
            drop(core);

            tracing::debug!(txg = txg.0, "syncing");
            start = lbolt();
            sync_fn(txg);
            delta = lbolt() - start;

            core = self.sync.lock().unwrap();
            core.synced_txg = txg;
            core.syncing_txg = TxgT(0);
            self.sync_done_cv.notify_all();

            self.dispatch_callbacks(txg);
        }
    }

    fn quiesce_thread(self: Arc<Self>) {
        let mut core = self.sync.lock().unwrap();
        loop {
            // Only one txg may sit in "quiescing or quiesced, waiting to
            // sync" at a time.
            while !core.exiting
                && (self.open() >= core.quiesce_txg_waiting
                    || core.quiesced_txg != TxgT(0))
            {
                core = self.quiesce_more_cv.wait(core).unwrap();
            }

            if core.exiting {
                core.threads -= 1;
                self.exit_cv.notify_all();
                return;
            }

            let txg = self.open();
            core.quiescing_txg = txg;
            drop(core);

            tracing::debug!(txg = txg.0, "quiescing");
            self.quiesce(txg);

            core = self.sync.lock().unwrap();
            // Hand off to the sync thread
            core.quiescing_txg = TxgT(0);
            core.quiesced_txg = txg;
            self.sync_more_cv.notify_all();
            self.quiesce_done_cv.notify_all();
        }
    }

    /// Delay the caller by up to `ticks` if it still holds the open txg and
    /// a quiescing or quiesced txg already exists.  Returns early if the
    /// caller's txg starts to quiesce.
    pub fn delay(&self, txg: TxgT, ticks: i64) {
        let timeout = lbolt() + ticks;

        // Don't delay if this txg could quiesce immediately
        if self.open() > txg {
            return;
        }
        let mut core = self.sync.lock().unwrap();
        if self.open() > txg || core.synced_txg == txg - 1 {
            return;
        }

        while lbolt() < timeout
            && core.syncing_txg < txg - 1
            && core.quiesce_txg_waiting <= self.open()
        {
            let ms = ((timeout - lbolt()).max(1) * 1000 / HZ) as u64;
            let (guard, _) = self
                .quiesce_more_cv
                .wait_timeout(core, std::time::Duration::from_millis(ms))
                .unwrap();
            core = guard;
        }
    }

    /// Block until `txg` (or, for 0, everything currently dirty plus
    /// deferred frees) has synced.
    pub fn wait_synced(&self, txg: TxgT) {
        let mut core = self.sync.lock().unwrap();
        debug_assert_eq!(core.threads, 2);
        let txg = if txg == TxgT(0) {
            self.open() + TXG_DEFER_SIZE
        } else {
            txg
        };
        if core.sync_txg_waiting < txg {
            core.sync_txg_waiting = txg;
        }
        tracing::debug!(
            txg = txg.0,
            quiesce_waiting = core.quiesce_txg_waiting.0,
            sync_waiting = core.sync_txg_waiting.0,
            "wait_synced"
        );
        while core.synced_txg < txg {
            self.sync_more_cv.notify_all();
            core = self.sync_done_cv.wait(core).unwrap();
        }
    }

    /// Block until `txg` (default: the next txg) is open
    pub fn wait_open(&self, txg: TxgT) {
        let mut core = self.sync.lock().unwrap();
        debug_assert_eq!(core.threads, 2);
        let txg = if txg == TxgT(0) { self.open() + 1 } else { txg };
        if core.quiesce_txg_waiting < txg {
            core.quiesce_txg_waiting = txg;
        }
        while self.open() < txg {
            self.quiesce_more_cv.notify_all();
            core = self.quiesce_done_cv.wait(core).unwrap();
        }
    }

    /// Is somebody waiting for the open txg to quiesce?
    pub fn stalled(&self) -> bool {
        let core = self.sync.lock().unwrap();
        core.quiesce_txg_waiting > self.open()
    }

    /// Is there still work queued for the sync thread?
    pub fn sync_waiting(&self) -> bool {
        let core = self.sync.lock().unwrap();
        core.syncing_txg <= core.sync_txg_waiting
            || core.quiesced_txg != TxgT(0)
    }
}

impl<'a> TxgHandle<'a> {
    pub fn txg(&self) -> TxgT {
        self.txg
    }

    /// Release the per-CPU lock but stay counted: the holder still
    /// participates in the quiesce barrier.
    pub fn rele_to_quiesce(&mut self) {
        self.guard = None;
    }

    /// Append commit callbacks to this txg's list on the holder's CPU
    pub fn register_callbacks(&mut self, cbs: Vec<CommitCallback>) {
        let g = self.txg.slot();
        match self.guard.as_mut() {
            Some(guard) => guard.callbacks[g].extend(cbs),
            None => {
                let tc = &self.state.cpu[self.cpu_idx];
                tc.lock.lock().unwrap().callbacks[g].extend(cbs);
            }
        }
    }

    /// Drop the hold.  When the slot count reaches zero the quiesce barrier
    /// is released.
    pub fn rele_to_sync(mut self) {
        self.guard = None;
        let tc = &self.state.cpu[self.cpu_idx];
        let g = self.txg.slot();
        let mut guard = tc.lock.lock().unwrap();
        debug_assert!(guard.count[g] != 0);
        guard.count[g] -= 1;
        if guard.count[g] == 0 {
            tc.cv[g].notify_all();
        }
    }
}

/// Shard the calling thread onto one of `ncpus` slots
fn cpu_seqid(ncpus: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize % ncpus
}

/// Per-txg object lists, indexed by `txg mod TXG_SIZE`.  Iteration is only
/// safe when the list is known to be idle.
pub struct TxgList<T> {
    lists: [Mutex<Vec<T>>; TXG_SIZE],
}

impl<T: PartialEq> TxgList<T> {
    pub fn new() -> Self {
        TxgList { lists: Default::default() }
    }

    pub fn is_empty(&self, txg: TxgT) -> bool {
        self.lists[txg.slot()].lock().unwrap().is_empty()
    }

    /// Add to the head of the list.  Returns true if already present.
    pub fn add(&self, item: T, txg: TxgT) -> bool {
        let mut list = self.lists[txg.slot()].lock().unwrap();
        if list.contains(&item) {
            true
        } else {
            list.insert(0, item);
            false
        }
    }

    /// Add to the tail of the list.  Returns true if already present.
    pub fn add_tail(&self, item: T, txg: TxgT) -> bool {
        let mut list = self.lists[txg.slot()].lock().unwrap();
        if list.contains(&item) {
            true
        } else {
            list.push(item);
            false
        }
    }

    /// Remove and return the head of the list
    pub fn remove(&self, txg: TxgT) -> Option<T> {
        let mut list = self.lists[txg.slot()].lock().unwrap();
        if list.is_empty() { None } else { Some(list.remove(0)) }
    }

    /// Remove a specific item
    pub fn remove_this(&self, item: &T, txg: TxgT) -> Option<T> {
        let mut list = self.lists[txg.slot()].lock().unwrap();
        list.iter()
            .position(|x| x == item)
            .map(|idx| list.remove(idx))
    }

    pub fn member(&self, item: &T, txg: TxgT) -> bool {
        self.lists[txg.slot()].lock().unwrap().contains(item)
    }

    /// Take the whole list for this txg
    pub fn drain(&self, txg: TxgT) -> Vec<T> {
        std::mem::take(&mut *self.lists[txg.slot()].lock().unwrap())
    }
}

impl<T: PartialEq> Default for TxgList<T> {
    fn default() -> Self {
        Self::new()
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TXG_INITIAL;

    fn engine() -> (Arc<TxgState>, Arc<Mutex<Vec<TxgT>>>) {
        let synced = Arc::new(Mutex::new(Vec::new()));
        let synced2 = synced.clone();
        let state = TxgState::new(TXG_INITIAL);
        state.sync_start(move |txg| {
            synced2.lock().unwrap().push(txg);
        });
        (state, synced)
    }

    mod hold {
        use super::*;
        use pretty_assertions::assert_eq;

        /// A plain hold/release cycle doesn't disturb the generations
        #[test]
        fn hold_and_release() {
            let (state, _synced) = engine();
            let mut th = state.hold_open();
            let txg = th.txg();
            assert_eq!(txg, TXG_INITIAL);
            th.rele_to_quiesce();
            th.rele_to_sync();
            state.sync_stop();
        }

        /// Scenario: thread A holds T, thread B waits for T to sync.  B
        /// unblocks only after A releases, within one quiesce+sync cycle.
        #[test]
        fn handoff() {
            let (state, _synced) = engine();
            let mut th = state.hold_open();
            let txg = th.txg();
            th.rele_to_quiesce();

            let state2 = state.clone();
            let jh = std::thread::spawn(move || {
                state2.wait_synced(txg);
                state2.generations()
            });

            // B can't finish while A holds the txg open
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!jh.is_finished());

            th.rele_to_sync();
            let gens = jh.join().unwrap();
            assert!(gens.synced >= txg);
            state.sync_stop();
        }

        /// Multiple concurrent holders of the same txg all block its sync
        #[test]
        fn multiple_holders() {
            let (state, _synced) = engine();
            let mut h1 = state.hold_open();
            h1.rele_to_quiesce();
            let mut h2 = state.hold_open();
            h2.rele_to_quiesce();
            let txg = h1.txg();
            assert_eq!(txg, h2.txg());
            h1.rele_to_sync();

            let state2 = state.clone();
            let jh = std::thread::spawn(move || state2.wait_synced(txg));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!jh.is_finished());

            h2.rele_to_sync();
            jh.join().unwrap();
            state.sync_stop();
        }
    }

    mod callbacks {
        use super::*;
        use pretty_assertions::assert_eq;

        /// Callbacks run strictly after their txg syncs, in FIFO order
        /// within a CPU's list.
        #[test]
        fn after_sync() {
            let sync_count = Arc::new(AtomicUsize::new(0));
            let sync_count2 = sync_count.clone();
            let state = TxgState::new(TXG_INITIAL);
            state.sync_start(move |_| {
                sync_count2.fetch_add(1, Ordering::SeqCst);
            });

            let order = Arc::new(Mutex::new(Vec::new()));
            let mut th = state.hold_open();
            let txg = th.txg();
            th.rele_to_quiesce();
            let cbs: Vec<CommitCallback> = (0..3)
                .map(|i| {
                    let order2 = order.clone();
                    let sc = sync_count.clone();
                    Box::new(move || {
                        assert!(sc.load(Ordering::SeqCst) > 0);
                        order2.lock().unwrap().push(i);
                    }) as CommitCallback
                }).collect();
            th.register_callbacks(cbs);
            th.rele_to_sync();

            state.wait_synced(txg);
            // Give the taskq a moment to run the callbacks
            let deadline = std::time::Instant::now()
                + std::time::Duration::from_secs(5);
            while order.lock().unwrap().len() < 3 {
                assert!(std::time::Instant::now() < deadline);
                std::thread::yield_now();
            }
            assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
            state.sync_stop();
        }
    }

    mod waits {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn wait_open_advances() {
            let (state, _synced) = engine();
            let target = TXG_INITIAL + 2;
            state.wait_open(target);
            assert!(state.open() >= target);
            state.sync_stop();
        }

        #[test]
        fn wait_synced_zero_covers_deferred() {
            let (state, synced) = engine();
            let open = state.open();
            state.wait_synced(TxgT(0));
            assert!(
                state.generations().synced >= open + TXG_DEFER_SIZE
            );
            assert!(!synced.lock().unwrap().is_empty());
            state.sync_stop();
        }

        /// The generation invariant: synced <= syncing <= quiescing <= open
        /// whenever the intermediate states exist.
        #[test]
        fn generations_ordered() {
            let (state, _synced) = engine();
            for _ in 0..10 {
                let g = state.generations();
                for t in [g.quiescing, g.quiesced, g.syncing] {
                    if t != TxgT(0) {
                        assert!(t >= g.synced);
                        assert!(t <= g.open);
                    }
                }
                assert!(g.synced <= g.open);
                state.wait_synced(TxgT(0));
            }
            state.sync_stop();
        }

        #[test]
        fn timeout_syncs_without_waiters() {
            let (state, synced) = engine();
            TUNABLES.txg_timeout.store(1, Ordering::Relaxed);
            let deadline = std::time::Instant::now()
                + std::time::Duration::from_secs(30);
            while synced.lock().unwrap().is_empty() {
                assert!(std::time::Instant::now() < deadline);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            TUNABLES.txg_timeout.store(5, Ordering::Relaxed);
            state.sync_stop();
        }
    }

    mod delay {
        use super::*;
        use pretty_assertions::assert_eq;

        /// delay() returns immediately once the txg is no longer open
        #[test]
        fn no_delay_after_advance() {
            let (state, _synced) = engine();
            let txg = state.open();
            state.wait_synced(txg);
            let t0 = std::time::Instant::now();
            state.delay(txg, 10 * HZ);
            assert!(t0.elapsed() < std::time::Duration::from_secs(5));
            state.sync_stop();
        }
    }

    mod stalled {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn not_stalled_at_rest() {
            let (state, _synced) = engine();
            state.wait_synced(TxgT(0));
            assert!(!state.stalled());
            state.sync_stop();
        }
    }

    mod txg_list {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn add_remove() {
            let tl = TxgList::<u64>::new();
            let txg = TxgT(9);
            assert!(tl.is_empty(txg));
            assert!(!tl.add(1, txg));
            assert!(!tl.add_tail(2, txg));
            assert!(tl.add(1, txg)); // already present
            assert!(tl.member(&1, txg));
            assert_eq!(tl.remove(txg), Some(1));
            assert_eq!(tl.remove(txg), Some(2));
            assert_eq!(tl.remove(txg), None);
        }

        #[test]
        fn remove_this() {
            let tl = TxgList::<u64>::new();
            let txg = TxgT(2);
            tl.add_tail(1, txg);
            tl.add_tail(2, txg);
            tl.add_tail(3, txg);
            assert_eq!(tl.remove_this(&2, txg), Some(2));
            assert_eq!(tl.remove_this(&2, txg), None);
            assert_eq!(tl.drain(txg), vec![1, 3]);
        }

        #[test]
        fn slots_are_independent() {
            let tl = TxgList::<u64>::new();
            tl.add(1, TxgT(0));
            assert!(tl.is_empty(TxgT(1)));
            // TXG_SIZE later, the same slot
            assert!(!tl.is_empty(TxgT(TXG_SIZE as u64)));
        }
    }

    /// Holders of open txg T never observe dirtied state from T-1's sync
    /// until that sync completes.
    #[test]
    fn sync_ordering() {
        let last_synced = Arc::new(AtomicU64::new(0));
        let last_synced2 = last_synced.clone();
        let state = TxgState::new(TXG_INITIAL);
        state.sync_start(move |txg| {
            std::thread::sleep(std::time::Duration::from_millis(1));
            last_synced2.store(txg.0, Ordering::SeqCst);
        });

        for _ in 0..20 {
            let mut th = state.hold_open();
            let txg = th.txg();
            // A synced txg is never the one we're holding open
            let floor = last_synced.load(Ordering::SeqCst);
            assert!(TxgT(floor) < txg);
            th.rele_to_quiesce();
            th.rele_to_sync();
            state.wait_synced(txg);
            assert!(last_synced.load(Ordering::SeqCst) >= txg.0);
        }
        state.sync_stop();
    }
}
// LCOV_EXCL_STOP
