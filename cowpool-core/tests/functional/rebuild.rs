// vim: tw=80
//! Rebuild restart across an export/import cycle

use std::sync::Arc;

use cowpool_core::{
    objset::MemObjset,
    rebuild::{restart, VdevScan},
    spa::{Event, ScanState, Spa, DIR_REBUILDING},
    types::{Guid, TxgT},
    vdev::{draid::identity_map, RamTransport, VdevId, VdevKind, VdevTree},
};
use pretty_assertions::assert_eq;

const NDEVS: u32 = 5;
const NSPARES: u32 = 1;
const NROWS: u32 = 32;
const LEAF_SIZE: u64 = 1 << 20;
const MS_SHIFT: u8 = 18;
const MS_COUNT: usize = 16;
const EXTENT: u64 = 8192;

struct Layout {
    tree: VdevTree,
    top: VdevId,
    oldvd: VdevId,
    dspare: VdevId,
}

/// A dRAID top-level with the failed child at position 2 already paired
/// with its distributed spare.
fn draid_tree(guids: Option<&[Guid]>) -> Layout {
    let map = identity_map(NDEVS, 1, NSPARES, NROWS).unwrap();
    let mut tree = VdevTree::new();
    let top = tree.add_node(
        Some(VdevTree::ROOT),
        VdevKind::Draid { map, nparity: 1 },
        9,
    );
    let mut oldvd = VdevId(0);
    let mut dspare = VdevId(0);
    for i in 0..NDEVS {
        if i == 2 {
            let spare = tree.add_node(Some(top), VdevKind::Spare, 9);
            oldvd = tree
                .add_disk(spare, Arc::new(RamTransport::new(LEAF_SIZE)));
            dspare =
                tree.add_node(Some(spare), VdevKind::DraidSpare, 9);
        } else {
            tree.add_disk(top, Arc::new(RamTransport::new(LEAF_SIZE)));
        }
    }
    tree.set_ms_shift(top, MS_SHIFT);
    if let Some(guids) = guids {
        tree.set_guid(top, guids[0]);
        tree.set_guid(oldvd, guids[1]);
    }
    Layout { tree, top, oldvd, dspare }
}

fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_secs(60);
    while !f() {
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

/// Start a rebuild, export after a few metaslabs complete, re-import, and
/// restart.  The restart resumes after the last completed metaslab and
/// never re-examines anything at or below it.
#[test]
fn restart_resumes_after_import() {
    let os: Arc<MemObjset> = Arc::new(MemObjset::new());
    let layout = draid_tree(None);
    let Layout { tree, top, oldvd, dspare } = layout;
    let spa = Spa::create("draidpool", tree, os.clone()).unwrap();
    spa.start();

    let top_guid = spa.tree().get(top).guid;
    let oldvd_guid = spa.tree().get(oldvd).guid;
    spa.tree().get(dspare).set_resilver_needed(true);

    // One extent in every metaslab
    let mut th = spa.txg().hold_open();
    let txg = th.txg();
    th.rele_to_quiesce();
    for msi in 0..MS_COUNT {
        let offset = (msi as u64) << MS_SHIFT;
        spa.claim(top, offset, EXTENT, txg).unwrap();
    }
    th.rele_to_sync();
    spa.txg().wait_synced(txg);

    // Hold metaslab 4 in "condensing" so the scan stalls deterministically
    // after completing 0..=3.
    spa.metaslabs_of(top)[4].begin_condense();

    VdevScan::start(&spa, oldvd, 0, TxgT(0));
    let svs = spa.vdev_scan().unwrap();
    wait_for("three metaslabs", || svs.msi_synced() >= 3);

    // suspend() joins the scan thread, which is blocked waiting out the
    // condense, so release it from another thread.
    let spa_s = spa.clone();
    let suspender =
        std::thread::spawn(move || VdevScan::suspend(&spa_s));
    std::thread::sleep(std::time::Duration::from_millis(20));
    spa.metaslabs_of(top)[4].end_condense();
    suspender.join().unwrap();

    let stopped_at = svs.msi_synced();
    assert_eq!(stopped_at, 3);
    assert!((stopped_at as usize) < MS_COUNT - 1);

    // Persist the cursor, then export
    spa.txg().wait_synced(TxgT(0));
    let phys = spa.dir_lookup(DIR_REBUILDING).unwrap();
    assert_eq!(phys[0] as i64, stopped_at);
    assert_eq!(phys[1], top_guid.0);
    assert_eq!(phys[2], oldvd_guid.0);
    spa.export();
    drop(spa);

    // Re-import over the same backing store, with the configured guids
    let layout = draid_tree(Some(&[top_guid, oldvd_guid]));
    let Layout { tree, top: top2, oldvd: _, dspare: dspare2 } = layout;
    let spa2 = Spa::import("draidpool", tree, os).unwrap();
    spa2.tree().get(dspare2).set_resilver_needed(true);
    spa2.start();

    restart(&spa2).unwrap();
    wait_for("rebuild finish", || {
        spa2.scan().state == ScanState::Finished
    });

    // Metaslabs 0..=stopped_at were not re-read: only the remaining
    // extents were examined.
    let remaining = (MS_COUNT as i64 - 1 - stopped_at) as u64;
    let scan = *spa2.scan();
    assert_eq!(scan.examined, remaining * EXTENT);

    let svs2 = spa2.vdev_scan().unwrap();
    assert_eq!(svs2.msi_synced(), MS_COUNT as i64 - 1);
    assert!(spa2.events().contains(&Event::RebuildFinish));

    spa2.txg().wait_synced(TxgT(0));
    let phys = spa2.dir_lookup(DIR_REBUILDING).unwrap();
    assert_eq!(phys[0] as i64, MS_COUNT as i64 - 1);
    spa2.export();
}

/// Restart validation refuses a pool whose spare pairing is gone
#[test]
fn restart_requires_spare_pairing() {
    let os: Arc<MemObjset> = Arc::new(MemObjset::new());
    let map = identity_map(NDEVS, 1, NSPARES, NROWS).unwrap();
    let mut tree = VdevTree::new();
    let top = tree.add_node(
        Some(VdevTree::ROOT),
        VdevKind::Draid { map, nparity: 1 },
        9,
    );
    let disks: Vec<VdevId> = (0..NDEVS)
        .map(|_| {
            tree.add_disk(top, Arc::new(RamTransport::new(LEAF_SIZE)))
        }).collect();
    tree.set_ms_shift(top, MS_SHIFT);
    let spa = Spa::create("flatpool", tree, os).unwrap();
    spa.start();

    // Persisted state names a leaf with no spare parent
    spa.dir_update(
        DIR_REBUILDING,
        &[2, spa.tree().get(top).guid.0, spa.tree().get(disks[2]).guid.0],
    );
    spa.dir_update("scan", &[1, 1, 8, 0, 0, 0, 0]);
    assert_eq!(
        restart(&spa).unwrap_err(),
        cowpool_core::Error::ENOENT
    );
    spa.export();
}
