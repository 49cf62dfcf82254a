// vim: tw=80
//! Label repair on a full-size device image

use std::io::{Read, Seek, SeekFrom, Write};

use cowpool_core::vdev::{
    label_offset, read_config, repair_label_cksum, write_all_labels,
    LabelVerdict, VDEV_LABELS, VDEV_PHYS_SIZE, VDEV_SKIP_SIZE,
};
use cowpool_core::nvlist::Nvlist;
use pretty_assertions::assert_eq;

const PSIZE: u64 = 64 << 30; // 64 GiB, sparse

fn pool_config() -> Nvlist {
    let mut nvl = Nvlist::new();
    nvl.add_uint64("version", 5000);
    nvl.add_uint64("pool_state", 0);
    nvl.add_uint64("guid", 0xfeed_face_cafe_f00d);
    nvl.add_uint64("txg", 1297);
    nvl.add_string("name", "bigpool");
    nvl
}

/// Corrupt the checksum of label 2 on a 64 GiB image; repair must fix
/// exactly that label and leave everything else byte-identical.
#[test]
fn repair_corrupt_label_2() {
    let tf = tempfile::NamedTempFile::new().unwrap();
    tf.as_file().set_len(PSIZE).unwrap();
    write_all_labels(tf.as_file(), PSIZE, &pool_config()).unwrap();

    // Corrupt one word of label 2's stored checksum
    let cksum_at = label_offset(PSIZE, 2, 0)
        + VDEV_SKIP_SIZE
        + VDEV_PHYS_SIZE as u64
        - 24;
    {
        let mut f = tf.reopen().unwrap();
        f.seek(SeekFrom::Start(cksum_at)).unwrap();
        let mut word = [0u8; 8];
        f.read_exact(&mut word).unwrap();
        word[3] ^= 0x42;
        f.seek(SeekFrom::Start(cksum_at)).unwrap();
        f.write_all(&word).unwrap();
    }

    let verdicts = repair_label_cksum(tf.as_file(), PSIZE).unwrap();
    assert_eq!(
        verdicts,
        [
            LabelVerdict::Skipped,
            LabelVerdict::Skipped,
            LabelVerdict::Repaired,
            LabelVerdict::Skipped,
        ]
    );

    // A subsequent load verifies all four labels
    assert_eq!(read_config(tf.as_file(), PSIZE).unwrap(), pool_config());
    for l in 0..VDEV_LABELS {
        let offset = label_offset(PSIZE, l as usize, 0) + VDEV_SKIP_SIZE;
        let mut f = tf.reopen().unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        let mut buf = vec![0u8; VDEV_PHYS_SIZE];
        f.read_exact(&mut buf).unwrap();
        cowpool_core::vdev::decode_phys(&buf, offset).unwrap();
    }
}
