// vim: tw=80
//! Vdev labels: four fixed-position copies of the pool configuration per
//! leaf, each a packed nvlist with a self-checksumming trailer.
//!
//! The trailer's checksum is salted with the byte offset of the region it
//! covers, so a label blindly copied to another position fails to verify.
//! Byteswap is detected by the trailer magic: the data itself is never
//! rewritten for endianness, only reinterpreted.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};

use byteorder::{ByteOrder, NativeEndian};

use crate::{
    checksum::{fletcher_4_byteswap, fletcher_4_native, ZioCksum},
    nvlist::Nvlist,
    types::{Error, Result},
};

pub const VDEV_LABELS: usize = 4;
pub const VDEV_LABEL_SIZE: u64 = 256 * 1024;
/// Blank space + boot block, preceding the config phys in each label
pub const VDEV_SKIP_SIZE: u64 = 16 * 1024;
/// Size of the checksummed config region
pub const VDEV_PHYS_SIZE: usize = 112 * 1024;

/// Trailer magic ("zio data block tail")
pub const ZEC_MAGIC: u64 = 0x0210_da7a_b10c_7a11;

const ZEC_SIZE: usize = 40;

pub const POOL_STATE_ACTIVE: u64 = 0;
pub const POOL_STATE_EXPORTED: u64 = 1;
pub const POOL_STATE_DESTROYED: u64 = 2;

/// Byte offset of label `l` on a device of `psize` bytes.  Two labels lead
/// the device, two trail it.
pub fn label_offset(psize: u64, l: usize, offset: u64) -> u64 {
    debug_assert!(l < VDEV_LABELS);
    offset
        + l as u64 * VDEV_LABEL_SIZE
        + if l >= VDEV_LABELS / 2 {
            psize - VDEV_LABELS as u64 * VDEV_LABEL_SIZE
        } else {
            0
        }
}

fn phys_offset(psize: u64, l: usize) -> u64 {
    label_offset(psize, l, 0) + VDEV_SKIP_SIZE
}

/// Serialize `config` into a checksummed phys region destined for byte
/// offset `offset` on the device.
pub fn encode_phys(config: &Nvlist, offset: u64) -> Result<Vec<u8>> {
    let packed = config.pack();
    if packed.len() > VDEV_PHYS_SIZE - ZEC_SIZE {
        return Err(Error::ENOSPC);
    }
    let mut buf = vec![0u8; VDEV_PHYS_SIZE];
    buf[0..packed.len()].copy_from_slice(&packed);

    let eck = VDEV_PHYS_SIZE - ZEC_SIZE;
    NativeEndian::write_u64(&mut buf[eck..eck + 8], ZEC_MAGIC);
    put_cksum(&mut buf[eck + 8..], ZioCksum::label_verifier(offset));
    let actual = fletcher_4_native(&buf);
    put_cksum(&mut buf[eck + 8..], actual);
    Ok(buf)
}

/// Verify a phys region read from byte offset `offset` and unpack its
/// config.  Handles either endianness.
pub fn decode_phys(buf: &[u8], offset: u64) -> Result<Nvlist> {
    debug_assert_eq!(buf.len(), VDEV_PHYS_SIZE);
    let eck = VDEV_PHYS_SIZE - ZEC_SIZE;
    let magic = NativeEndian::read_u64(&buf[eck..eck + 8]);
    let byteswap = if magic == ZEC_MAGIC {
        false
    } else if magic == ZEC_MAGIC.swap_bytes() {
        true
    } else {
        return Err(Error::EINVAL);
    };

    let mut verifier = ZioCksum::label_verifier(offset);
    if byteswap {
        verifier.byteswap();
    }
    let mut expected = get_cksum(&buf[eck + 8..]);

    let mut work = buf.to_vec();
    put_cksum(&mut work[eck + 8..], verifier);
    let actual = if byteswap {
        fletcher_4_byteswap(&work)
    } else {
        fletcher_4_native(&work)
    };
    if byteswap {
        expected.byteswap();
    }
    if actual != expected {
        return Err(Error::EINTEGRITY);
    }
    Nvlist::unpack(&buf[0..eck])
}

/// Write `config` to all four label positions
pub fn write_all_labels(f: &File, psize: u64, config: &Nvlist) -> Result<()>
{
    for l in 0..VDEV_LABELS {
        let offset = phys_offset(psize, l);
        let buf = encode_phys(config, offset)?;
        pwrite_all(f, &buf, offset)?;
    }
    nix::unistd::fsync(f.as_raw_fd())?;
    Ok(())
}

/// Scan the labels for a usable configuration: the first one that
/// verifies, names an importable pool state, and carries a nonzero txg.
pub fn read_config(f: &File, psize: u64) -> Result<Nvlist> {
    for l in 0..VDEV_LABELS {
        let offset = phys_offset(psize, l);
        let mut buf = vec![0u8; VDEV_PHYS_SIZE];
        if pread_all(f, &mut buf, offset).is_err() {
            continue;
        }
        let config = match decode_phys(&buf, offset) {
            Ok(c) => c,
            Err(_) => continue,
        };
        match config.lookup_uint64("pool_state") {
            Ok(state) if state < POOL_STATE_DESTROYED => {}
            _ => continue,
        }
        match config.lookup_uint64("txg") {
            Ok(txg) if txg != 0 => {}
            _ => continue,
        }
        return Ok(config);
    }
    Err(Error::ENOENT)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LabelVerdict {
    Repaired,
    Skipped,
}

impl std::fmt::Display for LabelVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelVerdict::Repaired => write!(f, "repaired"),
            LabelVerdict::Skipped => write!(f, "skipped"),
        }
    }
}

/// Repair corrupted label checksums in place.
///
/// A label is repaired only if its config still unpacks and carries the
/// required keys; only the phys region is rewritten, and only when its
/// stored checksum disagrees with the recomputed one.
pub fn repair_label_cksum(f: &File, psize: u64)
    -> Result<[LabelVerdict; VDEV_LABELS]>
{
    const CFG_KEYS: [&str; 3] = ["version", "pool_state", "guid"];
    let mut verdicts = [LabelVerdict::Skipped; VDEV_LABELS];

    for l in 0..VDEV_LABELS {
        let offset = phys_offset(psize, l);
        let mut buf = vec![0u8; VDEV_PHYS_SIZE];
        if let Err(e) = pread_all(f, &mut buf, offset) {
            tracing::warn!(label = l, error = %e, "cannot read label");
            continue;
        }

        let eck = VDEV_PHYS_SIZE - ZEC_SIZE;
        let config = match Nvlist::unpack(&buf[0..eck]) {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!(label = l, "cannot unpack nvlist");
                continue;
            }
        };
        if let Some(key) = CFG_KEYS
            .iter()
            .find(|k| config.lookup_uint64(k).is_err())
        {
            tracing::warn!(label = l, key, "missing nvlist key");
            continue;
        }

        let magic = NativeEndian::read_u64(&buf[eck..eck + 8]);
        let byteswap = magic == ZEC_MAGIC.swap_bytes();

        let mut verifier =
            ZioCksum::label_verifier(offset);
        if byteswap {
            verifier.byteswap();
        }
        let mut expected = get_cksum(&buf[eck + 8..]);
        put_cksum(&mut buf[eck + 8..], verifier);
        let actual = if byteswap {
            fletcher_4_byteswap(&buf)
        } else {
            fletcher_4_native(&buf)
        };
        if byteswap {
            expected.byteswap();
        }
        if actual == expected {
            continue;
        }

        put_cksum(&mut buf[eck + 8..], actual);
        if let Err(e) = pwrite_all(f, &buf, offset) {
            tracing::warn!(label = l, error = %e, "cannot write label");
            continue;
        }
        nix::unistd::fsync(f.as_raw_fd())?;
        verdicts[l] = LabelVerdict::Repaired;
    }

    for (l, verdict) in verdicts.iter().enumerate() {
        tracing::info!(label = l, %verdict, "label repair");
    }
    Ok(verdicts)
}

fn put_cksum(buf: &mut [u8], cksum: ZioCksum) {
    for (i, w) in cksum.0.iter().enumerate() {
        NativeEndian::write_u64(&mut buf[i * 8..i * 8 + 8], *w);
    }
}

fn get_cksum(buf: &[u8]) -> ZioCksum {
    let mut zc = ZioCksum::default();
    for (i, w) in zc.0.iter_mut().enumerate() {
        *w = NativeEndian::read_u64(&buf[i * 8..i * 8 + 8]);
    }
    zc
}

fn pread_all(f: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = nix::sys::uio::pread(
            f.as_fd(),
            &mut buf[done..],
            offset as i64 + done as i64,
        )?;
        if n == 0 {
            return Err(Error::EIO);
        }
        done += n;
    }
    Ok(())
}

fn pwrite_all(f: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = nix::sys::uio::pwrite(
            f.as_fd(),
            &buf[done..],
            offset as i64 + done as i64,
        )?;
        if n == 0 {
            return Err(Error::EIO);
        }
        done += n;
    }
    Ok(())
}

// LCOV_EXCL_STOP
