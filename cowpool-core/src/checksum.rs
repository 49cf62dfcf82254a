// vim: tw=80
//! Fletcher-4, the checksum the on-disk formats carry.
//!
//! Two variants: native, for data written by a host of the same endianness,
//! and byteswapped, for reading data written by the other kind.  Both exist
//! in incremental form so a stream can be checksummed as it is read.

use byteorder::{ByteOrder, NativeEndian};

/// A 256-bit checksum, stored as four 64-bit words
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ZioCksum(pub [u64; 4]);

impl ZioCksum {
    /// The offset-salted verifier used for self-describing blocks such as
    /// vdev labels.
    pub fn label_verifier(offset: u64) -> Self {
        ZioCksum([offset, 0, 0, 0])
    }

    /// Swap the byte order of every word, in place
    pub fn byteswap(&mut self) {
        for w in self.0.iter_mut() {
            *w = w.swap_bytes();
        }
    }
}

/// Continue a Fletcher-4 checksum over `buf`, reading words in host order.
///
/// `buf.len()` must be a multiple of 4.
pub fn fletcher_4_incremental_native(buf: &[u8], cksum: &mut ZioCksum) {
    assert_eq!(buf.len() % 4, 0);
    let [mut a, mut b, mut c, mut d] = cksum.0;
    for word in buf.chunks_exact(4) {
        let w = u64::from(NativeEndian::read_u32(word));
        a = a.wrapping_add(w);
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }
    cksum.0 = [a, b, c, d];
}

/// Like [`fletcher_4_incremental_native`], but byte-swapping each word first.
pub fn fletcher_4_incremental_byteswap(buf: &[u8], cksum: &mut ZioCksum) {
    assert_eq!(buf.len() % 4, 0);
    let [mut a, mut b, mut c, mut d] = cksum.0;
    for word in buf.chunks_exact(4) {
        let w = u64::from(NativeEndian::read_u32(word).swap_bytes());
        a = a.wrapping_add(w);
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }
    cksum.0 = [a, b, c, d];
}

pub fn fletcher_4_native(buf: &[u8]) -> ZioCksum {
    let mut zc = ZioCksum::default();
    fletcher_4_incremental_native(buf, &mut zc);
    zc
}

pub fn fletcher_4_byteswap(buf: &[u8]) -> ZioCksum {
    let mut zc = ZioCksum::default();
    fletcher_4_incremental_byteswap(buf, &mut zc);
    zc
}

// LCOV_EXCL_STOP
