// vim: tw=80
//! The on-disk configuration container: a self-describing list of named,
//! typed values, serialized in XDR.
//!
//! Only the types the pool core actually stores are implemented.  XDR is
//! big-endian by definition, so a packed nvlist never needs byteswapping;
//! the endianness of its *enclosing* block is detected by that block's
//! checksum trailer instead.

use byteorder::{BigEndian, ByteOrder};

use crate::types::{Error, Result};

const NV_ENCODE_XDR: u8 = 1;
const NV_UNIQUE_NAME: u32 = 1;

const DATA_TYPE_UINT64: i32 = 8;
const DATA_TYPE_STRING: i32 = 9;
const DATA_TYPE_UINT64_ARRAY: i32 = 16;
const DATA_TYPE_NVLIST: i32 = 19;
const DATA_TYPE_BOOLEAN_VALUE: i32 = 21;

#[derive(Clone, Debug, PartialEq)]
pub enum NvValue {
    Uint64(u64),
    String(String),
    Uint64Array(Vec<u64>),
    Nvlist(Nvlist),
    Boolean(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Nvpair {
    pub name: String,
    pub value: NvValue,
}

/// A name/value list.  Insertion replaces any pair of the same name, giving
/// the unique-name semantics the config code relies on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Nvlist {
    pairs: Vec<Nvpair>,
}

impl Nvlist {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, value: NvValue) {
        if let Some(p) = self.pairs.iter_mut().find(|p| p.name == name) {
            p.value = value;
        } else {
            self.pairs.push(Nvpair { name: name.to_owned(), value });
        }
    }

    pub fn add_uint64(&mut self, name: &str, v: u64) {
        self.add(name, NvValue::Uint64(v));
    }

    pub fn add_string(&mut self, name: &str, v: &str) {
        self.add(name, NvValue::String(v.to_owned()));
    }

    pub fn add_uint64_array(&mut self, name: &str, v: &[u64]) {
        self.add(name, NvValue::Uint64Array(v.to_vec()));
    }

    pub fn add_nvlist(&mut self, name: &str, v: Nvlist) {
        self.add(name, NvValue::Nvlist(v));
    }

    pub fn add_boolean(&mut self, name: &str, v: bool) {
        self.add(name, NvValue::Boolean(v));
    }

    pub fn pairs(&self) -> &[Nvpair] {
        &self.pairs
    }

    fn lookup(&self, name: &str) -> Result<&NvValue> {
        self.pairs
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
            .ok_or(Error::ENOENT)
    }

    pub fn lookup_uint64(&self, name: &str) -> Result<u64> {
        match self.lookup(name)? {
            NvValue::Uint64(v) => Ok(*v),
            _ => Err(Error::EINVAL),
        }
    }

    pub fn lookup_string(&self, name: &str) -> Result<&str> {
        match self.lookup(name)? {
            NvValue::String(v) => Ok(v),
            _ => Err(Error::EINVAL),
        }
    }

    pub fn lookup_uint64_array(&self, name: &str) -> Result<&[u64]> {
        match self.lookup(name)? {
            NvValue::Uint64Array(v) => Ok(v),
            _ => Err(Error::EINVAL),
        }
    }

    pub fn lookup_nvlist(&self, name: &str) -> Result<&Nvlist> {
        match self.lookup(name)? {
            NvValue::Nvlist(v) => Ok(v),
            _ => Err(Error::EINVAL),
        }
    }

    pub fn lookup_boolean(&self, name: &str) -> Result<bool> {
        match self.lookup(name)? {
            NvValue::Boolean(v) => Ok(*v),
            _ => Err(Error::EINVAL),
        }
    }

    /// Serialize, with the 4-byte encoding header
    pub fn pack(&self) -> Vec<u8> {
        let mut out = vec![NV_ENCODE_XDR, 1, 0, 0];
        self.pack_body(&mut out);
        out
    }

    fn pack_body(&self, out: &mut Vec<u8>) {
        put_u32(out, 0); // nvlist version
        put_u32(out, NV_UNIQUE_NAME);
        for pair in &self.pairs {
            pair.pack(out);
        }
        put_u32(out, 0); // list terminator
        put_u32(out, 0);
    }

    /// Deserialize a buffer produced by [`Nvlist::pack`].  Trailing bytes
    /// (e.g. the unused remainder of a fixed-size label region) are ignored.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 || buf[0] != NV_ENCODE_XDR {
            return Err(Error::EINVAL);
        }
        let mut cur = Cursor { buf, pos: 4 };
        Self::unpack_body(&mut cur)
    }

    fn unpack_body(cur: &mut Cursor) -> Result<Self> {
        let _version = cur.get_u32()?;
        let _nvflag = cur.get_u32()?;
        let mut nvl = Nvlist::new();
        loop {
            let encoded_size = cur.get_u32()?;
            let decoded_size = cur.get_u32()?;
            if encoded_size == 0 && decoded_size == 0 {
                break Ok(nvl);
            }
            if encoded_size < 8 {
                break Err(Error::EINVAL);
            }
            // The pair body is its encoded size minus the two size words
            // already consumed.
            let pair_end = cur
                .pos
                .checked_add(encoded_size as usize - 8)
                .filter(|e| *e <= cur.buf.len())
                .ok_or(Error::EINVAL)?;
            match Nvpair::unpack(cur) {
                Ok(pair) => nvl.pairs.push(pair),
                // Unknown pair types are skipped, not fatal
                Err(Error::ENOTSUP) => cur.pos = pair_end,
                Err(e) => break Err(e),
            }
        }
    }
}

impl Nvpair {
    fn pack(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_string(&mut body, &self.name);
        match &self.value {
            NvValue::Uint64(v) => {
                put_u32(&mut body, DATA_TYPE_UINT64 as u32);
                put_u32(&mut body, 1);
                put_u64(&mut body, *v);
            }
            NvValue::String(v) => {
                put_u32(&mut body, DATA_TYPE_STRING as u32);
                put_u32(&mut body, 1);
                put_string(&mut body, v);
            }
            NvValue::Uint64Array(v) => {
                put_u32(&mut body, DATA_TYPE_UINT64_ARRAY as u32);
                put_u32(&mut body, v.len() as u32);
                for x in v {
                    put_u64(&mut body, *x);
                }
            }
            NvValue::Nvlist(v) => {
                put_u32(&mut body, DATA_TYPE_NVLIST as u32);
                put_u32(&mut body, 1);
                v.pack_body(&mut body);
            }
            NvValue::Boolean(v) => {
                put_u32(&mut body, DATA_TYPE_BOOLEAN_VALUE as u32);
                put_u32(&mut body, 1);
                put_u32(&mut body, u32::from(*v));
            }
        }
        let encoded_size = body.len() as u32 + 8;
        // An estimate of the unpacked in-core size; consumers only use it
        // as a nonzero marker.
        let decoded_size = body.len() as u32 + 32;
        put_u32(out, encoded_size);
        put_u32(out, decoded_size);
        out.extend_from_slice(&body);
    }

    fn unpack(cur: &mut Cursor) -> Result<Self> {
        let name = cur.get_string()?;
        let dtype = cur.get_u32()? as i32;
        let nelem = cur.get_u32()?;
        let value = match dtype {
            DATA_TYPE_UINT64 => NvValue::Uint64(cur.get_u64()?),
            DATA_TYPE_STRING => NvValue::String(cur.get_string()?),
            DATA_TYPE_UINT64_ARRAY => {
                let mut v = Vec::with_capacity(nelem as usize);
                for _ in 0..nelem {
                    v.push(cur.get_u64()?);
                }
                NvValue::Uint64Array(v)
            }
            DATA_TYPE_NVLIST => NvValue::Nvlist(Nvlist::unpack_body(cur)?),
            DATA_TYPE_BOOLEAN_VALUE => NvValue::Boolean(cur.get_u32()? != 0),
            _ => return Err(Error::ENOTSUP),
        };
        Ok(Nvpair { name, value })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn get_u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        if end > self.buf.len() {
            return Err(Error::EINVAL);
        }
        let v = BigEndian::read_u32(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(v)
    }

    fn get_u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        if end > self.buf.len() {
            return Err(Error::EINVAL);
        }
        let v = BigEndian::read_u64(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(v)
    }

    fn get_string(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::EINVAL);
        }
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| Error::EINVAL)?
            .to_owned();
        self.pos = end + xdr_pad(len);
        Ok(s)
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
    out.extend(std::iter::repeat(0u8).take(xdr_pad(s.len())));
}

/// Bytes of padding XDR requires after an `len`-byte opaque
fn xdr_pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

// LCOV_EXCL_STOP
