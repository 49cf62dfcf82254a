// vim: tw=80
//! Runtime side of the dRAID permutation map: row selection, redundancy
//! group geometry, and degraded-group tests.
//!
//! The map itself is produced offline by the permutation builder and
//! carried in the pool configuration.

use crate::{
    nvlist::Nvlist,
    types::{Error, Result},
};

pub const MAX_GROUPSIZE: u32 = 32;
pub const MAX_GROUPS: u32 = 128;
pub const MAX_SPARES: u32 = 100;
pub const MAX_ROWS: u32 = 16384;

/// A dRAID base permutation map.
///
/// Each row is a permutation of the child indices `0..ndevs`: the first
/// `ndevs - nspares` positions are the data/parity columns, divided into
/// `ngroups` groups; the last `nspares` positions are the distributed
/// spares for that row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DraidMap {
    ndevs: u32,
    ngroups: u32,
    nspares: u32,
    nrows: u32,
    /// Columns per group; sums to `ndevs - nspares`
    groupsz: Vec<u32>,
    /// `nrows * ndevs`, row-major
    perms: Vec<u32>,
}

impl DraidMap {
    pub fn new(
        ndevs: u32,
        ngroups: u32,
        nspares: u32,
        nrows: u32,
        perms: Vec<u32>,
    ) -> Result<Self> {
        let map = DraidMap {
            ndevs,
            ngroups,
            nspares,
            nrows,
            groupsz: group_sizes(ndevs, ngroups, nspares)?,
            perms,
        };
        map.check()?;
        Ok(map)
    }

    pub fn ndevs(&self) -> u32 {
        self.ndevs
    }

    pub fn ngroups(&self) -> u32 {
        self.ngroups
    }

    pub fn nspares(&self) -> u32 {
        self.nspares
    }

    pub fn nrows(&self) -> u32 {
        self.nrows
    }

    pub fn ndata(&self) -> u32 {
        self.ndevs - self.nspares
    }

    pub fn groupsz(&self) -> &[u32] {
        &self.groupsz
    }

    pub fn row(&self, r: u32) -> &[u32] {
        let r = r as usize;
        let n = self.ndevs as usize;
        &self.perms[r * n..(r + 1) * n]
    }

    /// Every device appears exactly once per row, and row 0 is the
    /// identity permutation.
    pub fn check(&self) -> Result<()> {
        if self.ngroups == 0
            || self.ngroups > MAX_GROUPS
            || self.nspares > MAX_SPARES
            || self.nrows == 0
            || self.nrows > MAX_ROWS
            || self.groupsz.iter().any(|&g| g == 0 || g > MAX_GROUPSIZE)
            || self.perms.len()
                != self.nrows as usize * self.ndevs as usize
        {
            return Err(Error::EINVAL);
        }
        let mut seen = vec![false; self.ndevs as usize];
        for r in 0..self.nrows {
            seen.fill(false);
            for &dev in self.row(r) {
                if dev >= self.ndevs
                    || std::mem::replace(&mut seen[dev as usize], true)
                {
                    return Err(Error::EINVAL);
                }
            }
        }
        if self.row(0).iter().enumerate().any(|(i, &d)| d != i as u32) {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Bytes of logical space covered by one permutation row
    pub fn row_span(&self, unit: u64) -> u64 {
        u64::from(self.ndata()) * unit
    }

    /// The permutation row governing `offset`: the logical stripe index,
    /// modulo the number of base rows.
    pub fn row_for_offset(&self, offset: u64, unit: u64) -> u32 {
        ((offset / self.row_span(unit)) % u64::from(self.nrows)) as u32
    }

    fn group_start_col(&self, group: u32) -> u32 {
        self.groupsz[0..group as usize].iter().sum()
    }

    /// The redundancy group containing `offset`
    pub fn offset_to_group(&self, offset: u64, unit: u64) -> u32 {
        let col = ((offset / unit) % u64::from(self.ndata())) as u32;
        let mut start = 0;
        for (g, &sz) in self.groupsz.iter().enumerate() {
            if col < start + sz {
                return g as u32;
            }
            start += sz;
        }
        unreachable!()
    }

    /// Logical byte bounds of the group extent containing `offset`.  The
    /// extent never crosses a redundancy group boundary.
    pub fn group_bounds(&self, offset: u64, unit: u64) -> (u64, u64) {
        let row_base = offset - offset % self.row_span(unit);
        let group = self.offset_to_group(offset, unit);
        let start =
            row_base + u64::from(self.group_start_col(group)) * unit;
        let end = start + u64::from(self.groupsz[group as usize]) * unit;
        (start, end)
    }

    /// The largest chunk at `offset` that stays within its group extent
    pub fn max_rebuildable(&self, offset: u64, unit: u64) -> u64 {
        self.group_bounds(offset, unit).1 - offset
    }

    /// Child positions (indices into the vdev's children) serving as data
    /// or parity for the group extent containing `offset`.
    pub fn group_children(&self, offset: u64, unit: u64) -> &[u32] {
        let row = self.row_for_offset(offset, unit);
        let group = self.offset_to_group(offset, unit);
        let start = self.group_start_col(group) as usize;
        let end = start + self.groupsz[group as usize] as usize;
        &self.row(row)[start..end]
    }

    /// Child positions serving as the distributed spares for `offset`'s row
    pub fn spare_children(&self, offset: u64, unit: u64) -> &[u32] {
        let row = self.row_for_offset(offset, unit);
        &self.row(row)[self.ndata() as usize..]
    }

    /// Does the group extent containing `offset` involve the child at
    /// position `failed_pos`?  Groups that don't are not degraded by that
    /// child's failure and need no reconstruction.
    pub fn group_degraded(
        &self,
        offset: u64,
        unit: u64,
        failed_pos: u32,
    ) -> bool {
        self.group_children(offset, unit).contains(&failed_pos)
    }

    pub fn to_nvlist(&self) -> Nvlist {
        let mut nvl = Nvlist::new();
        nvl.add_uint64("children", u64::from(self.ndevs));
        nvl.add_uint64("ngroups", u64::from(self.ngroups));
        nvl.add_uint64("nspares", u64::from(self.nspares));
        nvl.add_uint64("bases", u64::from(self.nrows));
        let perms: Vec<u64> =
            self.perms.iter().map(|&p| u64::from(p)).collect();
        nvl.add_uint64_array("base_perms", &perms);
        nvl
    }

    pub fn from_nvlist(nvl: &Nvlist) -> Result<Self> {
        let ndevs = nvl.lookup_uint64("children")? as u32;
        let ngroups = nvl.lookup_uint64("ngroups")? as u32;
        let nspares = nvl.lookup_uint64("nspares")? as u32;
        let nrows = nvl.lookup_uint64("bases")? as u32;
        let perms = nvl
            .lookup_uint64_array("base_perms")?
            .iter()
            .map(|&p| u32::try_from(p).map_err(|_| Error::EINVAL))
            .collect::<Result<Vec<u32>>>()?;
        DraidMap::new(ndevs, ngroups, nspares, nrows, perms)
    }
}

/// Split the data columns among the groups, front-loading the remainder
pub fn group_sizes(ndevs: u32, ngroups: u32, nspares: u32)
    -> Result<Vec<u32>>
{
    if ngroups == 0 || nspares >= ndevs {
        return Err(Error::EINVAL);
    }
    let ndata = ndevs - nspares;
    let base = ndata / ngroups;
    let extra = ndata % ngroups;
    if base == 0 {
        return Err(Error::EINVAL);
    }
    Ok((0..ngroups)
        .map(|g| base + u32::from(g < extra))
        .collect())
}

/// An identity-derived map: row 0 is the identity and every later row is a
/// rotation.  The unoptimized baseline.
pub fn identity_map(
    ndevs: u32,
    ngroups: u32,
    nspares: u32,
    nrows: u32,
) -> Result<DraidMap> {
    let perms = (0..nrows)
        .flat_map(|r| (0..ndevs).map(move |d| (d + r) % ndevs))
        .collect();
    DraidMap::new(ndevs, ngroups, nspares, nrows, perms)
}

// LCOV_EXCL_STOP
