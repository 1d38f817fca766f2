//! The box rearranger: each I/O rank owns one contiguous chunk of the
//! flattened global array, and every compute rank routes each nonzero map
//! entry to the chunk containing it.

use log::trace;

use crate::comm::{allreduce_i64_max, allreduce_i64_sum};
use crate::decomp::IoDesc;
use crate::error::{Error, Result};
use crate::rearrange::{
    chunk_bounds, coalesce_runs, flatten, linear_to_regions, product, unflatten, Region,
};
use crate::topology::IoSystem;
use crate::types::{bytes_to_i64s, i64s_to_bytes};

/// Build the box plan. Collective over the union comm.
pub(crate) fn box_rearrange_create(
    ios: &IoSystem,
    iodesc: &mut IoDesc,
    blocksize: i64,
    iostart: Option<&[i64]>,
    iocount: Option<&[i64]>,
) -> Result<()> {
    let union = ios.union_comm.as_ref();
    let gdims = iodesc.gdimlen.clone();
    let ndims = gdims.len();
    let total = product(&gdims);
    let n_io = ios.num_iotasks;

    // This I/O rank's region: caller-pinned, or its slice of the computed
    // division.
    let mut mine: Vec<Region> = Vec::new();
    if ios.ioproc {
        let t = ios.io_rank as usize;
        if let (Some(s), Some(c)) = (iostart, iocount) {
            for d in 0..ndims {
                if s[d] < 0 || c[d] < 0 || s[d] + c[d] > gdims[d] {
                    return Err(Error::InvalidArgument);
                }
            }
            if product(c) > 0 {
                mine.push(Region {
                    start: s.to_vec(),
                    count: c.to_vec(),
                    offset: 0,
                });
            }
        } else {
            let (starts, lens, _) = chunk_bounds(&gdims, n_io, blocksize);
            mine = linear_to_regions(&gdims, starts[t], lens[t], 0);
        }
    }

    // Every rank learns every I/O task's region so senders can route.
    let enc = mine
        .first()
        .map(|r| {
            let mut v = i64s_to_bytes(&r.start);
            v.extend(i64s_to_bytes(&r.count));
            v
        })
        .unwrap_or_default();
    let parts = union.allgatherv(&enc)?;
    let mut boxes: Vec<Option<Region>> = Vec::with_capacity(n_io);
    for t in 0..n_io {
        let b = &parts[ios.ioranks[t]];
        if b.is_empty() {
            boxes.push(None);
        } else {
            let vals = bytes_to_i64s(b);
            if vals.len() != 2 * ndims {
                return Err(Error::Transport(0));
            }
            boxes.push(Some(Region {
                start: vals[..ndims].to_vec(),
                count: vals[ndims..].to_vec(),
                offset: 0,
            }));
        }
    }
    iodesc.num_aiotasks = boxes.iter().flatten().count();
    iodesc.llen = mine.iter().map(|r| r.nelems()).sum::<i64>() as usize;
    iodesc.regions = mine;
    trace!(
        "box regions known: num_aiotasks={} llen={}",
        iodesc.num_aiotasks,
        iodesc.llen
    );

    let index = LinearIndex::build(&boxes, &gdims);

    // Route each nonzero map entry to the chunk containing it.
    let mut scount = vec![0usize; n_io];
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); n_io];
    let mut offbuckets: Vec<Vec<i64>> = vec![Vec::new(); n_io];
    for k in 0..iodesc.ndof {
        let g = iodesc.map[k];
        if g <= 0 {
            continue;
        }
        let (t, dest) = index
            .owner_of(&boxes, &gdims, g - 1)
            .ok_or(Error::InvalidArgument)?;
        scount[t] += 1;
        buckets[t].push(k);
        offbuckets[t].push(dest);
    }
    iodesc.scount = scount;
    iodesc.starget = ios.ioranks.clone();
    iodesc.sindex = buckets.concat();

    // Tell each I/O rank which buffer slots it will receive.
    let mut offparts = vec![Vec::new(); union.size()];
    for t in 0..n_io {
        if !offbuckets[t].is_empty() {
            offparts[ios.ioranks[t]] = i64s_to_bytes(&offbuckets[t]);
        }
    }
    let recvd = union.alltoallv(&offparts)?;
    if ios.ioproc {
        for (src, bytes) in recvd.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let offs = bytes_to_i64s(bytes);
            iodesc.rfrom.push(src);
            iodesc.rcount.push(offs.len());
            iodesc.rindex.extend(offs.iter().map(|&o| o as usize));
        }
        iodesc.nrecvs = iodesc.rfrom.len();
    }

    let covered = allreduce_i64_sum(union, iodesc.local_transfers() as i64)?;
    iodesc.needs_fill = covered < total;
    iodesc.max_iobuf_len = allreduce_i64_max(union, iodesc.llen as i64)? as usize;
    iodesc.maxregions = allreduce_i64_max(union, iodesc.regions.len() as i64)? as usize;

    // Hole grid: the uncovered slots of this rank's chunk. Only recoverable
    // as hyperslabs when the chunk is a linear range (always true for the
    // computed division).
    if iodesc.needs_fill && ios.ioproc && iodesc.llen > 0 {
        let chunk_start = iodesc
            .regions
            .first()
            .filter(|r| is_linear(r, &gdims))
            .map(|r| flatten(&gdims, &r.start));
        if let Some(chunk_start) = chunk_start {
            let mut covered_slots: Vec<i64> = iodesc.rindex.iter().map(|&x| x as i64).collect();
            covered_slots.sort_unstable();
            covered_slots.dedup();
            let mut fill = Vec::new();
            for (slot, len) in complement_runs(&covered_slots, iodesc.llen as i64) {
                fill.extend(linear_to_regions(&gdims, chunk_start + slot, len, slot as usize));
            }
            iodesc.fill_regions = fill;
        }
    }
    iodesc.maxfillregions = allreduce_i64_max(union, iodesc.fill_regions.len() as i64)? as usize;
    Ok(())
}

/// Runs of `[0, len)` not present in the sorted, deduplicated `covered`.
fn complement_runs(covered: &[i64], len: i64) -> Vec<(i64, i64)> {
    let mut out = Vec::new();
    let mut next = 0i64;
    for &c in covered {
        if c > next {
            out.push((next, c - next));
        }
        next = c + 1;
    }
    if next < len {
        out.push((next, len - next));
    }
    out
}

/// A region is a contiguous range of the flattened array iff its count is
/// `[1, .., 1, n, full, .., full]`.
fn is_linear(region: &Region, gdims: &[i64]) -> bool {
    let mut d = 0;
    while d < gdims.len() && region.count[d] == 1 {
        d += 1;
    }
    if d < gdims.len() {
        d += 1;
    }
    region.count[d..] == gdims[d..]
}

/// Sorted flat intervals for binary-search routing; falls back to box
/// containment scans when some region is not a linear range.
struct LinearIndex {
    intervals: Option<Vec<(i64, i64, usize)>>,
}

impl LinearIndex {
    fn build(boxes: &[Option<Region>], gdims: &[i64]) -> Self {
        let mut intervals = Vec::new();
        for (t, b) in boxes.iter().enumerate() {
            let Some(r) = b else { continue };
            if !is_linear(r, gdims) {
                return Self { intervals: None };
            }
            intervals.push((flatten(gdims, &r.start), r.nelems(), t));
        }
        intervals.sort_unstable();
        Self {
            intervals: Some(intervals),
        }
    }

    /// Find the owning I/O task of a flattened offset and the element's
    /// slot within that task's io buffer.
    fn owner_of(&self, boxes: &[Option<Region>], gdims: &[i64], g0: i64) -> Option<(usize, i64)> {
        if let Some(intervals) = &self.intervals {
            let i = intervals.partition_point(|&(s, _, _)| s <= g0);
            if i == 0 {
                return None;
            }
            let (s, l, t) = intervals[i - 1];
            return (g0 < s + l).then_some((t, g0 - s));
        }
        let coords = unflatten(gdims, g0);
        for (t, b) in boxes.iter().enumerate() {
            let Some(r) = b else { continue };
            if coords
                .iter()
                .zip(r.start.iter().zip(&r.count))
                .all(|(&c, (&s, &n))| c >= s && c < s + n)
            {
                let mut off = 0i64;
                for d in 0..gdims.len() {
                    off = off * r.count[d] + (coords[d] - r.start[d]);
                }
                return Some((t, off));
            }
        }
        None
    }
}

/// Data runs of a box io buffer, derived from the received slots. Used at
/// flush time when holes must not be written.
pub(crate) fn data_runs(iodesc: &IoDesc) -> Vec<(i64, i64)> {
    let mut covered: Vec<i64> = iodesc.rindex.iter().map(|&x| x as i64).collect();
    covered.sort_unstable();
    covered.dedup();
    coalesce_runs(&covered)
}
