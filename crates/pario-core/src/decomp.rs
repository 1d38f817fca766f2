//! Decomposition descriptors: construction, registry, and lifecycle.
//!
//! A decomposition is built collectively from every rank's compmap (local
//! element index -> 1-based global offset, 0 = "do not transfer"), carries
//! the communication plan produced by one of the rearrangers, and is
//! destroyed by `free_decomp` on every rank of its iosystem.

use std::sync::Arc;

use log::debug;

use crate::comm::{allreduce_bool_or, bcast_i32, Comm};
use crate::context::Pario;
use crate::dispatch::{MsgTag, Value};
use crate::error::{Error, Result};
use crate::rearrange::{self, Region};
use crate::types::{PioType, Rearranger};

/// One decomposition: the normalized map plus the communication plan.
pub struct IoDesc {
    pub ioid: i32,
    pub iosysid: i32,
    pub rearranger: Rearranger,
    pub piotype: PioType,
    pub elem_size: usize,
    pub ndims: usize,
    pub gdimlen: Vec<i64>,
    /// Number of local elements handled (the compmap length).
    pub ndof: usize,
    /// The compmap, sorted nondecreasing when `needs_sort` is set.
    pub map: Vec<i64>,
    pub needs_sort: bool,
    /// Original position of each sorted slot: `map[k] = compmap[remap[k]]`.
    pub remap: Option<Vec<usize>>,
    /// Set when some rank's map repeats a nonzero offset; writes fail.
    pub read_only: bool,

    /// Send counts per target (I/O task for box, subset rank for subset).
    pub scount: Vec<usize>,
    /// Exchange-comm rank of each target slot.
    pub starget: Vec<usize>,
    /// Positions into `map`, concatenated in target order.
    pub sindex: Vec<usize>,

    /// Number of distinct peers this rank receives from.
    pub nrecvs: usize,
    /// Peers (exchange-comm ranks), ascending.
    pub rfrom: Vec<usize>,
    /// Element counts per peer.
    pub rcount: Vec<usize>,
    /// Destination io-buffer slot of each received element, grouped by peer.
    pub rindex: Vec<usize>,

    /// Io-buffer length on this rank.
    pub llen: usize,
    /// Max `llen` across I/O ranks (uniform-buffer backends need it).
    pub max_iobuf_len: usize,
    /// Data regions written by this I/O rank.
    pub regions: Vec<Region>,
    /// Max region count across I/O ranks.
    pub maxregions: usize,
    /// Hole regions this I/O rank fills.
    pub fill_regions: Vec<Region>,
    pub maxfillregions: usize,
    /// True iff the union of all compmaps covers less than the global array.
    pub needs_fill: bool,
    /// I/O tasks actually used by the exchange.
    pub num_aiotasks: usize,
    /// The subset rearranger's private gather/scatter comm.
    pub subset_comm: Option<Arc<dyn Comm>>,
}

impl std::fmt::Debug for IoDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDesc")
            .field("ioid", &self.ioid)
            .field("iosysid", &self.iosysid)
            .finish_non_exhaustive()
    }
}

impl IoDesc {
    pub(crate) fn new(
        iosysid: i32,
        rearranger: Rearranger,
        piotype: PioType,
        elem_size: usize,
        gdimlen: &[i64],
        map: Vec<i64>,
        needs_sort: bool,
        remap: Option<Vec<usize>>,
        read_only: bool,
    ) -> Self {
        Self {
            ioid: 0,
            iosysid,
            rearranger,
            piotype,
            elem_size,
            ndims: gdimlen.len(),
            gdimlen: gdimlen.to_vec(),
            ndof: map.len(),
            map,
            needs_sort,
            remap,
            read_only,
            scount: Vec::new(),
            starget: Vec::new(),
            sindex: Vec::new(),
            nrecvs: 0,
            rfrom: Vec::new(),
            rcount: Vec::new(),
            rindex: Vec::new(),
            llen: 0,
            max_iobuf_len: 0,
            regions: Vec::new(),
            maxregions: 0,
            fill_regions: Vec::new(),
            maxfillregions: 0,
            needs_fill: false,
            num_aiotasks: 0,
            subset_comm: None,
        }
    }

    /// Count of nonzero entries in the local map.
    pub fn local_transfers(&self) -> usize {
        self.map.iter().filter(|&&v| v > 0).count()
    }

    /// Positions of the nonzero map entries, ascending.
    pub(crate) fn nonzero_positions(&self) -> Vec<usize> {
        (0..self.ndof).filter(|&k| self.map[k] > 0).collect()
    }

    /// Original user-buffer index of the sorted map slot `k`.
    pub(crate) fn user_index(&self, k: usize) -> usize {
        self.remap.as_ref().map_or(k, |r| r[k])
    }
}

impl Pario {
    /// Build a decomposition from this rank's compmap (1-based offsets into
    /// the row-major global array, 0 = hole). Collective over the iosystem.
    ///
    /// `iostart`/`iocount` optionally pin this I/O rank's region instead of
    /// the computed division (box rearranger).
    pub fn init_decomp(
        &mut self,
        iosysid: i32,
        piotype: PioType,
        gdimlen: &[i64],
        compmap: &[i64],
        rearranger: Option<Rearranger>,
        iostart: Option<&[i64]>,
        iocount: Option<&[i64]>,
    ) -> Result<i32> {
        let ios = self.iosys(iosysid)?;
        if gdimlen.is_empty() || gdimlen.iter().any(|&d| d <= 0) {
            return Err(Error::InvalidArgument);
        }
        let total = rearrange::product(gdimlen);
        if compmap.iter().any(|&v| v < 0 || v > total) {
            return Err(Error::InvalidArgument);
        }
        if iostart.is_some() != iocount.is_some() {
            return Err(Error::InvalidArgument);
        }
        if let (Some(s), Some(c)) = (iostart, iocount)
            && (s.len() != gdimlen.len() || c.len() != gdimlen.len())
        {
            return Err(Error::InvalidArgument);
        }
        if ios.async_mode
            && let Some(r) = rearranger
            && r != ios.default_rearranger
        {
            return Err(Error::BadRearranger);
        }

        self.forward(
            iosysid,
            MsgTag::InitDecomp,
            &[
                Value::I32(iosysid),
                Value::I32(piotype.tag()),
                Value::I64Vec(gdimlen.to_vec()),
                Value::I32(rearranger.map_or(-1, |r| r.tag())),
                Value::OptI64Vec(iostart.map(|s| s.to_vec())),
                Value::OptI64Vec(iocount.map(|c| c.to_vec())),
            ],
        )?;
        self.init_decomp_impl(iosysid, piotype, gdimlen, compmap, rearranger, iostart, iocount)
    }

    /// Same as [`Pario::init_decomp`] with a 0-based compmap where -1 marks
    /// a hole.
    pub fn init_decomp_zero_based(
        &mut self,
        iosysid: i32,
        piotype: PioType,
        gdimlen: &[i64],
        compmap: &[i64],
        rearranger: Option<Rearranger>,
    ) -> Result<i32> {
        let shifted: Vec<i64> = compmap
            .iter()
            .map(|&v| if v < 0 { 0 } else { v + 1 })
            .collect();
        self.init_decomp(iosysid, piotype, gdimlen, &shifted, rearranger, None, None)
    }

    /// Build a block-cyclic decomposition: this rank owns the hyperslab
    /// `start`/`count` of the global array. The compmap is synthesized.
    pub fn init_decomp_block(
        &mut self,
        iosysid: i32,
        piotype: PioType,
        gdimlen: &[i64],
        start: &[i64],
        count: &[i64],
    ) -> Result<i32> {
        if start.len() != gdimlen.len() || count.len() != gdimlen.len() {
            return Err(Error::InvalidArgument);
        }
        for d in 0..gdimlen.len() {
            if start[d] < 0 || count[d] < 0 || start[d] + count[d] > gdimlen[d] {
                return Err(Error::InvalidArgument);
            }
        }
        let maplen = rearrange::product(count);
        let mut compmap = Vec::with_capacity(maplen as usize);
        let mut idx = vec![0i64; count.len()];
        for _ in 0..maplen {
            let coords: Vec<i64> = start.iter().zip(&idx).map(|(s, i)| s + i).collect();
            compmap.push(rearrange::flatten(gdimlen, &coords) + 1);
            for d in (0..count.len()).rev() {
                idx[d] += 1;
                if idx[d] < count[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        self.init_decomp(iosysid, piotype, gdimlen, &compmap, None, None, None)
    }

    pub(crate) fn init_decomp_impl(
        &mut self,
        iosysid: i32,
        piotype: PioType,
        gdimlen: &[i64],
        compmap: &[i64],
        rearranger: Option<Rearranger>,
        iostart: Option<&[i64]>,
        iocount: Option<&[i64]>,
    ) -> Result<i32> {
        let elem_size = piotype.size().ok_or(Error::InvalidArgument)?;
        let blocksize = self.blocksize;
        let ios = self.iosys(iosysid)?;
        let rearr = rearranger.unwrap_or(ios.default_rearranger);
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let async_mode = ios.async_mode;

        // Normalize the map: a stable sort when nonzero offsets run
        // backwards, with the inverse permutation kept for unpacking.
        let mut needs_sort = false;
        for m in 1..compmap.len() {
            if compmap[m] > 0 && compmap[m] < compmap[m - 1] {
                needs_sort = true;
                break;
            }
        }
        let (map, remap) = if needs_sort {
            let mut order: Vec<usize> = (0..compmap.len()).collect();
            order.sort_by_key(|&i| compmap[i]);
            let sorted: Vec<i64> = order.iter().map(|&i| compmap[i]).collect();
            (sorted, Some(order))
        } else {
            (compmap.to_vec(), None)
        };

        // Multi-way duplicate scan; the input map is never modified.
        let local_dup = {
            let mut nz: Vec<i64> = compmap.iter().copied().filter(|&v| v > 0).collect();
            nz.sort_unstable();
            nz.windows(2).any(|w| w[0] == w[1])
        };
        let read_only = allreduce_bool_or(union.as_ref(), local_dup)?;

        let mut iodesc = IoDesc::new(
            iosysid, rearr, piotype, elem_size, gdimlen, map, needs_sort, remap, read_only,
        );

        match rearr {
            Rearranger::Box => {
                rearrange::box_rearrange::box_rearrange_create(
                    ios, &mut iodesc, blocksize, iostart, iocount,
                )?;
            }
            Rearranger::Subset => {
                rearrange::subset_rearrange::subset_rearrange_create(ios, &mut iodesc)?;
            }
        }

        // The id is agreed on everywhere: broadcast from the I/O root when
        // async, the shared deterministic counter otherwise.
        let mut ioid = self.next_ioid;
        if async_mode {
            bcast_i32(union.as_ref(), ioroot, &mut ioid)?;
        }
        self.next_ioid = ioid + 1;
        iodesc.ioid = ioid;
        debug!(
            "init_decomp ioid={} rearr={:?} ndof={} llen={} nrecvs={} regions={} needs_fill={} read_only={}",
            ioid,
            rearr,
            iodesc.ndof,
            iodesc.llen,
            iodesc.nrecvs,
            iodesc.regions.len(),
            iodesc.needs_fill,
            iodesc.read_only,
        );
        self.decomps.insert(ioid, iodesc);
        Ok(ioid)
    }

    /// Release a decomposition. Collective; exactly one call per rank per
    /// id is valid, a second call returns `BadId`.
    pub fn free_decomp(&mut self, ioid: i32) -> Result<()> {
        let iosysid = self.decomp(ioid)?.iosysid;
        self.forward(
            iosysid,
            MsgTag::FreeDecomp,
            &[Value::I32(iosysid), Value::I32(ioid)],
        )?;
        self.decomps.remove(&ioid).ok_or(Error::BadId)?;
        Ok(())
    }

    /// Number of local array elements handled by a decomposition.
    pub fn local_array_size(&self, ioid: i32) -> Result<usize> {
        Ok(self.decomp(ioid)?.ndof)
    }
}
