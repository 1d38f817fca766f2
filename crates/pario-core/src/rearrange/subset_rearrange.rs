//! The subset rearranger: computational ranks are partitioned into disjoint
//! subsets, one per I/O rank. Each subset gathers through its own private
//! communicator and the I/O rank re-sorts the stream into regions.

use std::sync::Arc;

use log::trace;

use crate::comm::{allreduce_i64_max, allreduce_i64_sum, Comm};
use crate::decomp::IoDesc;
use crate::error::{Error, Result};
use crate::rearrange::{coalesce_runs, even_spans, find_span, linear_to_regions, product};
use crate::topology::IoSystem;
use crate::types::{bytes_to_i64s, i64s_to_bytes};

/// Build the subset plan. Collective over the union comm.
pub(crate) fn subset_rearrange_create(ios: &IoSystem, iodesc: &mut IoDesc) -> Result<()> {
    let union = ios.union_comm.as_ref();
    let gdims = iodesc.gdimlen.clone();
    let total = product(&gdims);

    // Deterministic round-robin of computational ranks over I/O ranks;
    // the I/O rank sorts first in its subset comm.
    let color = if ios.ioproc {
        ios.io_rank
    } else {
        ios.comp_rank % ios.num_iotasks as i32
    };
    let key = if ios.ioproc { 0 } else { 1 + ios.comp_rank };
    let subset: Arc<dyn Comm> = Arc::from(
        union
            .split(Some(color), key)?
            .ok_or(Error::Transport(0))?,
    );

    let nz = iodesc.nonzero_positions();
    let offs: Vec<i64> = nz.iter().map(|&k| iodesc.map[k] - 1).collect();
    iodesc.scount = vec![0; subset.size()];
    iodesc.scount[0] = nz.len();
    iodesc.starget = (0..subset.size()).collect();
    iodesc.sindex = nz;

    // Ship (implicitly ordered) global offsets to the subset's I/O rank.
    let gathered = subset.gatherv(0, &i64s_to_bytes(&offs))?;
    let mut distinct: Vec<i64> = Vec::new();
    if let Some(parts) = gathered {
        let mut stream: Vec<i64> = Vec::new();
        for (src, bytes) in parts.iter().enumerate() {
            if bytes.is_empty() {
                continue;
            }
            let v = bytes_to_i64s(bytes);
            iodesc.rfrom.push(src);
            iodesc.rcount.push(v.len());
            stream.extend(v);
        }
        iodesc.nrecvs = iodesc.rfrom.len();

        // Stable sort of the concatenated stream; rindex maps each incoming
        // element to its slot in the deduplicated sorted buffer.
        let mut order: Vec<usize> = (0..stream.len()).collect();
        order.sort_by_key(|&j| (stream[j], j));
        let mut rindex = vec![0usize; stream.len()];
        for &j in &order {
            if distinct.last() != Some(&stream[j]) {
                distinct.push(stream[j]);
            }
            rindex[j] = distinct.len() - 1;
        }
        iodesc.rindex = rindex;
        iodesc.llen = distinct.len();

        // Coalesce the sorted offsets into the region chain.
        let mut base = 0usize;
        let mut regions = Vec::new();
        for (s, l) in coalesce_runs(&distinct) {
            regions.extend(linear_to_regions(&gdims, s, l, base));
            base += l as usize;
        }
        iodesc.regions = regions;
        trace!(
            "subset io rank: llen={} regions={} nrecvs={}",
            iodesc.llen,
            iodesc.regions.len(),
            iodesc.nrecvs
        );
    }
    iodesc.num_aiotasks = ios.num_iotasks;
    iodesc.subset_comm = Some(subset);

    // Every nonzero offset lands on exactly one I/O rank, so the summed
    // buffer lengths measure global coverage.
    let covered = allreduce_i64_sum(union, iodesc.llen as i64)?;
    iodesc.needs_fill = covered < total;
    iodesc.max_iobuf_len = allreduce_i64_max(union, iodesc.llen as i64)? as usize;
    iodesc.maxregions = allreduce_i64_max(union, iodesc.regions.len() as i64)? as usize;

    if iodesc.needs_fill {
        if ios.ioproc {
            compute_fill_regions(ios, iodesc, &distinct, total)?;
        }
        iodesc.maxfillregions =
            allreduce_i64_max(union, iodesc.fill_regions.len() as i64)? as usize;
    }
    Ok(())
}

/// Each I/O rank owns a nominal span of the flattened array and fills the
/// holes in it: offsets covered by no subset. Coverage is exchanged between
/// I/O ranks so that data and fill regions tile the array exactly once.
fn compute_fill_regions(
    ios: &IoSystem,
    iodesc: &mut IoDesc,
    distinct: &[i64],
    total: i64,
) -> Result<()> {
    let io = ios.io_comm.as_ref().ok_or(Error::Transport(0))?;
    let (sstarts, slens) = even_spans(total, ios.num_iotasks);

    let mut parts: Vec<Vec<i64>> = vec![Vec::new(); io.size()];
    for &off in distinct {
        if let Some(owner) = find_span(&sstarts, &slens, off) {
            parts[owner].push(off);
        }
    }
    let enc: Vec<Vec<u8>> = parts.iter().map(|p| i64s_to_bytes(p)).collect();
    let recvd = io.alltoallv(&enc)?;

    let me = io.rank();
    let mut covered: Vec<i64> = recvd.iter().flat_map(|b| bytes_to_i64s(b)).collect();
    covered.sort_unstable();
    covered.dedup();

    let span_start = sstarts[me];
    let span_len = slens[me];
    let mut fill = Vec::new();
    let mut base = 0usize;
    let mut next = span_start;
    for &c in covered.iter().chain(std::iter::once(&(span_start + span_len))) {
        if c > next {
            let len = c - next;
            fill.extend(linear_to_regions(&iodesc.gdimlen, next, len, base));
            base += len as usize;
        }
        next = next.max(c + 1);
    }
    iodesc.fill_regions = fill;
    Ok(())
}
