//! Shared machinery for the box and subset rearrangers: hyperslab regions,
//! chunk arithmetic over the flattened global array, and the element
//! pack/scatter helpers used when buffers cross the transport.

pub mod box_rearrange;
pub mod subset_rearrange;

/// `i64::div_ceil` for non-negative operands (stable only for unsigned ints).
fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// A hyperslab on the I/O side: `start`/`count` per dimension plus the
/// element offset of its data within the rank's io buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    pub offset: usize,
}

impl Region {
    pub fn nelems(&self) -> i64 {
        self.count.iter().product()
    }
}

/// Product of dimension lengths.
pub fn product(dims: &[i64]) -> i64 {
    dims.iter().product()
}

/// Row-major flatten of coordinates.
pub fn flatten(gdims: &[i64], coords: &[i64]) -> i64 {
    let mut off = 0;
    for (c, d) in coords.iter().zip(gdims) {
        off = off * d + c;
    }
    off
}

/// Inverse of [`flatten`].
pub fn unflatten(gdims: &[i64], mut off: i64) -> Vec<i64> {
    let mut coords = vec![0i64; gdims.len()];
    for d in (0..gdims.len()).rev() {
        coords[d] = off % gdims[d];
        off /= gdims[d];
    }
    coords
}

/// Express the linear element range `[off, off+len)` of a row-major array
/// as hyperslab regions. Ranges aligned to whole rows produce one region;
/// unaligned heads and tails split off extra ones. Element offsets start at
/// `base` and advance in emission order.
pub fn linear_to_regions(gdims: &[i64], off: i64, len: i64, base: usize) -> Vec<Region> {
    let mut out = Vec::new();
    let mut next = base;
    emit(gdims, off, len, &mut next, &mut out);
    out
}

fn emit(gdims: &[i64], off: i64, len: i64, base: &mut usize, out: &mut Vec<Region>) {
    if len <= 0 {
        return;
    }
    if gdims.len() == 1 {
        out.push(Region {
            start: vec![off],
            count: vec![len],
            offset: *base,
        });
        *base += len as usize;
        return;
    }
    let inner: i64 = gdims[1..].iter().product();
    let row = off / inner;
    let col = off % inner;
    if col != 0 || len < inner {
        // Partial leading row: recurse into the inner space, then prefix
        // the row coordinate onto whatever it produced.
        let h = len.min(inner - col);
        let mark = out.len();
        emit(&gdims[1..], col, h, base, out);
        for r in &mut out[mark..] {
            r.start.insert(0, row);
            r.count.insert(0, 1);
        }
        emit(gdims, off + h, len - h, base, out);
    } else {
        let nrows = len / inner;
        let mut start = vec![0i64; gdims.len()];
        start[0] = row;
        let mut count = gdims.to_vec();
        count[0] = nrows;
        out.push(Region {
            start,
            count,
            offset: *base,
        });
        *base += (nrows * inner) as usize;
        emit(gdims, off + nrows * inner, len - nrows * inner, base, out);
    }
}

/// Coalesce a sorted, duplicate-free offset list into `(start, len)` runs
/// of consecutive values.
pub fn coalesce_runs(sorted: &[i64]) -> Vec<(i64, i64)> {
    let mut runs: Vec<(i64, i64)> = Vec::new();
    for &v in sorted {
        match runs.last_mut() {
            Some((s, l)) if *s + *l == v => *l += 1,
            _ => runs.push((v, 1)),
        }
    }
    runs
}

/// Divide the flattened global array into `num_iotasks` contiguous chunks
/// of approximately equal size, quantized to the block granularity. For
/// multi-dimensional arrays the quantum is whole outermost rows grouped to
/// reach at least `blocksize` elements, so every chunk recovers to a single
/// hyperslab. Returns (starts, lens, number of non-empty chunks).
pub fn chunk_bounds(gdims: &[i64], num_iotasks: usize, blocksize: i64) -> (Vec<i64>, Vec<i64>, usize) {
    let total = product(gdims);
    let quantum = if gdims.len() == 1 {
        blocksize.clamp(1, total.max(1))
    } else {
        let inner: i64 = gdims[1..].iter().product();
        let rows = div_ceil_i64(blocksize, inner).max(1);
        (rows * inner).min(total.max(1))
    };
    let per = div_ceil_i64(total, num_iotasks as i64);
    let chunk = div_ceil_i64(per, quantum) * quantum;
    let mut starts = Vec::with_capacity(num_iotasks);
    let mut lens = Vec::with_capacity(num_iotasks);
    for i in 0..num_iotasks {
        let s = (i as i64 * chunk).min(total);
        starts.push(s);
        lens.push((total - s).min(chunk));
    }
    let num_aiotasks = lens.iter().filter(|&&l| l > 0).count();
    (starts, lens, num_aiotasks)
}

/// Evenly divide `[0, total)` into `n` spans (no quantization). Used for
/// the nominal fill spans of the subset rearranger.
pub fn even_spans(total: i64, n: usize) -> (Vec<i64>, Vec<i64>) {
    let per = div_ceil_i64(total, n as i64).max(1);
    let mut starts = Vec::with_capacity(n);
    let mut lens = Vec::with_capacity(n);
    for i in 0..n {
        let s = (i as i64 * per).min(total);
        starts.push(s);
        lens.push((total - s).min(per));
    }
    (starts, lens)
}

/// Find the span owning a flattened offset by binary search over the span
/// starts. Spans must be contiguous from 0 and cover the offset.
pub fn find_span(starts: &[i64], lens: &[i64], off: i64) -> Option<usize> {
    let i = starts.partition_point(|&s| s <= off);
    if i == 0 {
        return None;
    }
    let i = i - 1;
    (off < starts[i] + lens[i]).then_some(i)
}

/// Gather elements at `indices` out of `src` (element-indexed) into `out`.
pub fn pack_elems(src: &[u8], elem_size: usize, indices: &[usize], out: &mut Vec<u8>) {
    for &i in indices {
        out.extend_from_slice(&src[i * elem_size..(i + 1) * elem_size]);
    }
}

/// Scatter packed elements of `src` into `dst` at `positions`.
pub fn scatter_elems(dst: &mut [u8], elem_size: usize, positions: &[usize], src: &[u8]) {
    for (j, &p) in positions.iter().enumerate() {
        dst[p * elem_size..(p + 1) * elem_size]
            .copy_from_slice(&src[j * elem_size..(j + 1) * elem_size]);
    }
}
