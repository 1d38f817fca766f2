//! Distributed-array reads and writes.
//!
//! Writes sharing a decomposition aggregate in a per-(file, ioid) multi
//! buffer and travel as one rearranged payload when the buffer flushes:
//! pack on the compute side, one swap, per-region driver writes (plus the
//! hole grid with the fill value) on the I/O side. Reads run the same
//! pipeline in reverse.

use std::sync::Arc;

use log::{debug, trace};

use crate::comm::Comm;
use crate::context::Pario;
use crate::decomp::IoDesc;
use crate::dispatch::{MsgTag, Value};
use crate::error::{Error, Result};
use crate::file::{agree, FillMode, VarDesc};
use crate::rearrange::{linear_to_regions, Region};
use crate::rearrange::box_rearrange::data_runs;
use crate::swapm::{swapm, SwapDir};
use crate::types::{convert, PioType, Rearranger};

/// Buffered darray writes sharing one decomposition.
pub struct WriteMultiBuf {
    pub(crate) varids: Vec<i32>,
    pub(crate) frames: Vec<i32>,
    pub(crate) fillvalues: Vec<Option<Vec<u8>>>,
    /// `nvars x (ndof * elem_size)` bytes, appended in write order.
    pub(crate) payload: Vec<u8>,
    pub(crate) record_mode: bool,
}

impl WriteMultiBuf {
    fn new(record_mode: bool) -> Self {
        Self {
            varids: Vec::new(),
            frames: Vec::new(),
            fillvalues: Vec::new(),
            payload: Vec::new(),
            record_mode,
        }
    }
}

impl Pario {
    /// Buffer one variable's worth of a distributed array for writing.
    ///
    /// `array` holds `local_array_size(ioid)` elements of the
    /// decomposition's type. The write lands in the file when the buffer
    /// flushes: at `flush`, at the byte cap, at `sync_file`, or at close.
    pub fn write_darray(
        &mut self,
        ncid: i32,
        varid: i32,
        ioid: i32,
        array: &[u8],
        fillvalue: Option<&[u8]>,
        flush: bool,
    ) -> Result<()> {
        let (record_var, frame) = {
            let file = self.file(ncid)?;
            file.check_healthy()?;
            if file.define_mode {
                return Err(Error::InvalidArgument);
            }
            let d = self.decomp(ioid)?;
            if d.iosysid != file.iosysid {
                return Err(Error::InvalidArgument);
            }
            if d.read_only {
                return Err(Error::InvalidDecomposition);
            }
            let ios = self.iosys(file.iosysid)?;
            if ios.compproc && array.len() != d.ndof * d.elem_size {
                return Err(Error::InvalidArgument);
            }
            if let Some(f) = fillvalue
                && f.len() != d.elem_size
            {
                return Err(Error::InvalidArgument);
            }
            let vdesc = file.var(varid)?;
            check_var_shape(file_dims(file, vdesc), d)?;
            let frame = if vdesc.record_var {
                if vdesc.record < 0 {
                    return Err(Error::InvalidArgument);
                }
                vdesc.record
            } else {
                -1
            };
            (vdesc.record_var, frame)
        };

        // Record and non-record variables never share a buffer entry.
        let mismatched = self
            .file(ncid)?
            .multibufs
            .get(&ioid)
            .is_some_and(|mb| mb.record_mode != record_var);
        if mismatched {
            self.flush_darray_buffer(ncid, ioid)?;
        }

        let (elem_size, max_iobuf_len) = {
            let d = self.decomp(ioid)?;
            (d.elem_size, d.max_iobuf_len)
        };
        let file = self.file_mut(ncid)?;
        let mb = file
            .multibufs
            .entry(ioid)
            .or_insert_with(|| WriteMultiBuf::new(record_var));
        mb.varids.push(varid);
        mb.frames.push(frame);
        mb.fillvalues.push(fillvalue.map(|f| f.to_vec()));
        mb.payload.extend_from_slice(array);
        let nvars = mb.varids.len();
        trace!("write_darray buffered ncid={ncid} varid={varid} ioid={ioid} nvars={nvars}");

        // The trigger uses the global max io-buffer length so every rank
        // decides identically.
        let projected = nvars * max_iobuf_len * elem_size;
        if flush || projected > self.buffer_limit {
            self.flush_darray_buffer(ncid, ioid)?;
        }
        Ok(())
    }

    /// Flush one (file, ioid) buffer entry, if present. Collective.
    pub fn flush_darray_buffer(&mut self, ncid: i32, ioid: i32) -> Result<()> {
        let Some(mb) = self.file_mut(ncid)?.multibufs.remove(&ioid) else {
            return Ok(());
        };
        let iosysid = self.file(ncid)?.iosysid;
        let fillflags: Vec<i32> = mb.fillvalues.iter().map(|f| i32::from(f.is_some())).collect();
        let fillcat: Vec<u8> = mb.fillvalues.iter().flatten().flatten().copied().collect();
        self.forward(
            iosysid,
            MsgTag::WriteDarrayMulti,
            &[
                Value::I32(ncid),
                Value::I32(ioid),
                Value::I32(mb.varids.len() as i32),
                Value::I32Vec(mb.varids.clone()),
                Value::I32Vec(mb.frames.clone()),
                Value::I32Vec(fillflags),
                Value::Bytes(fillcat),
            ],
        )?;
        let res = self.write_darray_multi_impl(
            ncid,
            ioid,
            &mb.varids,
            &mb.frames,
            &mb.fillvalues,
            &mb.payload,
        );
        if let Err(e) = &res {
            debug!("flush failed for ncid={ncid} ioid={ioid}: {e}");
            if let Ok(file) = self.file_mut(ncid) {
                file.error = Some(e.clone());
            }
        }
        res
    }

    /// Flush every buffered entry of a file, in ioid order.
    pub(crate) fn flush_file(&mut self, ncid: i32) -> Result<()> {
        let mut ioids: Vec<i32> = self.file(ncid)?.multibufs.keys().copied().collect();
        ioids.sort_unstable();
        for ioid in ioids {
            self.flush_darray_buffer(ncid, ioid)?;
        }
        Ok(())
    }

    pub(crate) fn write_darray_multi_impl(
        &mut self,
        ncid: i32,
        ioid: i32,
        varids: &[i32],
        frames: &[i32],
        fills: &[Option<Vec<u8>>],
        payload: &[u8],
    ) -> Result<()> {
        let nvars = varids.len();
        let d = self.decomps.get(&ioid).ok_or(Error::BadId)?;
        let ios = self.iosystems.get(&d.iosysid).ok_or(Error::BadId)?;
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let handler = ios.error_handler;
        let exchange: Arc<dyn Comm> = match d.rearranger {
            Rearranger::Box => Arc::clone(&ios.union_comm),
            Rearranger::Subset => Arc::clone(d.subset_comm.as_ref().ok_or(Error::BadRearranger)?),
        };

        let sendbufs = pack_sendbufs(d, nvars, payload, exchange.size());
        let recvcounts = recv_byte_counts(d, nvars, exchange.size());
        let recvd = swapm(
            exchange.as_ref(),
            &sendbufs,
            &recvcounts,
            &ios.rearr_opts,
            SwapDir::CompToIo,
        )?;

        let outcome = if ios.ioproc {
            let file = self.files.get_mut(&ncid).ok_or(Error::BadId)?;
            write_io_side(file, d, varids, frames, fills, &recvd)
        } else {
            Ok(())
        };
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    /// Read one variable through a decomposition into `array`
    /// (`local_array_size(ioid)` elements). Local slots whose map entry is
    /// 0 are left untouched. Collective.
    pub fn read_darray(&mut self, ncid: i32, varid: i32, ioid: i32, array: &mut [u8]) -> Result<()> {
        {
            let file = self.file(ncid)?;
            file.check_healthy()?;
            if file.define_mode {
                return Err(Error::InvalidArgument);
            }
            let d = self.decomp(ioid)?;
            if d.iosysid != file.iosysid {
                return Err(Error::InvalidArgument);
            }
            let ios = self.iosys(file.iosysid)?;
            if ios.compproc && array.len() != d.ndof * d.elem_size {
                return Err(Error::InvalidArgument);
            }
            let vdesc = file.var(varid)?;
            check_var_shape(file_dims(file, vdesc), d)?;
        }
        let iosysid = self.file(ncid)?.iosysid;
        self.forward(
            iosysid,
            MsgTag::ReadDarray,
            &[Value::I32(ncid), Value::I32(varid), Value::I32(ioid)],
        )?;
        self.read_darray_impl(ncid, varid, ioid, array)
    }

    pub(crate) fn read_darray_impl(
        &mut self,
        ncid: i32,
        varid: i32,
        ioid: i32,
        array: &mut [u8],
    ) -> Result<()> {
        let d = self.decomps.get(&ioid).ok_or(Error::BadId)?;
        let ios = self.iosystems.get(&d.iosysid).ok_or(Error::BadId)?;
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let handler = ios.error_handler;
        let exchange: Arc<dyn Comm> = match d.rearranger {
            Rearranger::Box => Arc::clone(&ios.union_comm),
            Rearranger::Subset => Arc::clone(d.subset_comm.as_ref().ok_or(Error::BadRearranger)?),
        };
        let elem_size = d.elem_size;

        // I/O side: read the regions, then serve each peer its elements.
        let mut iobuf = vec![0u8; d.llen * elem_size];
        let outcome = if ios.ioproc {
            let file = self.files.get(&ncid).ok_or(Error::BadId)?;
            read_io_side(file, d, varid, &mut iobuf)
        } else {
            Ok(())
        };
        agree(union.as_ref(), ioroot, handler, outcome)?;

        let n = exchange.size();
        let mut sendbufs = vec![Vec::new(); n];
        let mut roff = 0usize;
        for (pi, &src) in d.rfrom.iter().enumerate() {
            let cnt = d.rcount[pi];
            let buf = &mut sendbufs[src];
            buf.reserve(cnt * elem_size);
            for j in 0..cnt {
                let slot = d.rindex[roff + j];
                buf.extend_from_slice(&iobuf[slot * elem_size..(slot + 1) * elem_size]);
            }
            roff += cnt;
        }
        let mut recvcounts = vec![0usize; n];
        for (ti, &cnt) in d.scount.iter().enumerate() {
            if cnt > 0 {
                recvcounts[d.starget[ti]] = cnt * elem_size;
            }
        }
        let recvd = swapm(
            exchange.as_ref(),
            &sendbufs,
            &recvcounts,
            &ios.rearr_opts,
            SwapDir::IoToComp,
        )?;

        // Scatter back to the caller's layout.
        let mut seg = 0usize;
        for (ti, &cnt) in d.scount.iter().enumerate() {
            let idxs = &d.sindex[seg..seg + cnt];
            seg += cnt;
            if cnt == 0 {
                continue;
            }
            let block = &recvd[d.starget[ti]];
            for (j, &k) in idxs.iter().enumerate() {
                let u = d.user_index(k);
                array[u * elem_size..(u + 1) * elem_size]
                    .copy_from_slice(&block[j * elem_size..(j + 1) * elem_size]);
            }
        }
        Ok(())
    }
}

fn file_dims<'a>(file: &'a crate::file::File, vdesc: &VarDesc) -> Vec<&'a crate::file::DimDesc> {
    vdesc
        .dimids
        .iter()
        .filter_map(|id| file.dims.get(id))
        .collect()
}

/// The variable's non-record dimensions must match the decomposition's
/// global shape.
fn check_var_shape(dims: Vec<&crate::file::DimDesc>, d: &IoDesc) -> Result<()> {
    let spatial: Vec<i64> = dims
        .iter()
        .filter(|dim| dim.len != 0)
        .map(|dim| dim.len)
        .collect();
    if spatial != d.gdimlen {
        return Err(Error::VarDimMismatch);
    }
    Ok(())
}

/// Gather the payload into one contiguous byte buffer per exchange peer:
/// per target, `nvars` blocks of its elements in plan order.
fn pack_sendbufs(d: &IoDesc, nvars: usize, payload: &[u8], comm_size: usize) -> Vec<Vec<u8>> {
    let elem_size = d.elem_size;
    let mut sendbufs = vec![Vec::new(); comm_size];
    let mut seg = 0usize;
    for (ti, &cnt) in d.scount.iter().enumerate() {
        let idxs = &d.sindex[seg..seg + cnt];
        seg += cnt;
        if cnt == 0 {
            continue;
        }
        let buf = &mut sendbufs[d.starget[ti]];
        buf.reserve(nvars * cnt * elem_size);
        for v in 0..nvars {
            let arr = &payload[v * d.ndof * elem_size..(v + 1) * d.ndof * elem_size];
            for &k in idxs {
                let u = d.user_index(k);
                buf.extend_from_slice(&arr[u * elem_size..(u + 1) * elem_size]);
            }
        }
    }
    sendbufs
}

fn recv_byte_counts(d: &IoDesc, nvars: usize, comm_size: usize) -> Vec<usize> {
    let mut recvcounts = vec![0usize; comm_size];
    for (pi, &src) in d.rfrom.iter().enumerate() {
        recvcounts[src] = nvars * d.rcount[pi] * d.elem_size;
    }
    recvcounts
}

/// Assemble each variable's io buffer from the received blocks and hand the
/// regions to the driver, fill values covering the holes.
fn write_io_side(
    file: &mut crate::file::File,
    d: &IoDesc,
    varids: &[i32],
    frames: &[i32],
    fills: &[Option<Vec<u8>>],
    recvd: &[Vec<u8>],
) -> Result<()> {
    let elem_size = d.elem_size;
    let fill_on = file.fill_mode == FillMode::Fill;

    for (vi, &varid) in varids.iter().enumerate() {
        let vdesc = file.vars.get(&varid).ok_or(Error::BadId)?;
        let var_ty = vdesc.piotype;
        let record_var = vdesc.record_var;
        let frame = frames[vi];
        let fill = fills[vi]
            .clone()
            .or_else(|| vdesc.fillvalue.clone())
            .unwrap_or_else(|| d.piotype.default_fill());

        let mut iobuf = vec![0u8; d.llen * elem_size];
        if d.rearranger == Rearranger::Box && d.needs_fill && fill_on {
            for slot in 0..d.llen {
                iobuf[slot * elem_size..(slot + 1) * elem_size].copy_from_slice(&fill);
            }
        }

        // Scatter the received blocks into buffer slots.
        let mut roff = 0usize;
        for (pi, &src) in d.rfrom.iter().enumerate() {
            let cnt = d.rcount[pi];
            let block = &recvd[src][vi * cnt * elem_size..(vi + 1) * cnt * elem_size];
            for j in 0..cnt {
                let slot = d.rindex[roff + j];
                iobuf[slot * elem_size..(slot + 1) * elem_size]
                    .copy_from_slice(&block[j * elem_size..(j + 1) * elem_size]);
            }
            roff += cnt;
        }

        let dfile = file.driver_file.as_mut().ok_or(Error::Transport(0))?;
        if d.rearranger == Rearranger::Box && d.needs_fill && !fill_on {
            // Fill is off: write only the slots that actually carry data.
            write_box_data_runs(dfile.as_mut(), d, varid, record_var, frame, var_ty, &iobuf)?;
        } else {
            for r in 0..d.maxregions {
                let Some(region) = d.regions.get(r) else { continue };
                let a = region.offset * elem_size;
                let b = a + region.nelems() as usize * elem_size;
                let data = convert(d.piotype, var_ty, &iobuf[a..b])?;
                put_region(dfile.as_mut(), varid, record_var, frame, region, &data)?;
            }
        }

        if d.rearranger == Rearranger::Subset && d.needs_fill && fill_on {
            let fill_disk = convert(d.piotype, var_ty, &fill)?;
            for r in 0..d.maxfillregions {
                let Some(region) = d.fill_regions.get(r) else { continue };
                let n = region.nelems() as usize;
                let mut data = Vec::with_capacity(n * fill_disk.len());
                for _ in 0..n {
                    data.extend_from_slice(&fill_disk);
                }
                put_region(dfile.as_mut(), varid, record_var, frame, region, &data)?;
            }
        }
    }
    Ok(())
}

/// Write the covered runs of a box chunk, skipping holes.
fn write_box_data_runs(
    dfile: &mut dyn crate::driver::DriverFile,
    d: &IoDesc,
    varid: i32,
    record_var: bool,
    frame: i32,
    var_ty: PioType,
    iobuf: &[u8],
) -> Result<()> {
    let Some(first) = d.regions.first() else {
        return Ok(());
    };
    let chunk_start = crate::rearrange::flatten(&d.gdimlen, &first.start);
    let elem_size = d.elem_size;
    for (slot, len) in data_runs(d) {
        for region in linear_to_regions(&d.gdimlen, chunk_start + slot, len, slot as usize) {
            let a = region.offset * elem_size;
            let b = a + region.nelems() as usize * elem_size;
            let data = convert(d.piotype, var_ty, &iobuf[a..b])?;
            put_region(dfile, varid, record_var, frame, &region, &data)?;
        }
    }
    Ok(())
}

fn put_region(
    dfile: &mut dyn crate::driver::DriverFile,
    varid: i32,
    record_var: bool,
    frame: i32,
    region: &Region,
    data: &[u8],
) -> Result<()> {
    if record_var {
        let mut start = Vec::with_capacity(region.start.len() + 1);
        start.push(frame as i64);
        start.extend_from_slice(&region.start);
        let mut count = Vec::with_capacity(region.count.len() + 1);
        count.push(1);
        count.extend_from_slice(&region.count);
        dfile.put_vara(varid, &start, &count, data)
    } else {
        dfile.put_vara(varid, &region.start, &region.count, data)
    }
}

fn get_region(
    dfile: &dyn crate::driver::DriverFile,
    varid: i32,
    record_var: bool,
    frame: i32,
    region: &Region,
    out: &mut [u8],
) -> Result<()> {
    if record_var {
        let mut start = Vec::with_capacity(region.start.len() + 1);
        start.push(frame as i64);
        start.extend_from_slice(&region.start);
        let mut count = Vec::with_capacity(region.count.len() + 1);
        count.push(1);
        count.extend_from_slice(&region.count);
        dfile.get_vara(varid, &start, &count, out)
    } else {
        dfile.get_vara(varid, &region.start, &region.count, out)
    }
}

/// Read this I/O rank's regions into the decomposition-typed io buffer.
fn read_io_side(
    file: &crate::file::File,
    d: &IoDesc,
    varid: i32,
    iobuf: &mut [u8],
) -> Result<()> {
    let vdesc = file.vars.get(&varid).ok_or(Error::BadId)?;
    let var_ty = vdesc.piotype;
    let var_size = var_ty.size().ok_or(Error::InvalidArgument)?;
    let record_var = vdesc.record_var;
    let frame = if record_var {
        if vdesc.record < 0 {
            return Err(Error::InvalidArgument);
        }
        vdesc.record
    } else {
        -1
    };
    let Some(dfile) = file.driver_file.as_deref() else {
        return Err(Error::Transport(0));
    };
    let elem_size = d.elem_size;
    for r in 0..d.maxregions {
        let Some(region) = d.regions.get(r) else { continue };
        let n = region.nelems() as usize;
        let mut disk = vec![0u8; n * var_size];
        get_region(dfile, varid, record_var, frame, region, &mut disk)?;
        let mem = convert(var_ty, d.piotype, &disk)?;
        let a = region.offset * elem_size;
        iobuf[a..a + n * elem_size].copy_from_slice(&mem);
    }
    Ok(())
}
