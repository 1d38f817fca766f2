//! Open files: per-file metadata mirrored on every rank of the iosystem,
//! with the driver handle held only on I/O ranks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;

use crate::comm::{bcast_i32, Comm};
use crate::context::Pario;
use crate::darray::WriteMultiBuf;
use crate::dispatch::{MsgTag, Value};
use crate::driver::{DriverFile, OpenMode, UNLIMITED};
use crate::error::{Error, ErrorHandler, Result};
use crate::types::PioType;

/// File-level fill behavior for darray holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Fill,
    NoFill,
}

pub struct DimDesc {
    pub dimid: i32,
    pub name: String,
    /// 0 marks the record dimension.
    pub len: i64,
}

pub struct VarDesc {
    pub varid: i32,
    pub name: String,
    pub piotype: PioType,
    pub dimids: Vec<i32>,
    pub record_var: bool,
    /// Current frame for record variables; -1 until set.
    pub record: i32,
    pub fillvalue: Option<Vec<u8>>,
}

/// One open file. The iosystem is referenced by id, so files hold no cycle
/// back to it.
pub struct File {
    pub ncid: i32,
    pub iosysid: i32,
    pub iotype: i32,
    pub path: String,
    pub mode: OpenMode,
    pub(crate) driver_file: Option<Box<dyn DriverFile>>,
    pub define_mode: bool,
    pub fill_mode: FillMode,
    pub(crate) dims: BTreeMap<i32, DimDesc>,
    pub(crate) vars: BTreeMap<i32, VarDesc>,
    pub(crate) next_dimid: i32,
    pub(crate) next_varid: i32,
    pub(crate) multibufs: HashMap<i32, WriteMultiBuf>,
    /// Sticky error: set by a failed flush, returned by every later
    /// operation until close.
    pub(crate) error: Option<Error>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("ncid", &self.ncid)
            .field("iosysid", &self.iosysid)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl File {
    pub fn var(&self, varid: i32) -> Result<&VarDesc> {
        self.vars.get(&varid).ok_or(Error::BadId)
    }

    pub fn dim(&self, dimid: i32) -> Result<&DimDesc> {
        self.dims.get(&dimid).ok_or(Error::BadId)
    }

    pub(crate) fn check_healthy(&self) -> Result<()> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Agree on the outcome of an I/O-side operation: the code observed at the
/// I/O root is broadcast so every rank returns the same result. With the
/// `Internal` handler an error aborts instead.
pub(crate) fn agree(
    union: &dyn Comm,
    ioroot: usize,
    handler: ErrorHandler,
    res: Result<()>,
) -> Result<()> {
    let mut code = match &res {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    let mut ok = i32::from(res.is_ok());
    bcast_i32(union, ioroot, &mut ok)?;
    bcast_i32(union, ioroot, &mut code)?;
    if ok != 0 {
        return Ok(());
    }
    let err = Error::from_code(code);
    if handler == ErrorHandler::Internal {
        log::error!("fatal I/O error: {err}");
        union.abort(code);
    }
    Err(err)
}

impl Pario {
    /// Create a file through the driver registered for `iotype`.
    /// Collective over the iosystem.
    pub fn create_file(&mut self, iosysid: i32, iotype: i32, path: &str, mode: OpenMode) -> Result<i32> {
        self.iosys(iosysid)?;
        self.forward(
            iosysid,
            MsgTag::CreateFile,
            &[
                Value::I32(iotype),
                Value::Str(path.to_string()),
                Value::I32(mode.bits() as i32),
            ],
        )?;
        self.open_or_create_impl(iosysid, iotype, path, mode, true)
    }

    /// Open an existing file. Collective over the iosystem.
    pub fn open_file(&mut self, iosysid: i32, iotype: i32, path: &str, mode: OpenMode) -> Result<i32> {
        self.iosys(iosysid)?;
        self.forward(
            iosysid,
            MsgTag::OpenFile,
            &[
                Value::I32(iotype),
                Value::Str(path.to_string()),
                Value::I32(mode.bits() as i32),
            ],
        )?;
        self.open_or_create_impl(iosysid, iotype, path, mode, false)
    }

    pub(crate) fn open_or_create_impl(
        &mut self,
        iosysid: i32,
        iotype: i32,
        path: &str,
        mode: OpenMode,
        create: bool,
    ) -> Result<i32> {
        let ios = self.iosys(iosysid)?;
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let ioproc = ios.ioproc;
        let handler = ios.error_handler;

        let ncid = self.next_ncid;
        self.next_ncid += 1;

        let mut driver_file = None;
        let outcome = if ioproc {
            match self.drivers.get(&iotype) {
                None => Err(Error::BadIoType),
                Some(d) => {
                    let r = if create {
                        d.create(path, mode)
                    } else {
                        d.open(path, mode)
                    };
                    r.map(|h| driver_file = Some(h))
                }
            }
        } else {
            Ok(())
        };
        agree(union.as_ref(), ioroot, handler, outcome)?;

        debug!("{} file ncid={} path={}", if create { "create" } else { "open" }, ncid, path);
        self.files.insert(
            ncid,
            File {
                ncid,
                iosysid,
                iotype,
                path: path.to_string(),
                mode,
                driver_file,
                define_mode: create,
                fill_mode: FillMode::default(),
                dims: BTreeMap::new(),
                vars: BTreeMap::new(),
                next_dimid: 0,
                next_varid: 0,
                multibufs: HashMap::new(),
                error: None,
            },
        );
        Ok(ncid)
    }

    /// Close a file, flushing buffered darrays first. Collective.
    pub fn close_file(&mut self, ncid: i32) -> Result<()> {
        let iosysid = self.file(ncid)?.iosysid;
        let flush_res = self.flush_file(ncid);
        self.forward(iosysid, MsgTag::CloseFile, &[Value::I32(ncid)])?;
        let close_res = self.close_file_impl(ncid);
        flush_res.and(close_res)
    }

    pub(crate) fn close_file_impl(&mut self, ncid: i32) -> Result<()> {
        let file = self.files.remove(&ncid).ok_or(Error::BadId)?;
        let ios = self.iosys(file.iosysid)?;
        let union = Arc::clone(&ios.union_comm);
        let handler = ios.error_handler;
        let ioroot = ios.ioroot;
        let outcome = match file.driver_file {
            Some(h) => h.close(),
            None => Ok(()),
        };
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    /// Flush buffered darrays and sync the driver. Collective.
    pub fn sync_file(&mut self, ncid: i32) -> Result<()> {
        let iosysid = self.file(ncid)?.iosysid;
        self.flush_file(ncid)?;
        self.forward(iosysid, MsgTag::Sync, &[Value::I32(ncid)])?;
        self.sync_file_impl(ncid)
    }

    pub(crate) fn sync_file_impl(&mut self, ncid: i32) -> Result<()> {
        let (union, ioroot, handler) = self.file_comms(ncid)?;
        let file = self.file_mut(ncid)?;
        let outcome = match file.driver_file.as_mut() {
            Some(h) => h.sync(),
            None => Ok(()),
        };
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    /// Re-enter define mode. Collective.
    pub fn redef(&mut self, ncid: i32) -> Result<()> {
        let iosysid = self.file(ncid)?.iosysid;
        self.flush_file(ncid)?;
        self.forward(iosysid, MsgTag::Redef, &[Value::I32(ncid)])?;
        self.redef_impl(ncid)
    }

    pub(crate) fn redef_impl(&mut self, ncid: i32) -> Result<()> {
        let (union, ioroot, handler) = self.file_comms(ncid)?;
        let file = self.file_mut(ncid)?;
        file.check_healthy()?;
        if file.define_mode {
            return Err(Error::InvalidArgument);
        }
        let outcome = match file.driver_file.as_mut() {
            Some(h) => h.redef(),
            None => Ok(()),
        };
        file.define_mode = true;
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    /// Leave define mode. Collective.
    pub fn enddef(&mut self, ncid: i32) -> Result<()> {
        let iosysid = self.file(ncid)?.iosysid;
        self.forward(iosysid, MsgTag::Enddef, &[Value::I32(ncid)])?;
        self.enddef_impl(ncid)
    }

    pub(crate) fn enddef_impl(&mut self, ncid: i32) -> Result<()> {
        let (union, ioroot, handler) = self.file_comms(ncid)?;
        let file = self.file_mut(ncid)?;
        file.check_healthy()?;
        if !file.define_mode {
            return Err(Error::InvalidArgument);
        }
        let outcome = match file.driver_file.as_mut() {
            Some(h) => h.enddef(),
            None => Ok(()),
        };
        file.define_mode = false;
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    /// Define a dimension. Requires define mode. Collective.
    pub fn def_dim(&mut self, ncid: i32, name: &str, len: i64) -> Result<i32> {
        let file = self.file(ncid)?;
        let iosysid = file.iosysid;
        if name.is_empty() || len < 0 {
            return Err(Error::InvalidArgument);
        }
        self.forward(
            iosysid,
            MsgTag::DefDim,
            &[
                Value::I32(ncid),
                Value::Str(name.to_string()),
                Value::I64(len),
            ],
        )?;
        self.def_dim_impl(ncid, name, len)
    }

    pub(crate) fn def_dim_impl(&mut self, ncid: i32, name: &str, len: i64) -> Result<i32> {
        let file = self.file_mut(ncid)?;
        file.check_healthy()?;
        if !file.define_mode {
            return Err(Error::InvalidArgument);
        }
        if file.dims.values().any(|d| d.name == name) {
            return Err(Error::InvalidArgument);
        }
        if len == UNLIMITED && file.dims.values().any(|d| d.len == UNLIMITED) {
            return Err(Error::InvalidArgument);
        }
        let dimid = file.next_dimid;
        file.next_dimid += 1;
        if let Some(h) = file.driver_file.as_mut() {
            let driver_id = h.def_dim(name, len)?;
            debug_assert_eq!(driver_id, dimid);
        }
        file.dims.insert(
            dimid,
            DimDesc {
                dimid,
                name: name.to_string(),
                len,
            },
        );
        Ok(dimid)
    }

    /// Define a variable. The record dimension, if used, must come first.
    /// Collective.
    pub fn def_var(&mut self, ncid: i32, name: &str, piotype: PioType, dimids: &[i32]) -> Result<i32> {
        let file = self.file(ncid)?;
        let iosysid = file.iosysid;
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.forward(
            iosysid,
            MsgTag::DefVar,
            &[
                Value::I32(ncid),
                Value::Str(name.to_string()),
                Value::I32(piotype.tag()),
                Value::I32Vec(dimids.to_vec()),
            ],
        )?;
        self.def_var_impl(ncid, name, piotype, dimids)
    }

    pub(crate) fn def_var_impl(
        &mut self,
        ncid: i32,
        name: &str,
        piotype: PioType,
        dimids: &[i32],
    ) -> Result<i32> {
        let file = self.file_mut(ncid)?;
        file.check_healthy()?;
        if !file.define_mode {
            return Err(Error::InvalidArgument);
        }
        if file.vars.values().any(|v| v.name == name) {
            return Err(Error::InvalidArgument);
        }
        let mut record_var = false;
        for (i, dimid) in dimids.iter().enumerate() {
            let dim = file.dims.get(dimid).ok_or(Error::BadId)?;
            if dim.len == UNLIMITED {
                if i != 0 {
                    return Err(Error::InvalidArgument);
                }
                record_var = true;
            }
        }
        let varid = file.next_varid;
        file.next_varid += 1;
        if let Some(h) = file.driver_file.as_mut() {
            let driver_id = h.def_var(name, piotype, dimids)?;
            debug_assert_eq!(driver_id, varid);
        }
        file.vars.insert(
            varid,
            VarDesc {
                varid,
                name: name.to_string(),
                piotype,
                dimids: dimids.to_vec(),
                record_var,
                record: -1,
                fillvalue: None,
            },
        );
        Ok(varid)
    }

    /// Attach a fill value to a variable, used for darray holes when the
    /// write supplies none. Collective.
    pub fn def_var_fill(&mut self, ncid: i32, varid: i32, fill: Option<&[u8]>) -> Result<()> {
        let file = self.file(ncid)?;
        let iosysid = file.iosysid;
        file.var(varid)?;
        self.forward(
            iosysid,
            MsgTag::DefVarFill,
            &[
                Value::I32(ncid),
                Value::I32(varid),
                Value::OptBytes(fill.map(|f| f.to_vec())),
            ],
        )?;
        self.def_var_fill_impl(ncid, varid, fill)
    }

    pub(crate) fn def_var_fill_impl(&mut self, ncid: i32, varid: i32, fill: Option<&[u8]>) -> Result<()> {
        let file = self.file_mut(ncid)?;
        let vdesc = file.vars.get_mut(&varid).ok_or(Error::BadId)?;
        vdesc.fillvalue = fill.map(|f| f.to_vec());
        Ok(())
    }

    /// Set the file-level fill mode, returning the previous one. Collective.
    pub fn set_fill(&mut self, ncid: i32, mode: FillMode) -> Result<FillMode> {
        let iosysid = self.file(ncid)?.iosysid;
        let tag_mode = match mode {
            FillMode::Fill => 0,
            FillMode::NoFill => 1,
        };
        self.forward(
            iosysid,
            MsgTag::SetFill,
            &[Value::I32(ncid), Value::I32(tag_mode)],
        )?;
        self.set_fill_impl(ncid, mode)
    }

    pub(crate) fn set_fill_impl(&mut self, ncid: i32, mode: FillMode) -> Result<FillMode> {
        let file = self.file_mut(ncid)?;
        Ok(std::mem::replace(&mut file.fill_mode, mode))
    }

    /// Set the record frame of a record variable. Collective.
    pub fn set_frame(&mut self, ncid: i32, varid: i32, frame: i32) -> Result<()> {
        let file = self.file(ncid)?;
        let iosysid = file.iosysid;
        if frame < 0 {
            return Err(Error::InvalidArgument);
        }
        self.forward(
            iosysid,
            MsgTag::SetFrame,
            &[Value::I32(ncid), Value::I32(varid), Value::I32(frame)],
        )?;
        self.set_frame_impl(ncid, varid, frame)
    }

    pub(crate) fn set_frame_impl(&mut self, ncid: i32, varid: i32, frame: i32) -> Result<()> {
        let file = self.file_mut(ncid)?;
        let vdesc = file.vars.get_mut(&varid).ok_or(Error::BadId)?;
        if !vdesc.record_var {
            return Err(Error::InvalidArgument);
        }
        vdesc.record = frame;
        Ok(())
    }

    /// Advance a record variable's frame by one. Collective.
    pub fn advance_frame(&mut self, ncid: i32, varid: i32) -> Result<()> {
        let iosysid = self.file(ncid)?.iosysid;
        self.forward(
            iosysid,
            MsgTag::AdvanceFrame,
            &[Value::I32(ncid), Value::I32(varid)],
        )?;
        self.advance_frame_impl(ncid, varid)
    }

    pub(crate) fn advance_frame_impl(&mut self, ncid: i32, varid: i32) -> Result<()> {
        let file = self.file_mut(ncid)?;
        let vdesc = file.vars.get_mut(&varid).ok_or(Error::BadId)?;
        if !vdesc.record_var {
            return Err(Error::InvalidArgument);
        }
        vdesc.record += 1;
        Ok(())
    }

    pub(crate) fn file_comms(&self, ncid: i32) -> Result<(Arc<dyn Comm>, usize, ErrorHandler)> {
        let file = self.file(ncid)?;
        let ios = self.iosys(file.iosysid)?;
        Ok((Arc::clone(&ios.union_comm), ios.ioroot, ios.error_handler))
    }
}
