//! The async message machinery.
//!
//! Every operation a computational component can ask of the I/O group is a
//! tagged message with a fixed parameter schedule. The schedule table is
//! the single source of truth: the computational leader encodes against it
//! and the I/O side decodes against it, so the two stay in lock-step by
//! construction, and the table itself can be enumerated.

use std::sync::Arc;

use log::{debug, warn};

use crate::comm::TAG_MSG;
use crate::context::Pario;
use crate::driver::OpenMode;
use crate::error::{Error, Result};
use crate::file::FillMode;
use crate::types::{PioType, Rearranger};

/// Message tags, one per dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgTag {
    CreateFile = 1,
    OpenFile = 2,
    CloseFile = 3,
    Sync = 4,
    Redef = 5,
    Enddef = 6,
    DefDim = 7,
    DefVar = 8,
    DefVarFill = 9,
    SetFill = 10,
    SetFrame = 11,
    AdvanceFrame = 12,
    InitDecomp = 13,
    FreeDecomp = 14,
    WriteDarrayMulti = 15,
    ReadDarray = 16,
    WriteDecomp = 17,
    ReadDecomp = 18,
    Exit = 19,
}

/// All tags, in id order.
pub const ALL_TAGS: &[MsgTag] = &[
    MsgTag::CreateFile,
    MsgTag::OpenFile,
    MsgTag::CloseFile,
    MsgTag::Sync,
    MsgTag::Redef,
    MsgTag::Enddef,
    MsgTag::DefDim,
    MsgTag::DefVar,
    MsgTag::DefVarFill,
    MsgTag::SetFill,
    MsgTag::SetFrame,
    MsgTag::AdvanceFrame,
    MsgTag::InitDecomp,
    MsgTag::FreeDecomp,
    MsgTag::WriteDarrayMulti,
    MsgTag::ReadDarray,
    MsgTag::WriteDecomp,
    MsgTag::ReadDecomp,
    MsgTag::Exit,
];

impl MsgTag {
    pub fn from_i32(v: i32) -> Result<Self> {
        ALL_TAGS
            .iter()
            .copied()
            .find(|t| *t as i32 == v)
            .ok_or(Error::InvalidArgument)
    }
}

/// Wire kind of one schedule field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    I32,
    I64,
    Str,
    Bytes,
    I32Vec,
    I64Vec,
    OptBytes,
    OptI64Vec,
}

/// One operation's parameter schedule.
pub struct Schedule {
    pub tag: MsgTag,
    pub fields: &'static [(&'static str, FieldKind)],
}

/// The full schedule table, indexed by [`ALL_TAGS`] order.
pub const SCHEDULES: &[Schedule] = &[
    Schedule {
        tag: MsgTag::CreateFile,
        fields: &[
            ("iotype", FieldKind::I32),
            ("path", FieldKind::Str),
            ("mode", FieldKind::I32),
        ],
    },
    Schedule {
        tag: MsgTag::OpenFile,
        fields: &[
            ("iotype", FieldKind::I32),
            ("path", FieldKind::Str),
            ("mode", FieldKind::I32),
        ],
    },
    Schedule {
        tag: MsgTag::CloseFile,
        fields: &[("ncid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::Sync,
        fields: &[("ncid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::Redef,
        fields: &[("ncid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::Enddef,
        fields: &[("ncid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::DefDim,
        fields: &[
            ("ncid", FieldKind::I32),
            ("name", FieldKind::Str),
            ("len", FieldKind::I64),
        ],
    },
    Schedule {
        tag: MsgTag::DefVar,
        fields: &[
            ("ncid", FieldKind::I32),
            ("name", FieldKind::Str),
            ("piotype", FieldKind::I32),
            ("dimids", FieldKind::I32Vec),
        ],
    },
    Schedule {
        tag: MsgTag::DefVarFill,
        fields: &[
            ("ncid", FieldKind::I32),
            ("varid", FieldKind::I32),
            ("fill", FieldKind::OptBytes),
        ],
    },
    Schedule {
        tag: MsgTag::SetFill,
        fields: &[("ncid", FieldKind::I32), ("mode", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::SetFrame,
        fields: &[
            ("ncid", FieldKind::I32),
            ("varid", FieldKind::I32),
            ("frame", FieldKind::I32),
        ],
    },
    Schedule {
        tag: MsgTag::AdvanceFrame,
        fields: &[("ncid", FieldKind::I32), ("varid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::InitDecomp,
        fields: &[
            ("iosysid", FieldKind::I32),
            ("piotype", FieldKind::I32),
            ("gdimlen", FieldKind::I64Vec),
            ("rearranger", FieldKind::I32),
            ("iostart", FieldKind::OptI64Vec),
            ("iocount", FieldKind::OptI64Vec),
        ],
    },
    Schedule {
        tag: MsgTag::FreeDecomp,
        fields: &[("iosysid", FieldKind::I32), ("ioid", FieldKind::I32)],
    },
    Schedule {
        tag: MsgTag::WriteDarrayMulti,
        fields: &[
            ("ncid", FieldKind::I32),
            ("ioid", FieldKind::I32),
            ("nvars", FieldKind::I32),
            ("varids", FieldKind::I32Vec),
            ("frames", FieldKind::I32Vec),
            ("fillflags", FieldKind::I32Vec),
            ("fills", FieldKind::Bytes),
        ],
    },
    Schedule {
        tag: MsgTag::ReadDarray,
        fields: &[
            ("ncid", FieldKind::I32),
            ("varid", FieldKind::I32),
            ("ioid", FieldKind::I32),
        ],
    },
    Schedule {
        tag: MsgTag::WriteDecomp,
        fields: &[
            ("ioid", FieldKind::I32),
            ("iotype", FieldKind::I32),
            ("path", FieldKind::Str),
            ("title", FieldKind::Str),
            ("history", FieldKind::Str),
        ],
    },
    Schedule {
        tag: MsgTag::ReadDecomp,
        fields: &[
            ("iosysid", FieldKind::I32),
            ("iotype", FieldKind::I32),
            ("path", FieldKind::Str),
        ],
    },
    Schedule {
        tag: MsgTag::Exit,
        fields: &[],
    },
];

/// Look up a tag's schedule.
pub fn schedule(tag: MsgTag) -> &'static Schedule {
    &SCHEDULES[ALL_TAGS.iter().position(|t| *t == tag).unwrap()]
}

/// One parameter value, matching a [`FieldKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    I32Vec(Vec<i32>),
    I64Vec(Vec<i64>),
    OptBytes(Option<Vec<u8>>),
    OptI64Vec(Option<Vec<i64>>),
}

impl Value {
    fn kind(&self) -> FieldKind {
        match self {
            Value::I32(_) => FieldKind::I32,
            Value::I64(_) => FieldKind::I64,
            Value::Str(_) => FieldKind::Str,
            Value::Bytes(_) => FieldKind::Bytes,
            Value::I32Vec(_) => FieldKind::I32Vec,
            Value::I64Vec(_) => FieldKind::I64Vec,
            Value::OptBytes(_) => FieldKind::OptBytes,
            Value::OptI64Vec(_) => FieldKind::OptI64Vec,
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::I64(v) => Ok(*v),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_i32_vec(&self) -> Result<&[i32]> {
        match self {
            Value::I32Vec(v) => Ok(v),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_i64_vec(&self) -> Result<&[i64]> {
        match self {
            Value::I64Vec(v) => Ok(v),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_opt_bytes(&self) -> Result<Option<&[u8]>> {
        match self {
            Value::OptBytes(b) => Ok(b.as_deref()),
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn as_opt_i64_vec(&self) -> Result<Option<&[i64]>> {
        match self {
            Value::OptI64Vec(v) => Ok(v.as_deref()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Encode values against a schedule. The value kinds must match the
/// declared fields exactly.
pub fn encode_params(sched: &Schedule, values: &[Value]) -> Result<Vec<u8>> {
    if values.len() != sched.fields.len() {
        return Err(Error::InvalidArgument);
    }
    let mut out = Vec::new();
    for ((_, kind), v) in sched.fields.iter().zip(values) {
        if v.kind() != *kind {
            return Err(Error::InvalidArgument);
        }
        match v {
            Value::I32(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::I64(x) => out.extend_from_slice(&x.to_le_bytes()),
            Value::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::I32Vec(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Value::I64Vec(v) => {
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                for x in v {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            Value::OptBytes(o) => {
                out.push(o.is_some() as u8);
                if let Some(b) = o {
                    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
            Value::OptI64Vec(o) => {
                out.push(o.is_some() as u8);
                if let Some(v) = o {
                    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    for x in v {
                        out.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Decode a parameter buffer against a schedule.
pub fn decode_params(sched: &Schedule, data: &[u8]) -> Result<Vec<Value>> {
    let mut cur = Cursor { data, pos: 0 };
    let mut out = Vec::with_capacity(sched.fields.len());
    for (_, kind) in sched.fields {
        out.push(match kind {
            FieldKind::I32 => Value::I32(cur.i32()?),
            FieldKind::I64 => Value::I64(cur.i64()?),
            FieldKind::Str => {
                let n = cur.i32()? as usize;
                let b = cur.take(n)?;
                Value::Str(String::from_utf8(b.to_vec()).map_err(|_| Error::InvalidArgument)?)
            }
            FieldKind::Bytes => {
                let n = cur.i32()? as usize;
                Value::Bytes(cur.take(n)?.to_vec())
            }
            FieldKind::I32Vec => {
                let n = cur.i32()? as usize;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(cur.i32()?);
                }
                Value::I32Vec(v)
            }
            FieldKind::I64Vec => {
                let n = cur.i32()? as usize;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(cur.i64()?);
                }
                Value::I64Vec(v)
            }
            FieldKind::OptBytes => {
                if cur.u8()? == 0 {
                    Value::OptBytes(None)
                } else {
                    let n = cur.i32()? as usize;
                    Value::OptBytes(Some(cur.take(n)?.to_vec()))
                }
            }
            FieldKind::OptI64Vec => {
                if cur.u8()? == 0 {
                    Value::OptI64Vec(None)
                } else {
                    let n = cur.i32()? as usize;
                    let mut v = Vec::with_capacity(n);
                    for _ in 0..n {
                        v.push(cur.i64()?);
                    }
                    Value::OptI64Vec(Some(v))
                }
            }
        });
    }
    if cur.pos != data.len() {
        return Err(Error::InvalidArgument);
    }
    Ok(out)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidArgument);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl Pario {
    /// Computational side of a dispatched operation. In async mode the
    /// component leader sends the tag to the I/O root, everyone joins the
    /// tag echo on the union comm, and the parameters travel over the
    /// intercomm rooted at the computational leader. A no-op in sync mode
    /// and on I/O ranks.
    pub(crate) fn forward(&self, iosysid: i32, tag: MsgTag, values: &[Value]) -> Result<()> {
        let ios = self.iosys(iosysid)?;
        if !ios.async_mode || ios.ioproc {
            return Ok(());
        }
        let union = Arc::clone(&ios.union_comm);
        let inter = Arc::clone(ios.intercomm.as_ref().ok_or(Error::Transport(0))?);
        if ios.compmaster {
            union.send(ios.ioroot, TAG_MSG, &(tag as i32).to_le_bytes())?;
        }
        let mut echo = Vec::new();
        union.bcast(ios.ioroot, &mut echo)?;
        let mut params = if ios.compmaster {
            encode_params(schedule(tag), values)?
        } else {
            Vec::new()
        };
        inter.bcast(ios.comproot, &mut params)?;
        Ok(())
    }

    /// I/O-rank dispatch loop: serve the listed components until each has
    /// sent the exit message.
    pub(crate) fn io_msg_loop(&mut self, iosysids: &[i32]) -> Result<()> {
        let mut active: Vec<i32> = iosysids.to_vec();
        if active.is_empty() {
            return Ok(());
        }
        // The shared I/O comm carries (component slot, tag) agreements.
        let shared_io = {
            let ios = self.iosys(active[0])?;
            Arc::clone(ios.io_comm.as_ref().ok_or(Error::Transport(0))?)
        };

        while !active.is_empty() {
            // The I/O root polls the served components' union comms for the
            // next message; everyone else waits for its decision.
            let mut pair: (i32, i32) = (-1, -1);
            if shared_io.rank() == 0 {
                'poll: loop {
                    for (slot, &id) in active.iter().enumerate() {
                        let union = Arc::clone(&self.iosys(id)?.union_comm);
                        if let Some(src) = union.iprobe(None, TAG_MSG)? {
                            let (_, data) = union.recv(Some(src), TAG_MSG)?;
                            if data.len() != 4 {
                                return Err(Error::Transport(0));
                            }
                            pair = (slot as i32, i32::from_le_bytes(data.try_into().unwrap()));
                            break 'poll;
                        }
                    }
                    std::thread::yield_now();
                }
            }
            let mut buf = {
                let mut b = pair.0.to_le_bytes().to_vec();
                b.extend_from_slice(&pair.1.to_le_bytes());
                b
            };
            shared_io.bcast(0, &mut buf)?;
            let slot = i32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
            let tag = MsgTag::from_i32(i32::from_le_bytes(buf[4..8].try_into().unwrap()))?;
            let iosysid = active[slot];

            // Tag echo on the union comm, then the parameter schedule.
            let (union, inter, ioroot, comproot) = {
                let ios = self.iosys(iosysid)?;
                (
                    Arc::clone(&ios.union_comm),
                    Arc::clone(ios.intercomm.as_ref().ok_or(Error::Transport(0))?),
                    ios.ioroot,
                    ios.comproot,
                )
            };
            let mut echo = Vec::new();
            union.bcast(ioroot, &mut echo)?;
            let mut params = Vec::new();
            inter.bcast(comproot, &mut params)?;
            let values = decode_params(schedule(tag), &params)?;

            debug!("dispatch iosysid={iosysid} tag={tag:?}");
            self.dispatch_trace.push(tag as i32);
            if tag == MsgTag::Exit {
                active.remove(slot);
                self.free_iosystem_local(iosysid)?;
                continue;
            }
            if let Err(e) = self.handle(iosysid, tag, &values) {
                // The computational side observed the same agreed code; the
                // dispatcher keeps serving.
                warn!("dispatch {tag:?} on iosysid {iosysid} returned {e}");
            }
        }
        Ok(())
    }

    fn handle(&mut self, iosysid: i32, tag: MsgTag, v: &[Value]) -> Result<()> {
        match tag {
            MsgTag::CreateFile | MsgTag::OpenFile => {
                let iotype = v[0].as_i32()?;
                let path = v[1].as_str()?.to_string();
                let mode =
                    OpenMode::from_bits(v[2].as_i32()? as u32).ok_or(Error::InvalidArgument)?;
                self.open_or_create_impl(iosysid, iotype, &path, mode, tag == MsgTag::CreateFile)?;
                Ok(())
            }
            MsgTag::CloseFile => self.close_file_impl(v[0].as_i32()?),
            MsgTag::Sync => self.sync_file_impl(v[0].as_i32()?),
            MsgTag::Redef => self.redef_impl(v[0].as_i32()?),
            MsgTag::Enddef => self.enddef_impl(v[0].as_i32()?),
            MsgTag::DefDim => {
                self.def_dim_impl(v[0].as_i32()?, v[1].as_str()?.to_string().as_str(), v[2].as_i64()?)?;
                Ok(())
            }
            MsgTag::DefVar => {
                let piotype = PioType::from_tag(v[2].as_i32()?)?;
                self.def_var_impl(
                    v[0].as_i32()?,
                    v[1].as_str()?.to_string().as_str(),
                    piotype,
                    &v[3].as_i32_vec()?.to_vec(),
                )?;
                Ok(())
            }
            MsgTag::DefVarFill => {
                let fill = v[2].as_opt_bytes()?.map(|b| b.to_vec());
                self.def_var_fill_impl(v[0].as_i32()?, v[1].as_i32()?, fill.as_deref())
            }
            MsgTag::SetFill => {
                let mode = if v[1].as_i32()? == 0 {
                    FillMode::Fill
                } else {
                    FillMode::NoFill
                };
                self.set_fill_impl(v[0].as_i32()?, mode)?;
                Ok(())
            }
            MsgTag::SetFrame => {
                self.set_frame_impl(v[0].as_i32()?, v[1].as_i32()?, v[2].as_i32()?)
            }
            MsgTag::AdvanceFrame => self.advance_frame_impl(v[0].as_i32()?, v[1].as_i32()?),
            MsgTag::InitDecomp => {
                let piotype = PioType::from_tag(v[1].as_i32()?)?;
                let gdimlen = v[2].as_i64_vec()?.to_vec();
                let rearr = match v[3].as_i32()? {
                    -1 => None,
                    t => Some(Rearranger::from_tag(t)?),
                };
                let iostart = v[4].as_opt_i64_vec()?.map(|s| s.to_vec());
                let iocount = v[5].as_opt_i64_vec()?.map(|s| s.to_vec());
                self.init_decomp_impl(
                    v[0].as_i32()?,
                    piotype,
                    &gdimlen,
                    &[],
                    rearr,
                    iostart.as_deref(),
                    iocount.as_deref(),
                )?;
                Ok(())
            }
            MsgTag::FreeDecomp => {
                self.decomps.remove(&v[1].as_i32()?).ok_or(Error::BadId)?;
                Ok(())
            }
            MsgTag::WriteDarrayMulti => {
                let ncid = v[0].as_i32()?;
                let ioid = v[1].as_i32()?;
                let varids = v[3].as_i32_vec()?.to_vec();
                let frames = v[4].as_i32_vec()?.to_vec();
                let flags = v[5].as_i32_vec()?.to_vec();
                let cat = v[6].as_bytes()?;
                let elem_size = self.decomp(ioid)?.elem_size;
                let mut fills = Vec::with_capacity(varids.len());
                let mut pos = 0usize;
                for &f in &flags {
                    if f != 0 {
                        fills.push(Some(cat[pos..pos + elem_size].to_vec()));
                        pos += elem_size;
                    } else {
                        fills.push(None);
                    }
                }
                self.write_darray_multi_impl(ncid, ioid, &varids, &frames, &fills, &[])
            }
            MsgTag::ReadDarray => {
                let mut empty = Vec::new();
                self.read_darray_impl(v[0].as_i32()?, v[1].as_i32()?, v[2].as_i32()?, &mut empty)
            }
            MsgTag::WriteDecomp => self.write_decomp_impl(
                v[0].as_i32()?,
                v[1].as_i32()?,
                v[2].as_str()?.to_string().as_str(),
                v[3].as_str()?.to_string().as_str(),
                v[4].as_str()?.to_string().as_str(),
            ),
            MsgTag::ReadDecomp => {
                self.read_decomp_impl(v[0].as_i32()?, v[1].as_i32()?, v[2].as_str()?.to_string().as_str())?;
                Ok(())
            }
            MsgTag::Exit => Ok(()),
        }
    }
}
