//! Persisting decompositions through the file driver.
//!
//! The on-disk layout: global attributes `library_version`, `max_maplen`,
//! `title`, `history`, `source`, `array_order`, `backtrace`; dimensions
//! `dims`, `task`, `map_element`, `ndims`; variables `global_size[dims]`
//! (int), `maplen[task]` (int), and `map[task, map_element]` (64-bit int,
//! zero-padded rows).

use std::sync::Arc;

use crate::context::{Pario, VERSION};
use crate::dispatch::{MsgTag, Value};
use crate::driver::OpenMode;
use crate::error::{Error, Result};
use crate::file::agree;
use crate::types::{bytes_to_i32s, bytes_to_i64s, i32s_to_bytes, i64s_to_bytes, PioType};

impl Pario {
    /// Write a decomposition to a file. Collective over the iosystem; rows
    /// are gathered on the I/O root, which writes through the driver.
    pub fn write_decomp(
        &mut self,
        ioid: i32,
        iotype: i32,
        path: &str,
        title: &str,
        history: &str,
    ) -> Result<()> {
        let iosysid = self.decomp(ioid)?.iosysid;
        self.forward(
            iosysid,
            MsgTag::WriteDecomp,
            &[
                Value::I32(ioid),
                Value::I32(iotype),
                Value::Str(path.to_string()),
                Value::Str(title.to_string()),
                Value::Str(history.to_string()),
            ],
        )?;
        self.write_decomp_impl(ioid, iotype, path, title, history)
    }

    pub(crate) fn write_decomp_impl(
        &mut self,
        ioid: i32,
        iotype: i32,
        path: &str,
        title: &str,
        history: &str,
    ) -> Result<()> {
        let d = self.decomps.get(&ioid).ok_or(Error::BadId)?;
        let ios = self.iosystems.get(&d.iosysid).ok_or(Error::BadId)?;
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let handler = ios.error_handler;
        let compranks = ios.compranks.clone();
        let gdimlen = d.gdimlen.clone();

        // Rows carry the caller-order compmap, so undo the sort.
        let original: Vec<i64> = match &d.remap {
            Some(r) => {
                let mut o = vec![0i64; d.ndof];
                for k in 0..d.ndof {
                    o[r[k]] = d.map[k];
                }
                o
            }
            None => d.map.clone(),
        };
        let parts = union.gatherv(ioroot, &i64s_to_bytes(&original))?;

        let outcome = match parts {
            Some(parts) => {
                let rows: Vec<Vec<i64>> = compranks
                    .iter()
                    .map(|&r| bytes_to_i64s(&parts[r]))
                    .collect();
                self.write_rows(iotype, path, title, history, &gdimlen, &rows)
            }
            None => Ok(()),
        };
        agree(union.as_ref(), ioroot, handler, outcome)
    }

    fn write_rows(
        &self,
        iotype: i32,
        path: &str,
        title: &str,
        history: &str,
        gdimlen: &[i64],
        rows: &[Vec<i64>],
    ) -> Result<()> {
        let driver = self.drivers.get(&iotype).ok_or(Error::BadIoType)?;
        let mut f = driver.create(path, OpenMode::WRITE | OpenMode::CLOBBER)?;
        let ntasks = rows.len();
        let max_maplen = rows.iter().map(|r| r.len()).max().unwrap_or(0).max(1);

        f.put_att_text("library_version", VERSION)?;
        f.put_att_int("max_maplen", max_maplen as i64)?;
        f.put_att_text("title", title)?;
        f.put_att_text("history", history)?;
        f.put_att_text("source", "Decomposition file produced by the pario library.")?;
        f.put_att_text("array_order", "C")?;
        f.put_att_text("backtrace", "")?;

        let dim_dims = f.def_dim("dims", gdimlen.len() as i64)?;
        let dim_task = f.def_dim("task", ntasks as i64)?;
        let dim_elem = f.def_dim("map_element", max_maplen as i64)?;
        f.def_dim("ndims", gdimlen.len() as i64)?;
        let var_gsize = f.def_var("global_size", PioType::Int, &[dim_dims])?;
        let var_maplen = f.def_var("maplen", PioType::Int, &[dim_task])?;
        let var_map = f.def_var("map", PioType::Int64, &[dim_task, dim_elem])?;
        f.enddef()?;

        let gsize: Vec<i32> = gdimlen.iter().map(|&d| d as i32).collect();
        f.put_vara(var_gsize, &[0], &[gdimlen.len() as i64], &i32s_to_bytes(&gsize))?;
        let maplens: Vec<i32> = rows.iter().map(|r| r.len() as i32).collect();
        f.put_vara(var_maplen, &[0], &[ntasks as i64], &i32s_to_bytes(&maplens))?;
        let mut matrix = vec![0i64; ntasks * max_maplen];
        for (t, row) in rows.iter().enumerate() {
            matrix[t * max_maplen..t * max_maplen + row.len()].copy_from_slice(row);
        }
        f.put_vara(
            var_map,
            &[0, 0],
            &[ntasks as i64, max_maplen as i64],
            &i64s_to_bytes(&matrix),
        )?;
        f.close()
    }

    /// Read a decomposition file written by [`Pario::write_decomp`],
    /// returning the global shape and this rank's map row. Collective; the
    /// task count in the file must match the iosystem.
    pub fn read_decomp(&mut self, iosysid: i32, iotype: i32, path: &str) -> Result<(Vec<i64>, Vec<i64>)> {
        self.iosys(iosysid)?;
        self.forward(
            iosysid,
            MsgTag::ReadDecomp,
            &[
                Value::I32(iosysid),
                Value::I32(iotype),
                Value::Str(path.to_string()),
            ],
        )?;
        self.read_decomp_impl(iosysid, iotype, path)
    }

    pub(crate) fn read_decomp_impl(
        &mut self,
        iosysid: i32,
        iotype: i32,
        path: &str,
    ) -> Result<(Vec<i64>, Vec<i64>)> {
        let ios = self.iosys(iosysid)?;
        let union = Arc::clone(&ios.union_comm);
        let ioroot = ios.ioroot;
        let handler = ios.error_handler;
        let compranks = ios.compranks.clone();
        let num_comptasks = ios.num_comptasks;
        let is_root = ios.union_rank == ioroot;

        let mut loaded: Option<(Vec<i64>, Vec<Vec<i64>>)> = None;
        let outcome = if is_root {
            self.read_rows(iotype, path, num_comptasks).map(|v| {
                loaded = Some(v);
            })
        } else {
            Ok(())
        };
        agree(union.as_ref(), ioroot, handler, outcome)?;

        // Shape first, then each computation rank's row.
        let mut gbuf = loaded
            .as_ref()
            .map(|(g, _)| i64s_to_bytes(g))
            .unwrap_or_default();
        union.bcast(ioroot, &mut gbuf)?;
        let gdimlen = bytes_to_i64s(&gbuf);

        let rowparts = loaded.map(|(_, rows)| {
            let mut parts = vec![Vec::new(); union.size()];
            for (t, row) in rows.iter().enumerate() {
                parts[compranks[t]] = i64s_to_bytes(row);
            }
            parts
        });
        let mine = union.scatterv(ioroot, rowparts.as_deref())?;
        Ok((gdimlen, bytes_to_i64s(&mine)))
    }

    fn read_rows(&self, iotype: i32, path: &str, ntasks: usize) -> Result<(Vec<i64>, Vec<Vec<i64>>)> {
        let driver = self.drivers.get(&iotype).ok_or(Error::BadIoType)?;
        let f = driver.open(path, OpenMode::empty())?;
        f.get_att_text("library_version")?;
        let ndims = f.inq_dimlen("dims")? as usize;
        let file_tasks = f.inq_dimlen("task")? as usize;
        let max_maplen = f.inq_dimlen("map_element")? as usize;
        if file_tasks != ntasks {
            return Err(Error::InvalidArgument);
        }

        let var_gsize = f.inq_varid("global_size")?;
        let mut gbytes = vec![0u8; ndims * 4];
        f.get_vara(var_gsize, &[0], &[ndims as i64], &mut gbytes)?;
        let gdimlen: Vec<i64> = bytes_to_i32s(&gbytes).iter().map(|&v| v as i64).collect();

        let var_maplen = f.inq_varid("maplen")?;
        let mut mbytes = vec![0u8; ntasks * 4];
        f.get_vara(var_maplen, &[0], &[ntasks as i64], &mut mbytes)?;
        let maplens = bytes_to_i32s(&mbytes);

        let var_map = f.inq_varid("map")?;
        let mut rows = Vec::with_capacity(ntasks);
        for (t, &len) in maplens.iter().enumerate() {
            let mut rbytes = vec![0u8; max_maplen * 8];
            f.get_vara(var_map, &[t as i64, 0], &[1, max_maplen as i64], &mut rbytes)?;
            let mut row = bytes_to_i64s(&rbytes);
            row.truncate(len as usize);
            rows.push(row);
        }
        f.close()?;
        Ok((gdimlen, rows))
    }
}
