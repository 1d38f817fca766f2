//! In-memory file driver.
//!
//! Implements the core's driver contract against a process-shared store,
//! so several I/O ranks (threads) opening the same path cooperate on one
//! file image, exactly as they would against a shared filesystem. The
//! store can be snapshotted to JSON for inspection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use log::trace;
use serde::Serialize;

use pario_core::driver::{DriverFile, FileDriver, OpenMode, UNLIMITED};
use pario_core::error::{Error, Result};
use pario_core::types::PioType;

/// Conventional iotype id for the in-memory driver.
pub const IOTYPE_MEM: i32 = 1;

#[derive(Clone)]
enum Att {
    Text(String),
    Int(i64),
}

struct DimInfo {
    name: String,
    len: i64,
}

struct VarInfo {
    name: String,
    piotype: PioType,
    dimids: Vec<i32>,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemFileData {
    define_mode: bool,
    dims: Vec<DimInfo>,
    vars: Vec<VarInfo>,
    atts: HashMap<String, Att>,
    num_records: i64,
    open_count: usize,
}

/// The shared file store. Clone handles freely; all clones see one image.
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<MemFileData>>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().unwrap().contains_key(path)
    }

    /// Raw bytes of one variable, in its element type.
    pub fn var_data(&self, path: &str, varname: &str) -> Option<Vec<u8>> {
        let files = self.inner.lock().unwrap();
        let file = files.get(path)?.lock().unwrap();
        file.vars
            .iter()
            .find(|v| v.name == varname)
            .map(|v| v.data.clone())
    }

    /// JSON snapshot of every file's metadata and data.
    pub fn snapshot_json(&self) -> String {
        #[derive(Serialize)]
        struct DimSnap {
            name: String,
            len: i64,
        }
        #[derive(Serialize)]
        struct VarSnap {
            name: String,
            piotype: i32,
            dimids: Vec<i32>,
            data: Vec<u8>,
        }
        #[derive(Serialize)]
        struct FileSnap {
            dims: Vec<DimSnap>,
            vars: Vec<VarSnap>,
            atts: BTreeMap<String, String>,
            num_records: i64,
        }
        let files = self.inner.lock().unwrap();
        let mut out: BTreeMap<String, FileSnap> = BTreeMap::new();
        for (path, data) in files.iter() {
            let f = data.lock().unwrap();
            out.insert(
                path.clone(),
                FileSnap {
                    dims: f
                        .dims
                        .iter()
                        .map(|d| DimSnap {
                            name: d.name.clone(),
                            len: d.len,
                        })
                        .collect(),
                    vars: f
                        .vars
                        .iter()
                        .map(|v| VarSnap {
                            name: v.name.clone(),
                            piotype: v.piotype.tag(),
                            dimids: v.dimids.clone(),
                            data: v.data.clone(),
                        })
                        .collect(),
                    atts: f
                        .atts
                        .iter()
                        .map(|(k, v)| {
                            let s = match v {
                                Att::Text(t) => t.clone(),
                                Att::Int(i) => i.to_string(),
                            };
                            (k.clone(), s)
                        })
                        .collect(),
                    num_records: f.num_records,
                },
            );
        }
        serde_json::to_string_pretty(&out).expect("snapshot serializes")
    }
}

/// Driver over a [`MemFs`] store.
pub struct MemDriver {
    fs: MemFs,
}

impl MemDriver {
    pub fn new(fs: MemFs) -> Self {
        Self { fs }
    }
}

impl FileDriver for MemDriver {
    fn name(&self) -> &str {
        "mem"
    }

    fn create(&self, path: &str, mode: OpenMode) -> Result<Box<dyn DriverFile>> {
        let mut files = self.fs.inner.lock().unwrap();
        let entry = files.entry(path.to_string());
        let data = match entry {
            std::collections::hash_map::Entry::Vacant(v) => {
                let data = Arc::new(Mutex::new(MemFileData {
                    define_mode: true,
                    ..Default::default()
                }));
                v.insert(Arc::clone(&data));
                data
            }
            std::collections::hash_map::Entry::Occupied(o) => {
                let data = Arc::clone(o.get());
                let mut f = data.lock().unwrap();
                if f.open_count == 0 {
                    // A fresh create over a closed file.
                    if !mode.contains(OpenMode::CLOBBER) {
                        return Err(Error::InvalidArgument);
                    }
                    *f = MemFileData {
                        define_mode: true,
                        ..Default::default()
                    };
                }
                // Otherwise another I/O rank of the same collective create
                // already holds it open; share the image.
                drop(f);
                data
            }
        };
        data.lock().unwrap().open_count += 1;
        trace!("mem create {path}");
        Ok(Box::new(MemFile { data }))
    }

    fn open(&self, path: &str, _mode: OpenMode) -> Result<Box<dyn DriverFile>> {
        let files = self.fs.inner.lock().unwrap();
        let data = files.get(path).ok_or(Error::BadId)?.clone();
        data.lock().unwrap().open_count += 1;
        trace!("mem open {path}");
        Ok(Box::new(MemFile { data }))
    }
}

struct MemFile {
    data: Arc<Mutex<MemFileData>>,
}

impl MemFileData {
    fn var_shape(&self, var: &VarInfo) -> Vec<i64> {
        var.dimids
            .iter()
            .map(|&d| {
                let len = self.dims[d as usize].len;
                if len == UNLIMITED { self.num_records } else { len }
            })
            .collect()
    }

    fn is_record_var(&self, var: &VarInfo) -> bool {
        var.dimids
            .first()
            .is_some_and(|&d| self.dims[d as usize].len == UNLIMITED)
    }

    /// Validate a hyperslab and return per-dimension strides in elements.
    fn slab_strides(
        &self,
        var: &VarInfo,
        start: &[i64],
        count: &[i64],
    ) -> Result<Vec<i64>> {
        let shape = self.var_shape(var);
        if start.len() != shape.len() || count.len() != shape.len() {
            return Err(Error::InvalidArgument);
        }
        let record = self.is_record_var(var);
        for d in 0..shape.len() {
            if start[d] < 0 || count[d] < 0 {
                return Err(Error::InvalidArgument);
            }
            // The record dimension grows on demand.
            if !(record && d == 0) && start[d] + count[d] > shape[d] {
                return Err(Error::InvalidArgument);
            }
        }
        // Strides never involve the record dimension's extent, so growth
        // keeps them stable.
        let mut strides = vec![1i64; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        Ok(strides)
    }
}

/// Walk a hyperslab row by row: calls `f(flat_elem_offset, src_elem_offset,
/// row_elems)` for each innermost run.
fn for_each_row(
    start: &[i64],
    count: &[i64],
    strides: &[i64],
    mut f: impl FnMut(i64, i64, i64) -> Result<()>,
) -> Result<()> {
    let ndims = start.len();
    if ndims == 0 {
        return f(0, 0, 1);
    }
    let rows: i64 = count[..ndims - 1].iter().product();
    let row_elems = count[ndims - 1];
    if row_elems == 0 {
        return Ok(());
    }
    let mut idx = vec![0i64; ndims - 1];
    let mut src = 0i64;
    for _ in 0..rows {
        let mut flat = start[ndims - 1];
        for d in 0..ndims - 1 {
            flat += (start[d] + idx[d]) * strides[d];
        }
        f(flat, src, row_elems)?;
        src += row_elems;
        for d in (0..ndims - 1).rev() {
            idx[d] += 1;
            if idx[d] < count[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    Ok(())
}

impl DriverFile for MemFile {
    fn def_dim(&mut self, name: &str, len: i64) -> Result<i32> {
        let mut f = self.data.lock().unwrap();
        if !f.define_mode {
            return Err(Error::InvalidArgument);
        }
        if let Some(i) = f.dims.iter().position(|d| d.name == name) {
            // A collective twin already defined it; the shape must agree.
            if f.dims[i].len != len {
                return Err(Error::InvalidArgument);
            }
            return Ok(i as i32);
        }
        f.dims.push(DimInfo {
            name: name.to_string(),
            len,
        });
        Ok((f.dims.len() - 1) as i32)
    }

    fn def_var(&mut self, name: &str, piotype: PioType, dimids: &[i32]) -> Result<i32> {
        let mut f = self.data.lock().unwrap();
        if !f.define_mode {
            return Err(Error::InvalidArgument);
        }
        piotype.size().ok_or(Error::InvalidArgument)?;
        for &d in dimids {
            if d < 0 || d as usize >= f.dims.len() {
                return Err(Error::BadId);
            }
        }
        if let Some(i) = f.vars.iter().position(|v| v.name == name) {
            let v = &f.vars[i];
            if v.piotype != piotype || v.dimids != dimids {
                return Err(Error::InvalidArgument);
            }
            return Ok(i as i32);
        }
        f.vars.push(VarInfo {
            name: name.to_string(),
            piotype,
            dimids: dimids.to_vec(),
            data: Vec::new(),
        });
        Ok((f.vars.len() - 1) as i32)
    }

    fn enddef(&mut self) -> Result<()> {
        let mut f = self.data.lock().unwrap();
        f.define_mode = false;
        // Size fixed-shape variables now so reads see zero fill.
        let sizes: Vec<usize> = f
            .vars
            .iter()
            .map(|v| {
                if f.is_record_var(v) {
                    v.data.len()
                } else {
                    let n: i64 = f.var_shape(v).iter().product();
                    n as usize * v.piotype.size().unwrap_or(1)
                }
            })
            .collect();
        for (v, size) in f.vars.iter_mut().zip(sizes) {
            if v.data.len() < size {
                v.data.resize(size, 0);
            }
        }
        Ok(())
    }

    fn redef(&mut self) -> Result<()> {
        self.data.lock().unwrap().define_mode = true;
        Ok(())
    }

    fn put_att_text(&mut self, name: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .atts
            .insert(name.to_string(), Att::Text(value.to_string()));
        Ok(())
    }

    fn put_att_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .atts
            .insert(name.to_string(), Att::Int(value));
        Ok(())
    }

    fn get_att_text(&self, name: &str) -> Result<String> {
        match self.data.lock().unwrap().atts.get(name) {
            Some(Att::Text(t)) => Ok(t.clone()),
            Some(Att::Int(i)) => Ok(i.to_string()),
            None => Err(Error::BadId),
        }
    }

    fn get_att_int(&self, name: &str) -> Result<i64> {
        match self.data.lock().unwrap().atts.get(name) {
            Some(Att::Int(i)) => Ok(*i),
            Some(Att::Text(_)) => Err(Error::InvalidArgument),
            None => Err(Error::BadId),
        }
    }

    fn inq_dimlen(&self, name: &str) -> Result<i64> {
        let f = self.data.lock().unwrap();
        let dim = f
            .dims
            .iter()
            .find(|d| d.name == name)
            .ok_or(Error::BadId)?;
        Ok(if dim.len == UNLIMITED { f.num_records } else { dim.len })
    }

    fn inq_varid(&self, name: &str) -> Result<i32> {
        let f = self.data.lock().unwrap();
        f.vars
            .iter()
            .position(|v| v.name == name)
            .map(|i| i as i32)
            .ok_or(Error::BadId)
    }

    fn put_vara(&mut self, varid: i32, start: &[i64], count: &[i64], data: &[u8]) -> Result<()> {
        let mut f = self.data.lock().unwrap();
        if f.define_mode {
            return Err(Error::InvalidArgument);
        }
        let var = f.vars.get(varid as usize).ok_or(Error::BadId)?;
        let elsize = var.piotype.size().ok_or(Error::InvalidArgument)?;
        let nelems: i64 = count.iter().product();
        if data.len() != nelems as usize * elsize {
            return Err(Error::InvalidArgument);
        }
        let strides = f.slab_strides(var, start, count)?;
        if f.is_record_var(var) {
            let needed = start[0] + count[0];
            if needed > f.num_records {
                f.num_records = needed;
            }
        }
        let var = f.vars.get_mut(varid as usize).unwrap();
        for_each_row(start, count, &strides, |flat, src, row| {
            let a = flat as usize * elsize;
            let b = a + row as usize * elsize;
            if var.data.len() < b {
                var.data.resize(b, 0);
            }
            let s = src as usize * elsize;
            var.data[a..b].copy_from_slice(&data[s..s + row as usize * elsize]);
            Ok(())
        })
    }

    fn get_vara(&self, varid: i32, start: &[i64], count: &[i64], out: &mut [u8]) -> Result<()> {
        let f = self.data.lock().unwrap();
        let var = f.vars.get(varid as usize).ok_or(Error::BadId)?;
        let elsize = var.piotype.size().ok_or(Error::InvalidArgument)?;
        let nelems: i64 = count.iter().product();
        if out.len() != nelems as usize * elsize {
            return Err(Error::InvalidArgument);
        }
        let strides = f.slab_strides(var, start, count)?;
        for_each_row(start, count, &strides, |flat, src, row| {
            let a = flat as usize * elsize;
            let b = a + row as usize * elsize;
            let s = src as usize * elsize;
            let dst = &mut out[s..s + row as usize * elsize];
            if var.data.len() >= b {
                dst.copy_from_slice(&var.data[a..b]);
            } else {
                // Never-written territory reads back as zeros.
                for (i, o) in dst.iter_mut().enumerate() {
                    let p = a + i;
                    *o = if p < var.data.len() { var.data[p] } else { 0 };
                }
            }
            Ok(())
        })
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut f = self.data.lock().unwrap();
        f.open_count = f.open_count.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pario_core::types::{bytes_to_i32s, i32s_to_bytes};

    fn fresh() -> (MemFs, MemDriver) {
        let fs = MemFs::new();
        let driver = MemDriver::new(fs.clone());
        (fs, driver)
    }

    #[test]
    fn test_define_and_write_1d() {
        let (fs, driver) = fresh();
        let mut f = driver.create("t.nc", OpenMode::WRITE).unwrap();
        let d = f.def_dim("x", 8).unwrap();
        let v = f.def_var("data", PioType::Int, &[d]).unwrap();
        f.enddef().unwrap();
        f.put_vara(v, &[2], &[3], &i32s_to_bytes(&[7, 8, 9])).unwrap();
        let mut out = vec![0u8; 8 * 4];
        f.get_vara(v, &[0], &[8], &mut out).unwrap();
        assert_eq!(bytes_to_i32s(&out), vec![0, 0, 7, 8, 9, 0, 0, 0]);
        f.close().unwrap();
        assert!(fs.contains("t.nc"));
    }

    #[test]
    fn test_hyperslab_2d() {
        let (_fs, driver) = fresh();
        let mut f = driver.create("t.nc", OpenMode::WRITE).unwrap();
        let y = f.def_dim("y", 4).unwrap();
        let x = f.def_dim("x", 4).unwrap();
        let v = f.def_var("grid", PioType::Int, &[y, x]).unwrap();
        f.enddef().unwrap();
        // Write the center 2x2 tile.
        f.put_vara(v, &[1, 1], &[2, 2], &i32s_to_bytes(&[1, 2, 3, 4]))
            .unwrap();
        let mut out = vec![0u8; 16 * 4];
        f.get_vara(v, &[0, 0], &[4, 4], &mut out).unwrap();
        let grid = bytes_to_i32s(&out);
        assert_eq!(grid[5], 1);
        assert_eq!(grid[6], 2);
        assert_eq!(grid[9], 3);
        assert_eq!(grid[10], 4);
        assert_eq!(grid[0], 0);
    }

    #[test]
    fn test_record_growth() {
        let (_fs, driver) = fresh();
        let mut f = driver.create("t.nc", OpenMode::WRITE).unwrap();
        let t = f.def_dim("time", UNLIMITED).unwrap();
        let x = f.def_dim("x", 2).unwrap();
        let v = f.def_var("series", PioType::Int, &[t, x]).unwrap();
        f.enddef().unwrap();
        assert_eq!(f.inq_dimlen("time").unwrap(), 0);
        f.put_vara(v, &[3, 0], &[1, 2], &i32s_to_bytes(&[5, 6])).unwrap();
        assert_eq!(f.inq_dimlen("time").unwrap(), 4);
        let mut out = vec![0u8; 8 * 4];
        f.get_vara(v, &[0, 0], &[4, 2], &mut out).unwrap();
        let vals = bytes_to_i32s(&out);
        assert_eq!(&vals[..6], &[0; 6]);
        assert_eq!(&vals[6..], &[5, 6]);
    }

    #[test]
    fn test_bounds_checked() {
        let (_fs, driver) = fresh();
        let mut f = driver.create("t.nc", OpenMode::WRITE).unwrap();
        let d = f.def_dim("x", 4).unwrap();
        let v = f.def_var("data", PioType::Int, &[d]).unwrap();
        f.enddef().unwrap();
        assert!(f.put_vara(v, &[2], &[3], &i32s_to_bytes(&[1, 2, 3])).is_err());
        let mut out = vec![0u8; 4];
        assert!(f.get_vara(v, &[4], &[1], &mut out).is_err());
        assert!(f.get_vara(99, &[0], &[1], &mut out).is_err());
    }

    #[test]
    fn test_collective_twins_share_image() {
        let (fs, driver) = fresh();
        let mut a = driver.create("shared.nc", OpenMode::WRITE).unwrap();
        let mut b = driver.create("shared.nc", OpenMode::WRITE).unwrap();
        let da = a.def_dim("x", 8).unwrap();
        let db = b.def_dim("x", 8).unwrap();
        assert_eq!(da, db);
        let va = a.def_var("data", PioType::Int, &[da]).unwrap();
        let vb = b.def_var("data", PioType::Int, &[db]).unwrap();
        assert_eq!(va, vb);
        a.enddef().unwrap();
        b.enddef().unwrap();
        a.put_vara(va, &[0], &[4], &i32s_to_bytes(&[1, 2, 3, 4])).unwrap();
        b.put_vara(vb, &[4], &[4], &i32s_to_bytes(&[5, 6, 7, 8])).unwrap();
        a.close().unwrap();
        b.close().unwrap();
        let data = fs.var_data("shared.nc", "data").unwrap();
        assert_eq!(bytes_to_i32s(&data), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_create_semantics() {
        let (_fs, driver) = fresh();
        let f = driver.create("a.nc", OpenMode::WRITE).unwrap();
        f.close().unwrap();
        // Closed file, no clobber: refused.
        assert!(driver.create("a.nc", OpenMode::WRITE).is_err());
        // With clobber: wiped.
        let mut f = driver
            .create("a.nc", OpenMode::WRITE | OpenMode::CLOBBER)
            .unwrap();
        assert!(f.inq_varid("data").is_err());
        f.def_dim("x", 1).unwrap();
        f.close().unwrap();
        assert!(driver.open("missing.nc", OpenMode::empty()).is_err());
    }

    #[test]
    fn test_atts_and_snapshot() {
        let (fs, driver) = fresh();
        let mut f = driver.create("meta.nc", OpenMode::WRITE).unwrap();
        f.put_att_text("title", "hello").unwrap();
        f.put_att_int("version", 3).unwrap();
        assert_eq!(f.get_att_text("title").unwrap(), "hello");
        assert_eq!(f.get_att_int("version").unwrap(), 3);
        assert!(f.get_att_int("title").is_err());
        assert!(f.get_att_text("missing").is_err());
        f.close().unwrap();
        let json = fs.snapshot_json();
        assert!(json.contains("meta.nc"));
        assert!(json.contains("hello"));
    }

    #[test]
    fn test_deflate_unsupported() {
        let (_fs, driver) = fresh();
        let mut f = driver.create("z.nc", OpenMode::WRITE).unwrap();
        assert_eq!(f.set_deflate(0, true, 5), Err(Error::Unsupported));
        assert_eq!(f.set_chunking(0, &[4]), Err(Error::Unsupported));
    }
}
