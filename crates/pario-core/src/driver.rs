//! The contract the core requires from a file-format backend.
//!
//! Drivers are registered with the library context under an iotype id and
//! are only exercised on I/O ranks. One [`DriverFile`] handle exists per
//! open file per I/O rank; hyperslab writes from different I/O ranks target
//! non-overlapping regions.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::types::PioType;

/// Dimension length marking an unlimited (record) dimension.
pub const UNLIMITED: i64 = 0;

bitflags! {
    /// File creation/open mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Open for writing (reads are always allowed).
        const WRITE   = 0x1;
        /// Destroy an existing file on create.
        const CLOBBER = 0x2;
    }
}

/// A pluggable file-format backend.
pub trait FileDriver: Send + Sync {
    /// Backend name, e.g. "mem".
    fn name(&self) -> &str;

    /// Create a new file, returning a handle in define mode.
    fn create(&self, path: &str, mode: OpenMode) -> Result<Box<dyn DriverFile>>;

    /// Open an existing file in data mode.
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn DriverFile>>;
}

/// One open file at the driver layer.
pub trait DriverFile: Send {
    /// Define a dimension; `UNLIMITED` marks the record dimension.
    fn def_dim(&mut self, name: &str, len: i64) -> Result<i32>;

    /// Define a variable over previously defined dimensions.
    fn def_var(&mut self, name: &str, piotype: PioType, dimids: &[i32]) -> Result<i32>;

    /// Leave define mode.
    fn enddef(&mut self) -> Result<()>;

    /// Re-enter define mode.
    fn redef(&mut self) -> Result<()>;

    fn put_att_text(&mut self, name: &str, value: &str) -> Result<()>;
    fn put_att_int(&mut self, name: &str, value: i64) -> Result<()>;
    fn get_att_text(&self, name: &str) -> Result<String>;
    fn get_att_int(&self, name: &str) -> Result<i64>;

    /// Length of a dimension by name (current record count for the record
    /// dimension).
    fn inq_dimlen(&self, name: &str) -> Result<i64>;

    /// Variable id by name.
    fn inq_varid(&self, name: &str) -> Result<i32>;

    /// Write one hyperslab of one variable. `data` is packed row-major in
    /// the variable's element type.
    fn put_vara(&mut self, varid: i32, start: &[i64], count: &[i64], data: &[u8]) -> Result<()>;

    /// Read one hyperslab of one variable.
    fn get_vara(&self, varid: i32, start: &[i64], count: &[i64], out: &mut [u8]) -> Result<()>;

    /// Flush driver-side buffers.
    fn sync(&mut self) -> Result<()>;

    /// Close the file.
    fn close(self: Box<Self>) -> Result<()>;

    /// Optional compression setter.
    fn set_deflate(&mut self, _varid: i32, _shuffle: bool, _level: i32) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Optional chunking setter.
    fn set_chunking(&mut self, _varid: i32, _chunksizes: &[i64]) -> Result<()> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_bits() {
        let m = OpenMode::WRITE | OpenMode::CLOBBER;
        assert!(m.contains(OpenMode::WRITE));
        assert_eq!(OpenMode::from_bits(m.bits()), Some(m));
        assert!(!OpenMode::empty().contains(OpenMode::WRITE));
    }
}
