//! The library context: owner of every registry the core mutates.
//!
//! One `Pario` instance lives on each rank. All public operations are
//! methods on it; the registries are keyed by the stable integer ids that
//! serve as the public handles (iosysid, ioid, ncid).

use std::collections::HashMap;

use crate::decomp::IoDesc;
use crate::driver::FileDriver;
use crate::error::{Error, ErrorHandler, Result};
use crate::file::File;
use crate::topology::IoSystem;

/// First decomposition id handed out.
pub const FIRST_IOID: i32 = 512;
/// First file id handed out.
pub const FIRST_NCID: i32 = 16;
/// Default target block granularity for the box rearranger, in elements.
pub const DEFAULT_BLOCKSIZE: i64 = 1024;
/// Default cap on buffered darray payload bytes before a flush.
pub const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024 * 1024;

/// Library version string recorded in decomposition files.
pub const VERSION: &str = concat!("pario-", env!("CARGO_PKG_VERSION"));

/// Per-rank library state.
pub struct Pario {
    pub(crate) iosystems: HashMap<i32, IoSystem>,
    pub(crate) decomps: HashMap<i32, IoDesc>,
    pub(crate) files: HashMap<i32, File>,
    pub(crate) drivers: HashMap<i32, Box<dyn FileDriver>>,
    pub(crate) next_iosysid: i32,
    pub(crate) next_ioid: i32,
    pub(crate) next_ncid: i32,
    pub(crate) default_error_handler: ErrorHandler,
    pub(crate) blocksize: i64,
    pub(crate) buffer_limit: usize,
    pub(crate) dispatch_trace: Vec<i32>,
}

impl Pario {
    pub fn new() -> Self {
        Self {
            iosystems: HashMap::new(),
            decomps: HashMap::new(),
            files: HashMap::new(),
            drivers: HashMap::new(),
            next_iosysid: 1,
            next_ioid: FIRST_IOID,
            next_ncid: FIRST_NCID,
            default_error_handler: ErrorHandler::default(),
            blocksize: DEFAULT_BLOCKSIZE,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            dispatch_trace: Vec::new(),
        }
    }

    /// Register a file driver under an iotype id. Files created with this
    /// iotype go through the given driver on I/O ranks.
    pub fn register_driver(&mut self, iotype: i32, driver: Box<dyn FileDriver>) {
        self.drivers.insert(iotype, driver);
    }

    /// Is an iotype backed by a registered driver on this rank?
    pub fn iotype_available(&self, iotype: i32) -> bool {
        self.drivers.contains_key(&iotype)
    }

    /// Set the target block granularity for the box rearranger.
    pub fn set_blocksize(&mut self, newblocksize: i64) -> Result<()> {
        if newblocksize <= 0 {
            return Err(Error::InvalidArgument);
        }
        self.blocksize = newblocksize;
        Ok(())
    }

    /// Set the cap on buffered darray payload bytes before a flush.
    pub fn set_buffer_size_limit(&mut self, limit: usize) {
        self.buffer_limit = limit;
    }

    /// Set the library-wide default error handling mode, returning the
    /// previous one. New iosystems inherit it.
    pub fn set_default_error_handling(&mut self, method: ErrorHandler) -> ErrorHandler {
        std::mem::replace(&mut self.default_error_handler, method)
    }

    /// Set the error handling mode of one iosystem, returning the previous.
    pub fn set_error_handling(&mut self, iosysid: i32, method: ErrorHandler) -> Result<ErrorHandler> {
        let ios = self.iosys_mut(iosysid)?;
        Ok(std::mem::replace(&mut ios.error_handler, method))
    }

    /// Message tags handled by the async dispatcher on this rank, in the
    /// order they were executed.
    pub fn dispatch_trace(&self) -> &[i32] {
        &self.dispatch_trace
    }

    /// Is `iosysid` a live iosystem?
    pub fn iosystem_is_active(&self, iosysid: i32) -> bool {
        self.iosystems.contains_key(&iosysid)
    }

    /// Is `ncid` an open file?
    pub fn file_is_open(&self, ncid: i32) -> bool {
        self.files.contains_key(&ncid)
    }

    pub(crate) fn iosys(&self, iosysid: i32) -> Result<&IoSystem> {
        self.iosystems.get(&iosysid).ok_or(Error::BadId)
    }

    pub(crate) fn iosys_mut(&mut self, iosysid: i32) -> Result<&mut IoSystem> {
        self.iosystems.get_mut(&iosysid).ok_or(Error::BadId)
    }

    /// Look up a decomposition descriptor.
    pub fn decomp(&self, ioid: i32) -> Result<&IoDesc> {
        self.decomps.get(&ioid).ok_or(Error::BadId)
    }

    pub(crate) fn decomp_mut(&mut self, ioid: i32) -> Result<&mut IoDesc> {
        self.decomps.get_mut(&ioid).ok_or(Error::BadId)
    }

    pub(crate) fn file(&self, ncid: i32) -> Result<&File> {
        self.files.get(&ncid).ok_or(Error::BadId)
    }

    pub(crate) fn file_mut(&mut self, ncid: i32) -> Result<&mut File> {
        self.files.get_mut(&ncid).ok_or(Error::BadId)
    }
}

impl Default for Pario {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocksize_validation() {
        let mut pio = Pario::new();
        assert!(pio.set_blocksize(0).is_err());
        assert!(pio.set_blocksize(-4).is_err());
        pio.set_blocksize(64).unwrap();
        assert_eq!(pio.blocksize, 64);
    }

    #[test]
    fn test_unknown_ids() {
        let pio = Pario::new();
        assert_eq!(pio.iosys(7).unwrap_err(), Error::BadId);
        assert_eq!(pio.decomp(512).unwrap_err(), Error::BadId);
        assert_eq!(pio.file(16).unwrap_err(), Error::BadId);
        assert!(!pio.iosystem_is_active(1));
        assert!(!pio.file_is_open(16));
    }

    #[test]
    fn test_default_error_handling_swap() {
        let mut pio = Pario::new();
        let old = pio.set_default_error_handling(ErrorHandler::Return);
        assert_eq!(old, ErrorHandler::Internal);
        assert_eq!(pio.default_error_handler, ErrorHandler::Return);
    }
}
