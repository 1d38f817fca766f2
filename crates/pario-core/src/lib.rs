//! Parallel I/O rearrangement core.
//!
//! Distributed in-memory arrays live on many computational ranks; a small
//! set of I/O ranks talks to array-oriented files. This crate builds the
//! communication plans that gather array elements onto the I/O ranks in a
//! layout fit for contiguous file writes, executes them under the box and
//! subset rearrangement strategies, aggregates writes sharing a
//! decomposition, and runs the message-dispatch loop that lets dedicated
//! I/O ranks serve computational components.
//!
//! File formats themselves are pluggable: the core only requires the
//! [`driver::FileDriver`] contract, and backends register under an iotype
//! id. The transport is equally pluggable through [`comm::Comm`]; tests run
//! on the in-process implementation, `pario-mpi` supplies the MPI one.

pub mod comm;
pub mod context;
pub mod darray;
pub mod decomp;
pub mod decompfile;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod file;
pub mod rearrange;
pub mod swapm;
pub mod topology;
pub mod types;

pub use comm::Comm;
pub use context::{Pario, DEFAULT_BLOCKSIZE, FIRST_IOID, VERSION};
pub use decomp::IoDesc;
pub use dispatch::MsgTag;
pub use driver::{DriverFile, FileDriver, OpenMode, UNLIMITED};
pub use error::{Error, ErrorHandler, Result};
pub use file::FillMode;
pub use rearrange::Region;
pub use swapm::{swapm, CommType, FlowDir, FlowOpts, RearrOpts, SwapDir};
pub use topology::{InitAsync, IoSystem};
pub use types::{PioType, Rearranger};
