//! Transport seam between the rearrangement core and the message-passing
//! runtime.
//!
//! The core speaks to ranks through the [`Comm`] trait: tagged byte messages
//! plus the handful of collectives the algorithms need. `comm::local`
//! provides an in-process implementation used by the test suites; the
//! `pario-mpi` crate provides the MPI-backed one.

pub mod local;

use crate::error::Result;

/// Message tag.
pub type Tag = i32;

/// Tag used by the default collective implementations.
pub const TAG_COLL: Tag = 1;
/// Tag carrying async dispatcher message ids.
pub const TAG_MSG: Tag = 2;
/// Tag for swap-many payload messages.
pub const TAG_SWAP_DATA: Tag = 3;
/// Tag for swap-many ready-to-receive handshakes.
pub const TAG_SWAP_READY: Tag = 4;

/// A communicator: an ordered group of ranks exchanging tagged byte
/// messages.
///
/// Ordering contract: messages between one (sender, receiver) pair with the
/// same tag arrive in send order. The default collective implementations are
/// layered on `send`/`recv` and rely on buffered (non-blocking) sends;
/// native implementations should override them.
pub trait Comm: Send + Sync {
    /// Rank of the caller within this communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in this communicator.
    fn size(&self) -> usize;

    /// Send `data` to `dst` under `tag`. Must not block indefinitely when
    /// the peer has not yet posted a matching receive.
    fn send(&self, dst: usize, tag: Tag, data: &[u8]) -> Result<()>;

    /// Receive one message matching `src` (or any source when `None`) and
    /// `tag`. Returns the actual source and the payload.
    fn recv(&self, src: Option<usize>, tag: Tag) -> Result<(usize, Vec<u8>)>;

    /// Non-blocking probe: source of a pending matching message, if any.
    fn iprobe(&self, src: Option<usize>, tag: Tag) -> Result<Option<usize>>;

    /// Collectively split this communicator. Ranks passing the same `color`
    /// form a new communicator ordered by `(key, old rank)`; ranks passing
    /// `None` get `None` back.
    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Box<dyn Comm>>>;

    /// Duplicate this communicator (collective).
    fn dup(&self) -> Result<Box<dyn Comm>>;

    /// Abort the job.
    fn abort(&self, code: i32) -> !;

    /// Block until every rank of the communicator has entered.
    fn barrier(&self) -> Result<()> {
        let n = self.size();
        if n <= 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for r in 1..n {
                self.recv(Some(r), TAG_COLL)?;
            }
            for r in 1..n {
                self.send(r, TAG_COLL, &[])?;
            }
        } else {
            self.send(0, TAG_COLL, &[])?;
            self.recv(Some(0), TAG_COLL)?;
        }
        Ok(())
    }

    /// Broadcast `data` from `root` to every rank.
    fn bcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        if self.size() <= 1 {
            return Ok(());
        }
        if self.rank() == root {
            for r in 0..self.size() {
                if r != root {
                    self.send(r, TAG_COLL, data)?;
                }
            }
        } else {
            let (_, d) = self.recv(Some(root), TAG_COLL)?;
            *data = d;
        }
        Ok(())
    }

    /// Gather each rank's bytes on `root`. Non-root ranks get `None`.
    fn gatherv(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut parts = vec![Vec::new(); self.size()];
            parts[root] = data.to_vec();
            for r in 0..self.size() {
                if r != root {
                    let (_, d) = self.recv(Some(r), TAG_COLL)?;
                    parts[r] = d;
                }
            }
            Ok(Some(parts))
        } else {
            self.send(root, TAG_COLL, data)?;
            Ok(None)
        }
    }

    /// Scatter one byte buffer per rank from `root`. Only root supplies
    /// `parts`, which must have one entry per rank.
    fn scatterv(&self, root: usize, parts: Option<&[Vec<u8>]>) -> Result<Vec<u8>> {
        if self.rank() == root {
            let parts = parts.ok_or(crate::error::Error::InvalidArgument)?;
            if parts.len() != self.size() {
                return Err(crate::error::Error::InvalidArgument);
            }
            for r in 0..self.size() {
                if r != root {
                    self.send(r, TAG_COLL, &parts[r])?;
                }
            }
            Ok(parts[root].clone())
        } else {
            let (_, d) = self.recv(Some(root), TAG_COLL)?;
            Ok(d)
        }
    }

    /// Gather each rank's bytes everywhere.
    fn allgatherv(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let gathered = self.gatherv(0, data)?;
        let mut packed = match gathered {
            Some(parts) => pack_parts(&parts),
            None => Vec::new(),
        };
        self.bcast(0, &mut packed)?;
        unpack_parts(&packed)
    }

    /// Personalized all-to-all: `parts[r]` goes to rank `r`; the result
    /// holds one buffer received from each rank.
    fn alltoallv(&self, parts: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if parts.len() != self.size() {
            return Err(crate::error::Error::InvalidArgument);
        }
        let me = self.rank();
        for r in 0..self.size() {
            if r != me {
                self.send(r, TAG_COLL, &parts[r])?;
            }
        }
        let mut out = vec![Vec::new(); self.size()];
        out[me] = parts[me].clone();
        for r in 0..self.size() {
            if r != me {
                let (_, d) = self.recv(Some(r), TAG_COLL)?;
                out[r] = d;
            }
        }
        Ok(out)
    }
}

fn pack_parts(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(parts.len() as u64).to_le_bytes());
    for p in parts {
        out.extend_from_slice(&(p.len() as u64).to_le_bytes());
        out.extend_from_slice(p);
    }
    out
}

fn unpack_parts(packed: &[u8]) -> Result<Vec<Vec<u8>>> {
    fn take<'a>(packed: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
        if *pos + n > packed.len() {
            return Err(crate::error::Error::Transport(0));
        }
        let s = &packed[*pos..*pos + n];
        *pos += n;
        Ok(s)
    }
    let mut pos = 0usize;
    let count = u64::from_le_bytes(take(packed, &mut pos, 8)?.try_into().unwrap()) as usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = u64::from_le_bytes(take(packed, &mut pos, 8)?.try_into().unwrap()) as usize;
        parts.push(take(packed, &mut pos, len)?.to_vec());
    }
    Ok(parts)
}

/// Broadcast a single i32 from `root`.
pub fn bcast_i32(comm: &dyn Comm, root: usize, value: &mut i32) -> Result<()> {
    let mut buf = value.to_le_bytes().to_vec();
    comm.bcast(root, &mut buf)?;
    *value = i32::from_le_bytes(buf[..4].try_into().unwrap());
    Ok(())
}

/// Sum an i64 across all ranks.
pub fn allreduce_i64_sum(comm: &dyn Comm, value: i64) -> Result<i64> {
    let parts = comm.allgatherv(&value.to_le_bytes())?;
    Ok(parts
        .iter()
        .map(|p| i64::from_le_bytes(p[..8].try_into().unwrap()))
        .sum())
}

/// Maximum of an i64 across all ranks.
pub fn allreduce_i64_max(comm: &dyn Comm, value: i64) -> Result<i64> {
    let parts = comm.allgatherv(&value.to_le_bytes())?;
    Ok(parts
        .iter()
        .map(|p| i64::from_le_bytes(p[..8].try_into().unwrap()))
        .max()
        .unwrap_or(value))
}

/// Logical OR of a flag across all ranks.
pub fn allreduce_bool_or(comm: &dyn Comm, value: bool) -> Result<bool> {
    let parts = comm.allgatherv(&[value as u8])?;
    Ok(parts.iter().any(|p| p[0] != 0))
}
