//! MPI transport for the pario core.
//!
//! Wraps an MPI communicator behind the core's [`Comm`] trait. The
//! point-to-point byte messages map onto tagged sends/receives; every
//! collective the core uses is overridden with its native MPI counterpart
//! (the trait's fallback implementations assume buffered sends, which MPI
//! does not guarantee past the eager threshold).
//!
//! One rank = one process = one `Pario` context; MPI progress is driven
//! from that single thread, per the core's single-writer rule.

use mpi::collective::Root;
use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;
use mpi::Count;

use pario_core::comm::{Comm, Tag};
use pario_core::error::{Error, Result};

/// An MPI-backed communicator endpoint.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

// One rank's MpiComm is only driven from its own thread (the core's
// registries are single-writer), so handing the handle across threads is
// sound even though the raw MPI handle is not thread-aware.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    /// Wrap a communicator, taking ownership.
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// Duplicate the world communicator of an initialized MPI universe.
    pub fn from_world(universe: &mpi::environment::Universe) -> Self {
        Self {
            comm: universe.world().duplicate(),
        }
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn send(&self, dst: usize, tag: Tag, data: &[u8]) -> Result<()> {
        self.comm
            .process_at_rank(dst as Count)
            .send_with_tag(data, tag);
        Ok(())
    }

    fn recv(&self, src: Option<usize>, tag: Tag) -> Result<(usize, Vec<u8>)> {
        let (data, status): (Vec<u8>, _) = match src {
            Some(s) => self
                .comm
                .process_at_rank(s as Count)
                .receive_vec_with_tag(tag),
            None => self.comm.any_process().receive_vec_with_tag(tag),
        };
        Ok((status.source_rank() as usize, data))
    }

    fn iprobe(&self, src: Option<usize>, tag: Tag) -> Result<Option<usize>> {
        let status = match src {
            Some(s) => self
                .comm
                .process_at_rank(s as Count)
                .immediate_probe_with_tag(tag),
            None => self.comm.any_process().immediate_probe_with_tag(tag),
        };
        Ok(status.map(|st| st.source_rank() as usize))
    }

    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Box<dyn Comm>>> {
        let c = match color {
            Some(v) => Color::with_value(v),
            None => Color::undefined(),
        };
        Ok(self
            .comm
            .split_by_color_with_key(c, key)
            .map(|comm| Box::new(MpiComm { comm }) as Box<dyn Comm>))
    }

    fn dup(&self) -> Result<Box<dyn Comm>> {
        Ok(Box::new(MpiComm {
            comm: self.comm.duplicate(),
        }))
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("aborting MPI job, code {code}");
        self.comm.abort(code)
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }

    fn bcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        let root_proc = self.comm.process_at_rank(root as Count);
        let mut len = data.len() as u64;
        root_proc.broadcast_into(&mut len);
        if self.rank() != root {
            data.resize(len as usize, 0);
        }
        if len > 0 {
            root_proc.broadcast_into(&mut data[..]);
        }
        Ok(())
    }

    fn gatherv(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let root_proc = self.comm.process_at_rank(root as Count);
        let mycount = data.len() as Count;
        if self.rank() == root {
            let mut counts = vec![0 as Count; self.size()];
            root_proc.gather_into_root(&mycount, &mut counts[..]);
            let displs = displacements(&counts);
            let total: Count = counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            {
                let mut partition = PartitionMut::new(&mut recv[..], &counts[..], &displs[..]);
                root_proc.gather_varcount_into_root(data, &mut partition);
            }
            Ok(Some(split_parts(&recv, &counts, &displs)))
        } else {
            root_proc.gather_into(&mycount);
            root_proc.gather_varcount_into(data);
            Ok(None)
        }
    }

    fn scatterv(&self, root: usize, parts: Option<&[Vec<u8>]>) -> Result<Vec<u8>> {
        let root_proc = self.comm.process_at_rank(root as Count);
        if self.rank() == root {
            let parts = parts.ok_or(Error::InvalidArgument)?;
            if parts.len() != self.size() {
                return Err(Error::InvalidArgument);
            }
            let counts: Vec<Count> = parts.iter().map(|p| p.len() as Count).collect();
            let mut mycount = 0 as Count;
            root_proc.scatter_into_root(&counts[..], &mut mycount);
            let displs = displacements(&counts);
            let flat: Vec<u8> = parts.concat();
            let mut mine = vec![0u8; mycount as usize];
            {
                let partition = Partition::new(&flat[..], &counts[..], &displs[..]);
                root_proc.scatter_varcount_into_root(&partition, &mut mine[..]);
            }
            Ok(mine)
        } else {
            let mut mycount = 0 as Count;
            root_proc.scatter_into(&mut mycount);
            let mut mine = vec![0u8; mycount as usize];
            root_proc.scatter_varcount_into(&mut mine[..]);
            Ok(mine)
        }
    }

    fn allgatherv(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mycount = data.len() as Count;
        let mut counts = vec![0 as Count; self.size()];
        self.comm.all_gather_into(&mycount, &mut counts[..]);
        let displs = displacements(&counts);
        let total: Count = counts.iter().sum();
        let mut recv = vec![0u8; total as usize];
        {
            let mut partition = PartitionMut::new(&mut recv[..], &counts[..], &displs[..]);
            self.comm.all_gather_varcount_into(data, &mut partition);
        }
        Ok(split_parts(&recv, &counts, &displs))
    }

    fn alltoallv(&self, parts: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if parts.len() != self.size() {
            return Err(Error::InvalidArgument);
        }
        let scounts: Vec<Count> = parts.iter().map(|p| p.len() as Count).collect();
        let mut rcounts = vec![0 as Count; self.size()];
        self.comm.all_to_all_into(&scounts[..], &mut rcounts[..]);
        let sdispls = displacements(&scounts);
        let rdispls = displacements(&rcounts);
        let flat: Vec<u8> = parts.concat();
        let total: Count = rcounts.iter().sum();
        let mut recv = vec![0u8; total as usize];
        {
            let send_partition = Partition::new(&flat[..], &scounts[..], &sdispls[..]);
            let mut recv_partition = PartitionMut::new(&mut recv[..], &rcounts[..], &rdispls[..]);
            self.comm
                .all_to_all_varcount_into(&send_partition, &mut recv_partition);
        }
        Ok(split_parts(&recv, &rcounts, &rdispls))
    }
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut acc = 0 as Count;
    for &c in counts {
        displs.push(acc);
        acc += c;
    }
    displs
}

fn split_parts(flat: &[u8], counts: &[Count], displs: &[Count]) -> Vec<Vec<u8>> {
    counts
        .iter()
        .zip(displs)
        .map(|(&c, &d)| flat[d as usize..(d + c) as usize].to_vec())
        .collect()
}
