//! Communicator topology: which ranks compute, which ranks do I/O, and the
//! communicators tying them together.

use std::sync::Arc;

use log::debug;

use crate::comm::Comm;
use crate::context::Pario;
use crate::error::{Error, ErrorHandler, Result};
use crate::swapm::RearrOpts;
use crate::types::Rearranger;

/// One initialized I/O system: the communicator set, rank roles, and
/// defaults scoped to it.
pub struct IoSystem {
    pub iosysid: i32,
    /// All ranks of the system: computation ranks plus I/O ranks. In sync
    /// mode this is a duplicate of the computation comm.
    pub union_comm: Arc<dyn Comm>,
    /// Computation ranks only. `None` on async I/O ranks.
    pub comp_comm: Option<Arc<dyn Comm>>,
    /// I/O ranks only. `None` on ranks outside the I/O group.
    pub io_comm: Option<Arc<dyn Comm>>,
    /// Parameter-broadcast channel for async mode, spanning the union.
    pub intercomm: Option<Arc<dyn Comm>>,
    pub async_mode: bool,
    pub ioproc: bool,
    pub compproc: bool,
    pub union_rank: usize,
    /// Rank in the computation comm, or -1 when not a computation rank.
    pub comp_rank: i32,
    /// Rank in the I/O comm, or -1 when not an I/O rank.
    pub io_rank: i32,
    pub num_iotasks: usize,
    pub num_comptasks: usize,
    pub num_uniontasks: usize,
    /// Union-comm ranks of the I/O tasks, indexed by I/O comm rank.
    pub ioranks: Vec<usize>,
    /// Union-comm ranks of the computation tasks, indexed by comp rank.
    pub compranks: Vec<usize>,
    /// Union-comm rank of I/O task 0.
    pub ioroot: usize,
    /// Union-comm rank of computation task 0.
    pub comproot: usize,
    pub compmaster: bool,
    pub iomaster: bool,
    pub default_rearranger: Rearranger,
    pub rearr_opts: RearrOpts,
    pub error_handler: ErrorHandler,
}

impl std::fmt::Debug for IoSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem")
            .field("iosysid", &self.iosysid)
            .finish_non_exhaustive()
    }
}

impl IoSystem {
    /// The communicator every rank of the system participates in for
    /// system-scoped collectives: the computation comm in sync mode, the
    /// union comm in async mode.
    pub fn my_comm(&self) -> &Arc<dyn Comm> {
        if self.async_mode {
            &self.union_comm
        } else {
            self.comp_comm.as_ref().unwrap_or(&self.union_comm)
        }
    }
}

/// Outcome of [`Pario::init_async`].
pub enum InitAsync {
    /// Computation rank: one iosysid per component (use the entry for the
    /// component this rank belongs to).
    Comp { iosysids: Vec<i32> },
    /// I/O rank: the dispatcher served its components and every one of them
    /// has exited.
    IoDone,
}

impl Pario {
    /// Initialize a sync-mode iosystem on a computation communicator.
    ///
    /// The i-th I/O task is computation rank `(base + i*stride) mod
    /// num_comptasks`; I/O tasks are a subset of the computation tasks.
    pub fn init_intracomm(
        &mut self,
        comp_comm: &dyn Comm,
        num_iotasks: usize,
        stride: usize,
        base: usize,
        rearranger: Rearranger,
    ) -> Result<i32> {
        let num_comptasks = comp_comm.size();
        if num_iotasks < 1 || stride < 1 || num_iotasks * stride > num_comptasks {
            return Err(Error::InvalidArgument);
        }
        debug!(
            "init_intracomm ntasks={num_comptasks} niotasks={num_iotasks} stride={stride} base={base}"
        );

        let union_comm: Arc<dyn Comm> = Arc::from(comp_comm.dup()?);
        let comp_dup: Arc<dyn Comm> = Arc::from(comp_comm.dup()?);
        let rank = union_comm.rank();

        let ioranks: Vec<usize> = (0..num_iotasks)
            .map(|i| (base + i * stride) % num_comptasks)
            .collect();
        let io_index = ioranks.iter().position(|&r| r == rank);
        let ioproc = io_index.is_some();

        let io_comm = union_comm
            .split(io_index.map(|_| 0), io_index.unwrap_or(0) as i32)?
            .map(Arc::from);

        let iosysid = self.next_iosysid;
        self.next_iosysid += 1;

        let ios = IoSystem {
            iosysid,
            union_comm,
            comp_comm: Some(comp_dup),
            io_comm,
            intercomm: None,
            async_mode: false,
            ioproc,
            compproc: true,
            union_rank: rank,
            comp_rank: rank as i32,
            io_rank: io_index.map_or(-1, |i| i as i32),
            num_iotasks,
            num_comptasks,
            num_uniontasks: num_comptasks,
            ioroot: ioranks[0],
            comproot: 0,
            compmaster: rank == 0,
            iomaster: rank == ioranks[0],
            ioranks,
            compranks: (0..num_comptasks).collect(),
            default_rearranger: rearranger,
            rearr_opts: RearrOpts::default(),
            error_handler: self.default_error_handler,
        };
        self.iosystems.insert(iosysid, ios);
        Ok(iosysid)
    }

    /// Initialize async-mode iosystems on a world communicator.
    ///
    /// `io_ranks` lists the world ranks of the shared I/O group;
    /// `comp_rank_lists` gives each component's world ranks. Every world
    /// rank must call this. I/O ranks do not return until every component
    /// has sent the exit message: they enter the dispatch loop and serve
    /// the components' commands.
    pub fn init_async(
        &mut self,
        world: &dyn Comm,
        io_ranks: &[usize],
        comp_rank_lists: &[Vec<usize>],
        rearranger: Rearranger,
    ) -> Result<InitAsync> {
        let wsize = world.size();
        if io_ranks.is_empty() || comp_rank_lists.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut seen = vec![false; wsize];
        for &r in io_ranks.iter().chain(comp_rank_lists.iter().flatten()) {
            if r >= wsize || seen[r] {
                return Err(Error::InvalidArgument);
            }
            seen[r] = true;
        }

        let me = world.rank();
        let io_index = io_ranks.iter().position(|&r| r == me);
        let in_io = io_index.is_some();
        let num_io = io_ranks.len();

        // One shared I/O comm across all components.
        let io_comm: Option<Arc<dyn Comm>> = world
            .split(io_index.map(|_| 0), io_index.unwrap_or(0) as i32)?
            .map(Arc::from);

        let mut iosysids = Vec::with_capacity(comp_rank_lists.len());
        let mut served = Vec::new();

        for comp_list in comp_rank_lists {
            let comp_index = comp_list.iter().position(|&r| r == me);
            let in_comp = comp_index.is_some();
            let num_comp = comp_list.len();

            // Union comm: I/O ranks first, then this component's ranks.
            let union_key = io_index
                .map(|i| i as i32)
                .or(comp_index.map(|i| (num_io + i) as i32));
            let union_comm = world.split(union_key.map(|_| 0), union_key.unwrap_or(0))?;

            // The component's own computation comm.
            let comp_comm = world.split(comp_index.map(|_| 0), comp_index.unwrap_or(0) as i32)?;

            let iosysid = self.next_iosysid;
            self.next_iosysid += 1;

            if union_key.is_none() {
                iosysids.push(iosysid);
                continue;
            }
            let union_comm: Arc<dyn Comm> = Arc::from(union_comm.ok_or(Error::Transport(0))?);
            let intercomm: Arc<dyn Comm> = Arc::from(union_comm.dup()?);
            let union_rank = union_comm.rank();

            debug!(
                "init_async iosysid={iosysid} union_rank={union_rank} in_io={in_io} in_comp={in_comp}"
            );

            let ios = IoSystem {
                iosysid,
                union_comm,
                comp_comm: comp_comm.map(Arc::from),
                io_comm: io_comm.clone(),
                intercomm: Some(intercomm),
                async_mode: true,
                ioproc: in_io,
                compproc: in_comp,
                union_rank,
                comp_rank: comp_index.map_or(-1, |i| i as i32),
                io_rank: io_index.map_or(-1, |i| i as i32),
                num_iotasks: num_io,
                num_comptasks: num_comp,
                num_uniontasks: num_io + num_comp,
                ioranks: (0..num_io).collect(),
                compranks: (num_io..num_io + num_comp).collect(),
                ioroot: 0,
                // First non-IO rank of the union; IO ranks come first.
                comproot: num_io,
                compmaster: union_rank == num_io,
                iomaster: union_rank == 0,
                default_rearranger: rearranger,
                rearr_opts: RearrOpts::default(),
                error_handler: self.default_error_handler,
            };
            self.iosystems.insert(iosysid, ios);
            iosysids.push(iosysid);
            served.push(iosysid);
        }

        if in_io {
            self.io_msg_loop(&served)?;
            Ok(InitAsync::IoDone)
        } else {
            Ok(InitAsync::Comp { iosysids })
        }
    }

    /// Shut down an iosystem. In async mode, computation ranks send the
    /// exit message to the I/O group first. Open files referencing the
    /// iosystem must have been closed; remaining decompositions are freed.
    pub fn finalize(&mut self, iosysid: i32) -> Result<()> {
        let ios = self.iosys(iosysid)?;
        if self.files.values().any(|f| f.iosysid == iosysid) {
            return Err(Error::InvalidArgument);
        }
        let async_comp = ios.async_mode && !ios.ioproc;
        if async_comp {
            self.forward(iosysid, crate::dispatch::MsgTag::Exit, &[])?;
        }
        self.free_iosystem_local(iosysid)
    }

    pub(crate) fn free_iosystem_local(&mut self, iosysid: i32) -> Result<()> {
        let leftover: Vec<i32> = self
            .decomps
            .values()
            .filter(|d| d.iosysid == iosysid)
            .map(|d| d.ioid)
            .collect();
        for ioid in leftover {
            self.decomps.remove(&ioid);
        }
        self.iosystems.remove(&iosysid).ok_or(Error::BadId)?;
        Ok(())
    }

    /// Set the exchange flow-control options used by this iosystem's
    /// rearrangers.
    pub fn set_rearr_opts(&mut self, iosysid: i32, opts: RearrOpts) -> Result<()> {
        self.iosys_mut(iosysid)?.rearr_opts = opts;
        Ok(())
    }

    /// Is this rank an I/O task of the iosystem?
    pub fn iam_iotask(&self, iosysid: i32) -> Result<bool> {
        Ok(self.iosys(iosysid)?.ioproc)
    }

    /// This rank's position in the I/O comm, or -1 when not an I/O task.
    pub fn iotask_rank(&self, iosysid: i32) -> Result<i32> {
        Ok(self.iosys(iosysid)?.io_rank)
    }

    /// Number of I/O tasks in the iosystem.
    pub fn num_iotasks(&self, iosysid: i32) -> Result<usize> {
        Ok(self.iosys(iosysid)?.num_iotasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalComm;
    use std::thread;

    fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(usize, LocalComm) -> T + Send + Sync + 'static,
    {
        let comms = LocalComm::universe(size);
        let f = Arc::new(f);
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, c)| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(rank, c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_init_intracomm_roles() {
        let results = run_ranks(4, |_, comm| {
            let mut pio = Pario::new();
            let id = pio
                .init_intracomm(&comm, 2, 2, 0, Rearranger::Box)
                .unwrap();
            let ios = pio.iosys(id).unwrap();
            (
                ios.ioproc,
                ios.io_rank,
                ios.ioranks.clone(),
                ios.num_uniontasks,
                ios.compmaster,
                ios.iomaster,
            )
        });
        // stride 2 from base 0: io tasks are ranks 0 and 2.
        assert_eq!(results[0].0, true);
        assert_eq!(results[1].0, false);
        assert_eq!(results[2].0, true);
        assert_eq!(results[3].0, false);
        assert_eq!(results[0].1, 0);
        assert_eq!(results[2].1, 1);
        for r in &results {
            assert_eq!(r.2, vec![0, 2]);
            assert_eq!(r.3, 4);
        }
        assert!(results[0].4 && results[0].5);
        assert!(!results[1].4 && !results[1].5);
    }

    #[test]
    fn test_init_intracomm_wrapping_base() {
        let results = run_ranks(4, |_, comm| {
            let mut pio = Pario::new();
            let id = pio
                .init_intracomm(&comm, 2, 2, 3, Rearranger::Box)
                .unwrap();
            let ios = pio.iosys(id).unwrap();
            (ios.ioranks.clone(), ios.ioroot)
        });
        // base 3, stride 2 mod 4: io tasks are ranks 3 and 1.
        for r in &results {
            assert_eq!(r.0, vec![3, 1]);
            assert_eq!(r.1, 3);
        }
    }

    #[test]
    fn test_init_intracomm_validates_counts() {
        let results = run_ranks(2, |_, comm| {
            let mut pio = Pario::new();
            let too_many = pio.init_intracomm(&comm, 3, 1, 0, Rearranger::Box);
            let zero = pio.init_intracomm(&comm, 0, 1, 0, Rearranger::Box);
            let wide = pio.init_intracomm(&comm, 2, 2, 0, Rearranger::Box);
            (too_many.is_err(), zero.is_err(), wide.is_err())
        });
        for r in results {
            assert_eq!(r, (true, true, true));
        }
    }

    #[test]
    fn test_finalize_frees() {
        let results = run_ranks(2, |_, comm| {
            let mut pio = Pario::new();
            let id = pio
                .init_intracomm(&comm, 1, 1, 0, Rearranger::Box)
                .unwrap();
            assert!(pio.iosystem_is_active(id));
            pio.finalize(id).unwrap();
            let second = pio.finalize(id);
            (pio.iosystem_is_active(id), second.unwrap_err())
        });
        for (active, err) in results {
            assert!(!active);
            assert_eq!(err, Error::BadId);
        }
    }
}
