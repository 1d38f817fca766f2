//! The all-to-some exchange primitive with flow control.
//!
//! One invocation moves per-peer byte buffers between the ranks of a
//! communicator, either as point-to-point traffic with optional
//! ready-handshakes and a bounded send window, or as a single collective
//! all-to-all. Within one invocation, messages between a (sender, receiver)
//! pair arrive in program order in both modes.

use log::trace;

use crate::comm::{Comm, TAG_SWAP_DATA, TAG_SWAP_READY};
use crate::error::{Error, Result};

/// Sentinel for an unbounded send window.
pub const UNLIMITED_PEND_REQ: i32 = -1;

/// Exchange mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommType {
    /// Non-blocking point-to-point sends and receives.
    P2p,
    /// One all-to-all-v.
    #[default]
    Coll,
}

/// Which exchange directions have flow control enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowDir {
    Both,
    CompToIo,
    IoToComp,
    #[default]
    Neither,
}

/// Direction of one swap invocation, used to select flow-control options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDir {
    CompToIo,
    IoToComp,
}

/// Flow-control knobs for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowOpts {
    /// Require a ready-to-receive handshake before each send.
    pub hs: bool,
    /// Non-blocking sends (vs blocking).
    pub isend: bool,
    /// Maximum concurrent outstanding sends before waiting;
    /// [`UNLIMITED_PEND_REQ`] means unlimited.
    pub max_pend_req: i32,
}

impl Default for FlowOpts {
    fn default() -> Self {
        Self {
            hs: false,
            isend: false,
            max_pend_req: UNLIMITED_PEND_REQ,
        }
    }
}

/// Rearranger-level exchange options for an iosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RearrOpts {
    pub comm_type: CommType,
    pub fcd: FlowDir,
    pub comp2io: FlowOpts,
    pub io2comp: FlowOpts,
}

impl RearrOpts {
    fn flow_for(&self, dir: SwapDir) -> Option<FlowOpts> {
        let enabled = match (self.fcd, dir) {
            (FlowDir::Both, _) => true,
            (FlowDir::CompToIo, SwapDir::CompToIo) => true,
            (FlowDir::IoToComp, SwapDir::IoToComp) => true,
            _ => false,
        };
        if !enabled {
            return None;
        }
        Some(match dir {
            SwapDir::CompToIo => self.comp2io,
            SwapDir::IoToComp => self.io2comp,
        })
    }
}

/// Execute one exchange: `sendbufs[r]` goes to rank `r` (empty = nothing),
/// and `recvcounts[r]` bytes are expected from rank `r` (0 = nothing).
/// Returns one buffer per source rank.
pub fn swapm(
    comm: &dyn Comm,
    sendbufs: &[Vec<u8>],
    recvcounts: &[usize],
    opts: &RearrOpts,
    dir: SwapDir,
) -> Result<Vec<Vec<u8>>> {
    let n = comm.size();
    if sendbufs.len() != n || recvcounts.len() != n {
        return Err(Error::InvalidArgument);
    }
    match opts.comm_type {
        CommType::Coll => {
            // Handshake and window settings do not apply to the collective.
            let out = comm.alltoallv(sendbufs)?;
            check_counts(&out, recvcounts)?;
            Ok(out)
        }
        CommType::P2p => swapm_p2p(comm, sendbufs, recvcounts, opts.flow_for(dir)),
    }
}

fn swapm_p2p(
    comm: &dyn Comm,
    sendbufs: &[Vec<u8>],
    recvcounts: &[usize],
    flow: Option<FlowOpts>,
) -> Result<Vec<Vec<u8>>> {
    let n = comm.size();
    let me = comm.rank();
    let hs = flow.is_some_and(|f| f.hs);
    let window = flow
        .map(|f| f.max_pend_req)
        .filter(|&w| w > 0)
        .map(|w| w as usize);

    let mut out: Vec<Vec<u8>> = vec![Vec::new(); n];
    let mut done = vec![false; n];

    // All receives are logically posted here; the transport buffers for us.
    // Announce readiness to every expected sender first.
    if hs {
        for src in 0..n {
            if src != me && recvcounts[src] > 0 {
                comm.send(src, TAG_SWAP_READY, &[])?;
            }
        }
    }

    // Walk receivers in rank order starting just past our own rank, so the
    // fan-in does not converge on rank 0 first.
    let mut sent_since_drain = 0usize;
    for i in 1..=n {
        let dst = (me + i) % n;
        if dst == me || sendbufs[dst].is_empty() {
            continue;
        }
        if hs {
            comm.recv(Some(dst), TAG_SWAP_READY)?;
        }
        if let Some(w) = window
            && sent_since_drain >= w
        {
            // Window full: make receive progress before queueing more.
            drain_ready(comm, recvcounts, &mut out, &mut done, me)?;
            sent_since_drain = 0;
        }
        trace!("swapm send {} -> {} ({} bytes)", me, dst, sendbufs[dst].len());
        comm.send(dst, TAG_SWAP_DATA, &sendbufs[dst])?;
        sent_since_drain += 1;
    }

    // Local contribution does not cross the transport.
    if recvcounts[me] > 0 {
        out[me] = sendbufs[me].clone();
        done[me] = true;
    }

    // Drain the remaining receives in source order.
    for src in 0..n {
        if src == me || recvcounts[src] == 0 || done[src] {
            continue;
        }
        let (_, data) = comm.recv(Some(src), TAG_SWAP_DATA)?;
        out[src] = data;
        done[src] = true;
    }
    check_counts(&out, recvcounts)?;
    Ok(out)
}

/// Consume any already-arrived payload from sources still outstanding.
fn drain_ready(
    comm: &dyn Comm,
    recvcounts: &[usize],
    out: &mut [Vec<u8>],
    done: &mut [bool],
    me: usize,
) -> Result<()> {
    for src in 0..recvcounts.len() {
        if src == me || recvcounts[src] == 0 || done[src] {
            continue;
        }
        if comm.iprobe(Some(src), TAG_SWAP_DATA)?.is_some() {
            let (_, data) = comm.recv(Some(src), TAG_SWAP_DATA)?;
            out[src] = data;
            done[src] = true;
        }
    }
    Ok(())
}

fn check_counts(out: &[Vec<u8>], recvcounts: &[usize]) -> Result<()> {
    for (got, &want) in out.iter().zip(recvcounts) {
        if got.len() != want {
            return Err(Error::Transport(0));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalComm;
    use std::sync::Arc;
    use std::thread;

    fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalComm) -> T + Send + Sync + 'static,
    {
        let comms = LocalComm::universe(size);
        let f = Arc::new(f);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    /// Every rank sends `[rank, dst]` to every rank (itself included).
    fn full_exchange(comm: &LocalComm, opts: &RearrOpts) -> Vec<Vec<u8>> {
        let n = comm.size();
        let me = comm.rank();
        let sendbufs: Vec<Vec<u8>> = (0..n).map(|dst| vec![me as u8, dst as u8]).collect();
        let recvcounts = vec![2usize; n];
        swapm(comm, &sendbufs, &recvcounts, opts, SwapDir::CompToIo).unwrap()
    }

    fn check_full(results: Vec<Vec<Vec<u8>>>) {
        for (rank, out) in results.iter().enumerate() {
            for (src, buf) in out.iter().enumerate() {
                assert_eq!(buf, &vec![src as u8, rank as u8]);
            }
        }
    }

    #[test]
    fn test_coll_mode() {
        let results = run_ranks(4, |c| full_exchange(&c, &RearrOpts::default()));
        check_full(results);
    }

    #[test]
    fn test_p2p_mode() {
        let opts = RearrOpts {
            comm_type: CommType::P2p,
            ..Default::default()
        };
        let results = run_ranks(4, move |c| full_exchange(&c, &opts));
        check_full(results);
    }

    #[test]
    fn test_p2p_handshake() {
        let opts = RearrOpts {
            comm_type: CommType::P2p,
            fcd: FlowDir::Both,
            comp2io: FlowOpts {
                hs: true,
                isend: true,
                max_pend_req: UNLIMITED_PEND_REQ,
            },
            ..Default::default()
        };
        let results = run_ranks(3, move |c| full_exchange(&c, &opts));
        check_full(results);
    }

    #[test]
    fn test_p2p_bounded_window() {
        let opts = RearrOpts {
            comm_type: CommType::P2p,
            fcd: FlowDir::CompToIo,
            comp2io: FlowOpts {
                hs: false,
                isend: true,
                max_pend_req: 1,
            },
            ..Default::default()
        };
        let results = run_ranks(5, move |c| full_exchange(&c, &opts));
        check_full(results);
    }

    #[test]
    fn test_sparse_exchange() {
        // Only rank 0 receives; ranks send different sizes.
        let opts = RearrOpts {
            comm_type: CommType::P2p,
            ..Default::default()
        };
        let results = run_ranks(3, move |c| {
            let me = c.rank();
            let mut sendbufs = vec![Vec::new(); 3];
            sendbufs[0] = vec![me as u8; me + 1];
            let recvcounts = if me == 0 { vec![1, 2, 3] } else { vec![0, 0, 0] };
            swapm(&c, &sendbufs, &recvcounts, &opts, SwapDir::CompToIo).unwrap()
        });
        assert_eq!(results[0][0], vec![0]);
        assert_eq!(results[0][1], vec![1, 1]);
        assert_eq!(results[0][2], vec![2, 2, 2]);
        assert!(results[1].iter().all(|b| b.is_empty()));
    }

    #[test]
    fn test_count_mismatch_detected() {
        let opts = RearrOpts::default();
        let results = run_ranks(2, move |c| {
            let me = c.rank();
            let sendbufs = vec![vec![0u8; 4], vec![0u8; 4]];
            // Rank 1 expects the wrong size from rank 0.
            let recvcounts = if me == 1 { vec![3, 4] } else { vec![4, 4] };
            swapm(&c, &sendbufs, &recvcounts, &opts, SwapDir::CompToIo).is_err()
        });
        assert!(!results[0]);
        assert!(results[1]);
    }

    #[test]
    fn test_back_to_back_swaps_keep_order() {
        // Two consecutive swaps must not steal each other's messages.
        let opts = RearrOpts {
            comm_type: CommType::P2p,
            fcd: FlowDir::Both,
            comp2io: FlowOpts {
                hs: false,
                isend: true,
                max_pend_req: 1,
            },
            ..Default::default()
        };
        let results = run_ranks(3, move |c| {
            let n = c.size();
            let me = c.rank();
            let mut seen = Vec::new();
            for round in 0..3u8 {
                let sendbufs: Vec<Vec<u8>> =
                    (0..n).map(|_| vec![round, me as u8]).collect();
                let recvcounts = vec![2usize; n];
                let out = swapm(&c, &sendbufs, &recvcounts, &opts, SwapDir::CompToIo).unwrap();
                seen.push(out);
            }
            seen
        });
        for out in &results {
            for (round, bufs) in out.iter().enumerate() {
                for (src, b) in bufs.iter().enumerate() {
                    assert_eq!(b, &vec![round as u8, src as u8]);
                }
            }
        }
    }
}
