//! In-process transport: N ranks as N threads, message passing through
//! shared mailboxes.
//!
//! This is the communicator the test suites run on. Semantics match the
//! [`Comm`](super::Comm) contract: sends are buffered and never block,
//! receives match on (source, tag) and preserve per-pair FIFO order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::{Comm, Tag};
use crate::error::{Error, Result};

struct Msg {
    src: usize,
    tag: Tag,
    data: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Msg>>,
    ready: Condvar,
}

impl Mailbox {
    fn push(&self, msg: Msg) {
        let mut q = self.queue.lock().unwrap();
        q.push_back(msg);
        self.ready.notify_all();
    }

    fn pop(&self, src: Option<usize>, tag: Tag) -> Msg {
        let mut q = self.queue.lock().unwrap();
        loop {
            let found = q
                .iter()
                .position(|m| m.tag == tag && src.is_none_or(|s| s == m.src));
            if let Some(i) = found {
                return q.remove(i).unwrap();
            }
            q = self.ready.wait(q).unwrap();
        }
    }

    fn probe(&self, src: Option<usize>, tag: Tag) -> Option<usize> {
        let q = self.queue.lock().unwrap();
        q.iter()
            .find(|m| m.tag == tag && src.is_none_or(|s| s == m.src))
            .map(|m| m.src)
    }
}

struct Group {
    mailboxes: Vec<Mailbox>,
}

impl Group {
    fn new(size: usize) -> Self {
        Self {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
        }
    }
}

#[derive(Default)]
struct UniverseShared {
    groups: Mutex<HashMap<u64, Arc<Group>>>,
    next_group: AtomicU64,
}

impl UniverseShared {
    fn register(&self, size: usize) -> u64 {
        let id = self.next_group.fetch_add(1, Ordering::SeqCst);
        self.groups
            .lock()
            .unwrap()
            .insert(id, Arc::new(Group::new(size)));
        id
    }

    fn get(&self, id: u64) -> Arc<Group> {
        Arc::clone(self.groups.lock().unwrap().get(&id).expect("group exists"))
    }
}

/// One rank's endpoint in an in-process communicator.
pub struct LocalComm {
    universe: Arc<UniverseShared>,
    group: Arc<Group>,
    rank: usize,
}

impl LocalComm {
    /// Create a universe of `size` ranks, returning one endpoint per rank.
    /// Each endpoint is meant to be moved onto its own thread.
    pub fn universe(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "universe needs at least one rank");
        let shared = Arc::new(UniverseShared::default());
        let id = shared.register(size);
        (0..size)
            .map(|rank| LocalComm {
                universe: Arc::clone(&shared),
                group: shared.get(id),
                rank,
            })
            .collect()
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.mailboxes.len()
    }

    fn send(&self, dst: usize, tag: Tag, data: &[u8]) -> Result<()> {
        if dst >= self.size() {
            return Err(Error::InvalidArgument);
        }
        self.group.mailboxes[dst].push(Msg {
            src: self.rank,
            tag,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn recv(&self, src: Option<usize>, tag: Tag) -> Result<(usize, Vec<u8>)> {
        if let Some(s) = src
            && s >= self.size()
        {
            return Err(Error::InvalidArgument);
        }
        let msg = self.group.mailboxes[self.rank].pop(src, tag);
        Ok((msg.src, msg.data))
    }

    fn iprobe(&self, src: Option<usize>, tag: Tag) -> Result<Option<usize>> {
        Ok(self.group.mailboxes[self.rank].probe(src, tag))
    }

    fn split(&self, color: Option<i32>, key: i32) -> Result<Option<Box<dyn Comm>>> {
        // Rank 0 of the parent collects (color, key), carves out the new
        // groups, and hands every member its assignment.
        let mut entry = Vec::with_capacity(12);
        entry.extend_from_slice(&color.unwrap_or(i32::MIN).to_le_bytes());
        entry.extend_from_slice(&(color.is_some() as u32).to_le_bytes());
        entry.extend_from_slice(&key.to_le_bytes());
        let gathered = self.gatherv(0, &entry)?;

        let assignments = gathered.map(|parts| {
            let mut by_color: BTreeMap<i32, Vec<(i32, usize)>> = BTreeMap::new();
            for (rank, p) in parts.iter().enumerate() {
                let c = i32::from_le_bytes(p[0..4].try_into().unwrap());
                let present = u32::from_le_bytes(p[4..8].try_into().unwrap()) != 0;
                let k = i32::from_le_bytes(p[8..12].try_into().unwrap());
                if present {
                    by_color.entry(c).or_default().push((k, rank));
                }
            }
            let mut out = vec![(u64::MAX, 0usize); parts.len()];
            for members in by_color.values_mut() {
                members.sort();
                let id = self.universe.register(members.len());
                for (new_rank, &(_, old_rank)) in members.iter().enumerate() {
                    out[old_rank] = (id, new_rank);
                }
            }
            out.iter()
                .map(|(id, r)| {
                    let mut b = id.to_le_bytes().to_vec();
                    b.extend_from_slice(&(*r as u64).to_le_bytes());
                    b
                })
                .collect::<Vec<_>>()
        });

        let mine = self.scatterv(0, assignments.as_deref())?;
        let id = u64::from_le_bytes(mine[0..8].try_into().unwrap());
        let new_rank = u64::from_le_bytes(mine[8..16].try_into().unwrap()) as usize;
        if id == u64::MAX {
            return Ok(None);
        }
        Ok(Some(Box::new(LocalComm {
            universe: Arc::clone(&self.universe),
            group: self.universe.get(id),
            rank: new_rank,
        })))
    }

    fn dup(&self) -> Result<Box<dyn Comm>> {
        let c = self.split(Some(0), self.rank as i32)?;
        c.ok_or(Error::Transport(0))
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("local comm abort, code {code}");
        std::process::abort();
    }
}
