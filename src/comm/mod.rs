//! Message-passing abstraction for the grid strategies.
//!
//! The strategies only ever talk to an opaque transport: non-blocking
//! point-to-point sends and receives with waitable handles, plus the
//! collectives built on top of them in [`collectives`]. Three backends are
//! provided:
//!
//! - [`NoComm`] for single-rank use and serial unit tests,
//! - [`ThreadComm`] mapping ranks to threads of one process, used by the
//!   multi-rank test suites,
//! - `MpiComm` (feature `mpi-support`) for real distributed runs.
//!
//! Wire conventions: all integers little-endian fixed width; payloads are
//! `bytemuck`-castable records (see [`crate::wire`]). Receivers truncate to
//! their buffer length, so phases with variable-length payloads exchange
//! sizes first on a dedicated tag.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

pub mod collectives;
#[cfg(feature = "mpi-support")]
mod mpi_backend;

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

/// Anything that can be waited on.
pub trait Wait {
    /// Blocks until completion; returns the received bytes for receives.
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface, minimal by design.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Posts a receive; `buf.len()` bounds the accepted message size.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process, `0..size`.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (no-op where a single rank cannot race).
    fn barrier(&self) {}
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Offsets the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

/// Tags reserved for the phases of one repartitioning round.
///
/// Every phase owns a tag so the two communication steps of diffusive
/// balancing (and the size/payload stages within each) can never alias.
#[derive(Copy, Clone, Debug)]
pub struct RepartTags {
    /// Neighborhood load exchange.
    pub loads: CommTag,
    /// Cell reassignment tables (size stage on `cells`, payload on `+1`).
    pub cells: CommTag,
    /// Shell ownership records (size stage on `shells`, payload on `+1`).
    pub shells: CommTag,
    /// Gathered per-rank scalars and vectors (grid points, validity votes).
    pub gather: CommTag,
}

impl RepartTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        // Two tags apart: each phase may use a size and a payload stage.
        Self {
            loads: base,
            cells: base.offset(2),
            shells: base.offset(4),
            gather: base.offset(6),
        }
    }
}

/// Tags used by grid construction and repartitioning rounds.
pub const REPART_TAGS: RepartTags = RepartTags::from_base(CommTag::new(0x4100));

/// A neighbor set scoped to one partition generation.
///
/// Mirrors a graph-topology communicator: acquired after every rebuild,
/// released (dropped) before the next one, on every exit path.
pub struct NeighborhoodComm<'a, C: Communicator> {
    comm: &'a C,
    neighbors: &'a [crate::index::Rank],
}

impl<'a, C: Communicator> NeighborhoodComm<'a, C> {
    pub fn new(comm: &'a C, neighbors: &'a [crate::index::Rank]) -> Self {
        Self { comm, neighbors }
    }

    pub fn degree(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> &[crate::index::Rank] {
        self.neighbors
    }

    /// Gathers one payload from every neighbor, neighbor order.
    pub fn allgather(&self, tag: CommTag, data: &[u8]) -> Vec<Vec<u8>> {
        collectives::subset_all_gather(self.comm, self.neighbors, tag, data)
    }
}

// --- NoComm: single rank, no transport ---

/// Compile-time no-op transport for a single rank.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- ThreadComm: one rank per thread of this process ---

type SlotKey = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
}

struct BarrierState {
    arrived: usize,
    epoch: usize,
}

/// Mailbox shared by all ranks of one `ThreadComm` world.
///
/// Unlike a process-global mailbox, a per-world instance keeps concurrently
/// running multi-rank tests from seeing each other's messages.
struct World {
    size: usize,
    slots: Mutex<HashMap<SlotKey, Arc<Slot>>>,
    barrier: Mutex<BarrierState>,
    barrier_cv: Condvar,
}

impl World {
    fn slot(&self, key: SlotKey) -> Arc<Slot> {
        let mut g = self.slots.lock().expect("mailbox poisoned");
        g.entry(key).or_default().clone()
    }
}

/// Intra-process transport: every rank is a thread, messages are queues.
///
/// Message order between a fixed `(src, dst, tag)` triple is FIFO, matching
/// the ordering guarantees strategies rely on.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    world: Arc<World>,
}

impl ThreadComm {
    /// Creates a world of `size` connected ranks, one comm per rank.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "world needs at least one rank");
        let world = Arc::new(World {
            size,
            slots: Mutex::new(HashMap::new()),
            barrier: Mutex::new(BarrierState { arrived: 0, epoch: 0 }),
            barrier_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                world: world.clone(),
            })
            .collect()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    slot: Arc<Slot>,
    want_len: usize,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut q = self.slot.q.lock().expect("slot poisoned");
        while q.is_empty() {
            q = self.slot.cv.wait(q).expect("condvar poisoned");
        }
        let mut msg = q.pop_front().expect("queue non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let slot = self.world.slot((self.rank, peer, tag));
        {
            let mut q = slot.q.lock().expect("slot poisoned");
            q.push_back(buf.to_vec());
        }
        slot.cv.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        ThreadRecvHandle {
            slot: self.world.slot((peer, self.rank, tag)),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world.size
    }

    fn barrier(&self) {
        let mut b = self.world.barrier.lock().expect("barrier poisoned");
        let epoch = b.epoch;
        b.arrived += 1;
        if b.arrived == self.world.size {
            b.arrived = 0;
            b.epoch += 1;
            self.world.barrier_cv.notify_all();
        } else {
            while b.epoch == epoch {
                b = self.world.barrier_cv.wait(b).expect("barrier poisoned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_comm_round_trip() {
        let mut comms = ThreadComm::world(2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        let msg = b"hello";
        let _s = c0.isend(1, 7, msg);

        let mut buf = [0u8; 5];
        let got = c1.irecv(0, 7, &mut buf).wait().unwrap();
        assert_eq!(&got, msg);
    }

    #[test]
    fn thread_comm_fifo_order() {
        let mut comms = ThreadComm::world(2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        for i in 0..10u8 {
            let _ = c0.isend(1, 9, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let mut b = [0u8; 1];
            out.push(c1.irecv(0, 9, &mut b).wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn thread_comm_truncates_to_buffer() {
        let mut comms = ThreadComm::world(2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        let _ = c0.isend(1, 3, &[1, 2, 3, 4, 5, 6]);
        let mut b = [0u8; 4];
        assert_eq!(c1.irecv(0, 3, &mut b).wait().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn worlds_are_isolated() {
        let a = ThreadComm::world(2);
        let b = ThreadComm::world(2);
        let _ = a[0].isend(1, 5, b"for world a");
        // World b must not observe world a's message; send our own and
        // verify it is the one delivered.
        let _ = b[0].isend(1, 5, b"for world b");
        let mut buf = [0u8; 11];
        let got = b[1].irecv(0, 5, &mut buf).wait().unwrap();
        assert_eq!(&got, b"for world b");
    }
}
