//! Communication abstraction for the adaptation phase barriers.
//!
//! The [`Communicator`] trait is the named seam between the adapter and
//! whatever transport the driver runs on: non-blocking point-to-point
//! send/receive plus the three collectives the schedulers need. Two
//! implementations ship here: [`NoComm`] for serial runs and
//! [`MailboxComm`], which runs a rank group as threads of one process and
//! backs the multi-rank tests. An MPI-bound implementation belongs to the
//! driver; the trait is shaped so one drops in without touching the
//! adapter.
//!
//! Wire format conventions (for higher-level protocols):
//! - All integers are LE fixed width (u32 counts, u64 IDs and f64 bit
//!   patterns carried as u64 words).
//! - Receivers may truncate to their provided buffer length; higher layers
//!   exchange sizes first when exact lengths are required.
//! - Collectives are SPMD: every rank issues the same sequence of collective
//!   calls, so FIFO matching per (peer, tag) lane suffices.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface with the collectives the adaptation
/// phase barriers need.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for serial comms).
    fn barrier(&self) {}

    /// Exchange one count with every rank; `send[p]` goes to rank `p` and
    /// the returned vector holds what each rank sent here.
    fn alltoall_counts(&self, send: &[u32]) -> Vec<u32>;

    /// Global maximum of a signed value.
    fn allreduce_max_i32(&self, x: i32) -> i32;

    /// Elementwise global sum, in place. Every rank passes the same length.
    fn allreduce_sum_u64(&self, xs: &mut [u64]);
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
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Tag bundle for the two-phase halo transfers used by the coarsener.
#[derive(Copy, Clone, Debug)]
pub struct AdaptCommTags {
    /// Tag used for pending-collapse payloads.
    pub collapses: CommTag,
    /// Tag used for the halo-extension round.
    pub halo_extension: CommTag,
}

impl AdaptCommTags {
    /// Construct tags from a base, assigning deterministic offsets per phase.
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            collapses: base,
            halo_extension: base.offset(1),
        }
    }
}

/// Tag reserved for the collective primitives of the mailbox backend.
const COLLECTIVE_TAG: u16 = 0xFFF0;

/// Compile-time no-op comm for pure serial use.
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

    fn alltoall_counts(&self, send: &[u32]) -> Vec<u32> {
        send.to_vec()
    }

    fn allreduce_max_i32(&self, x: i32) -> i32 {
        x
    }

    fn allreduce_sum_u64(&self, _xs: &mut [u64]) {}
}

// --- MailboxComm: a rank group as threads of one process ---

/// Ordered delivery lane from one rank to another under one tag.
type Lane = (usize, usize, u16); // (src, dst, tag)

/// Shared state of one rank group: all in-flight messages under a single
/// lock, with one condvar announcing any delivery. Coarse, but the traffic
/// here is a handful of messages per phase barrier.
#[derive(Debug)]
struct Exchange {
    inboxes: Mutex<HashMap<Lane, VecDeque<Vec<u8>>>>,
    delivered: Condvar,
    size: usize,
}

impl Exchange {
    fn post(&self, lane: Lane, payload: Vec<u8>) {
        let mut inboxes = self.inboxes.lock().expect("exchange poisoned");
        inboxes.entry(lane).or_default().push_back(payload);
        self.delivered.notify_all();
    }

    fn take(&self, lane: Lane) -> Vec<u8> {
        let mut inboxes = self.inboxes.lock().expect("exchange poisoned");
        loop {
            if let Some(msg) = inboxes.get_mut(&lane).and_then(|q| q.pop_front()) {
                return msg;
            }
            inboxes = self.delivered.wait(inboxes).expect("exchange poisoned");
        }
    }
}

/// In-process communicator: the ranks of one group are threads sharing one
/// [`Exchange`]. There is no process-global state, so concurrently running
/// groups cannot interfere. Build the whole group up front with
/// [`MailboxComm::group`] and hand one handle to each rank thread.
#[derive(Clone, Debug)]
pub struct MailboxComm {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl MailboxComm {
    /// Create a connected group of `size` ranks, returned in rank order.
    pub fn group(size: usize) -> Vec<MailboxComm> {
        let exchange = Arc::new(Exchange {
            inboxes: Mutex::new(HashMap::new()),
            delivered: Condvar::new(),
            size,
        });
        (0..size)
            .map(|rank| MailboxComm {
                rank,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }
}

/// Receive handle resolved against the group exchange on wait.
pub struct MailboxRecvHandle {
    exchange: Arc<Exchange>,
    lane: Lane,
    want_len: usize,
}

impl Wait for MailboxRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let mut msg = self.exchange.take(self.lane);
        // Receivers may truncate to the length they posted.
        if msg.len() > self.want_len {
            msg.truncate(self.want_len);
        }
        Some(msg)
    }
}

impl Communicator for MailboxComm {
    // Sends complete on enqueue, so the unit handle is enough.
    type SendHandle = ();
    type RecvHandle = MailboxRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        self.exchange.post((self.rank, peer, tag), buf.to_vec());
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MailboxRecvHandle {
        MailboxRecvHandle {
            exchange: Arc::clone(&self.exchange),
            lane: (peer, self.rank, tag),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.exchange.size
    }

    fn alltoall_counts(&self, send: &[u32]) -> Vec<u32> {
        let size = self.size();
        let mut out = vec![0u32; size];
        for p in 0..size {
            if p == self.rank {
                out[p] = send[p];
            } else {
                self.isend(p, COLLECTIVE_TAG, &send[p].to_le_bytes());
            }
        }
        for (p, slot) in out.iter_mut().enumerate() {
            if p == self.rank {
                continue;
            }
            let mut template = [0u8; 4];
            let msg = self
                .irecv(p, COLLECTIVE_TAG, &mut template)
                .wait()
                .expect("alltoall receive yielded no data");
            *slot = u32::from_le_bytes(msg[..4].try_into().expect("short alltoall message"));
        }
        out
    }

    fn allreduce_max_i32(&self, x: i32) -> i32 {
        let size = self.size();
        let mut acc = x;
        for p in 0..size {
            if p != self.rank {
                self.isend(p, COLLECTIVE_TAG, &x.to_le_bytes());
            }
        }
        for p in 0..size {
            if p == self.rank {
                continue;
            }
            let mut template = [0u8; 4];
            let msg = self
                .irecv(p, COLLECTIVE_TAG, &mut template)
                .wait()
                .expect("allreduce receive yielded no data");
            acc = acc.max(i32::from_le_bytes(
                msg[..4].try_into().expect("short allreduce message"),
            ));
        }
        acc
    }

    fn allreduce_sum_u64(&self, xs: &mut [u64]) {
        let size = self.size();
        let bytes: Vec<u8> = xs.iter().flat_map(|x| x.to_le_bytes()).collect();
        for p in 0..size {
            if p != self.rank {
                self.isend(p, COLLECTIVE_TAG, &bytes);
            }
        }
        for p in 0..size {
            if p == self.rank {
                continue;
            }
            let mut template = vec![0u8; bytes.len()];
            let msg = self
                .irecv(p, COLLECTIVE_TAG, &mut template)
                .wait()
                .expect("allreduce receive yielded no data");
            for (i, chunk) in msg.chunks_exact(8).enumerate() {
                xs[i] += u64::from_le_bytes(chunk.try_into().expect("short sum chunk"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn mailbox_point_to_point_roundtrip() {
        let mut group = MailboxComm::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let t = thread::spawn(move || {
            let mut template = [0u8; 8];
            b.irecv(0, 7, &mut template).wait().unwrap()
        });
        a.isend(1, 7, &[1, 2, 3, 4, 5, 6, 7, 8]).wait();
        assert_eq!(t.join().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn receiver_truncates_to_posted_length() {
        let mut group = MailboxComm::group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let t = thread::spawn(move || {
            let mut template = [0u8; 2];
            b.irecv(0, 9, &mut template).wait().unwrap()
        });
        a.isend(1, 9, &[5, 6, 7, 8]).wait();
        assert_eq!(t.join().unwrap(), vec![5, 6]);
    }

    #[test]
    fn concurrent_groups_do_not_interfere() {
        let run_group = |payload: u8| {
            let mut group = MailboxComm::group(2);
            let b = group.pop().unwrap();
            let a = group.pop().unwrap();
            let t = thread::spawn(move || {
                let mut template = [0u8; 1];
                b.irecv(0, 11, &mut template).wait().unwrap()
            });
            a.isend(1, 11, &[payload]);
            (t, payload)
        };

        let (t1, p1) = run_group(42);
        let (t2, p2) = run_group(99);
        assert_eq!(t1.join().unwrap(), vec![p1]);
        assert_eq!(t2.join().unwrap(), vec![p2]);
    }

    #[test]
    fn mailbox_collectives_agree_across_ranks() {
        let handles: Vec<_> = MailboxComm::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let rank = comm.rank();
                    let counts =
                        comm.alltoall_counts(&[rank as u32, 10 + rank as u32, 20 + rank as u32]);
                    let max = comm.allreduce_max_i32(rank as i32 * 5 - 3);
                    let mut sums = [1u64, rank as u64];
                    comm.allreduce_sum_u64(&mut sums);
                    (counts, max, sums)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // counts[p] on rank r equals entry r of rank p's send vector.
        assert_eq!(results[0].0, vec![0, 1, 2]);
        assert_eq!(results[1].0, vec![10, 11, 12]);
        assert_eq!(results[2].0, vec![20, 21, 22]);
        for r in &results {
            assert_eq!(r.1, 7);
            assert_eq!(r.2, [3, 3]);
        }
    }
}
