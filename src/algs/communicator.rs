//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Handles are **waitable**: the balance rounds in
//! [`crate::topology::refine::consistency`] call `.wait()` before they trust
//! that a buffer is ready, and terminate only on the global reduction
//! [`Communicator::any`].

use crate::algs::wire::{self, WireCount, WireFlag};
use crate::mesh_error::MeshError;
use bytemuck::Pod;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-to-point messaging plus the two collectives the engine needs.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Exchange with `peer`; `recv` is sized for what the peer sends, which
    /// may differ from `send`.
    fn exchange(&self, peer: usize, tag: u16, send: &[u8], recv: &mut [u8]) -> Result<(), MeshError> {
        let handle = self.irecv(peer, tag, recv);
        self.isend(peer, tag, send).wait();
        let data = handle
            .wait()
            .ok_or_else(|| MeshError::CommError(format!("no message from rank {peer} (tag {tag})")))?;
        wire::expect_exact_len(data.len(), recv.len())?;
        recv.copy_from_slice(&data);
        Ok(())
    }

    /// Global OR over all ranks. Blocks until every rank has contributed.
    fn any(&self, flag: bool) -> Result<bool, MeshError> {
        let size = self.size();
        let me = self.rank();
        if size <= 1 {
            return Ok(flag);
        }
        let send = wire::encode(wire::KIND_FLAG, &[WireFlag::new(flag)]);
        let mut handles = Vec::with_capacity(size - 1);
        let mut scratch = vec![0u8; send.len()];
        for peer in (0..size).filter(|&p| p != me) {
            handles.push((peer, self.irecv(peer, wire::TAG_REDUCE, &mut scratch)));
        }
        for peer in (0..size).filter(|&p| p != me) {
            self.isend(peer, wire::TAG_REDUCE, &send).wait();
        }
        let mut result = flag;
        for (peer, handle) in handles {
            let data = handle.wait().ok_or_else(|| {
                MeshError::CommError(format!("rank {peer} did not join the reduction"))
            })?;
            let flags: Vec<WireFlag> = wire::decode(wire::KIND_FLAG, &data)?;
            result |= flags.first().is_some_and(WireFlag::get);
        }
        Ok(result)
    }
}

/// Swap record lists of any length with `peer`: the counts, then the records.
pub fn exchange_records<C, T>(
    comm: &C,
    peer: usize,
    tag: u16,
    kind: u16,
    records: &[T],
) -> Result<Vec<T>, MeshError>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    let send_count = wire::encode(wire::KIND_COUNT, &[WireCount::new(records.len())]);
    let mut recv_count = vec![0u8; send_count.len()];
    comm.exchange(peer, tag, &send_count, &mut recv_count)?;
    let theirs: Vec<WireCount> = wire::decode(wire::KIND_COUNT, &recv_count)?;
    let n = theirs.first().map_or(0, WireCount::get);

    let send = wire::encode(kind, records);
    let mut recv = vec![0u8; wire::message_len::<T>(n)];
    comm.exchange(peer, tag, &send, &mut recv)?;
    wire::decode(kind, &recv)
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Serial runs: one rank, no processor patches.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- ThreadComm: ranks as threads of one process ---
type Key = (u64, usize, usize, u16); // (group, src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);
static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// How long a receive waits before reporting the peer as gone.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// In-process ranks, one per thread, sharing a mailbox.
///
/// Each [`ThreadComm::world`] call opens a separate group, so concurrent
/// worlds never see each other's messages. Messages between the same pair of
/// ranks with the same tag are delivered in send order.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    group: u64,
    rank: usize,
    size: usize,
}

impl ThreadComm {
    /// One communicator per rank of a new world of `size` ranks.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        (0..size).map(|rank| ThreadComm { group, rank, size }).collect()
    }
}

pub struct LocalHandle {
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let start = Instant::now();
        loop {
            if let Some(mut queue) = MAILBOX.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            if start.elapsed() > RECV_TIMEOUT {
                log::warn!("receive {:?} timed out", self.key);
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.group, self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            key: (self.group, peer, self.rank, tag),
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::collective::SystemOperation;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// Ranks of an MPI communicator.
    ///
    /// Point-to-point calls complete eagerly; the symmetric
    /// [`Communicator::exchange`] uses a combined send-receive so two ranks
    /// never both block in a receive.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    pub struct MpiHandle(Option<Vec<u8>>);

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, i32::from(tag));
            MpiHandle(None)
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let mut data = vec![0u8; buf.len()];
            self.world
                .process_at_rank(peer as i32)
                .receive_into_with_tag(&mut data[..], i32::from(tag));
            MpiHandle(Some(data))
        }

        fn exchange(
            &self,
            peer: usize,
            tag: u16,
            send: &[u8],
            recv: &mut [u8],
        ) -> Result<(), MeshError> {
            let process = self.world.process_at_rank(peer as i32);
            mpi::point_to_point::send_receive_into_with_tags(
                send,
                &process,
                i32::from(tag),
                recv,
                &process,
                i32::from(tag),
            );
            Ok(())
        }

        fn any(&self, flag: bool) -> Result<bool, MeshError> {
            let local = i32::from(flag);
            let mut global = 0i32;
            self.world
                .all_reduce_into(&local, &mut global, SystemOperation::max());
            Ok(global != 0)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn no_comm_is_a_single_rank() {
        let comm = NoComm;
        assert_eq!(comm.size(), 1);
        assert!(comm.any(true).unwrap());
        assert!(!comm.any(false).unwrap());
    }

    #[test]
    #[serial]
    fn thread_exchange_two_ranks() {
        let mut world = ThreadComm::world(2);
        let comm1 = world.pop().unwrap();
        let comm0 = world.pop().unwrap();

        let t = std::thread::spawn(move || {
            let mut recv = [0u8; 4];
            comm1.exchange(0, 7, &[5, 6, 7, 8], &mut recv).unwrap();
            recv
        });
        let mut recv = [0u8; 4];
        comm0.exchange(1, 7, &[1, 2, 3, 4], &mut recv).unwrap();
        assert_eq!(recv, [5, 6, 7, 8]);
        assert_eq!(t.join().unwrap(), [1, 2, 3, 4]);
    }

    #[test]
    #[serial]
    fn thread_reduction_is_global() {
        let world = ThreadComm::world(3);
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| std::thread::spawn(move || comm.any(comm.rank() == 2).unwrap()))
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    #[serial]
    fn record_lists_of_different_lengths() {
        use crate::algs::wire::{WirePoint, KIND_POINTS};
        let mut world = ThreadComm::world(2);
        let comm1 = world.pop().unwrap();
        let comm0 = world.pop().unwrap();

        let t = std::thread::spawn(move || {
            exchange_records(&comm1, 0, 9, KIND_POINTS, &[WirePoint::new(7)]).unwrap()
        });
        let mine = [WirePoint::new(1), WirePoint::new(2), WirePoint::new(3)];
        let theirs = exchange_records(&comm0, 1, 9, KIND_POINTS, &mine).unwrap();
        assert_eq!(theirs, vec![WirePoint::new(7)]);
        assert_eq!(t.join().unwrap(), mine.to_vec());
    }

    #[test]
    #[serial]
    fn same_tag_messages_arrive_in_order() {
        let mut world = ThreadComm::world(2);
        let comm1 = world.pop().unwrap();
        let comm0 = world.pop().unwrap();
        comm0.isend(1, 3, &[1]);
        comm0.isend(1, 3, &[2]);
        assert_eq!(comm1.irecv(0, 3, &mut [0u8; 1]).wait(), Some(vec![1]));
        assert_eq!(comm1.irecv(0, 3, &mut [0u8; 1]).wait(), Some(vec![2]));
    }
}
