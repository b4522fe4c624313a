//! Intra-group channels and the collectives built on [`Communicator`].
//!
//! A [`Comm`] is a context id plus a [`Group`]; every message it sends is
//! tagged with that context so traffic of distinct channels sharing a pair of
//! processes never mixes. Collectives are linear (root fan-out, gather to rank
//! 0) which is plenty for the control traffic they carry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;

use super::communicator::{CommTag, Communicator, Wait};
use super::group::Group;
use super::wire::{WireCount, cast_slice, read_one, vec_from_bytes};
use crate::pio_error::PioError;

/// Largest tag available to callers; tags above it are reserved for
/// collectives and channel construction.
pub const MAX_USER_TAG: u16 = 0xFEFF;

const TAG_BCAST: u16 = 0xFF01;
const TAG_REDUCE: u16 = 0xFF02;
const TAG_GATHER: u16 = 0xFF03;
const TAG_BARRIER: u16 = 0xFF04;
const TAG_ALLTOALL: u16 = 0xFF05;
const TAG_EXCHANGE: u16 = 0xFF06;
pub(crate) const TAG_INTER_MERGE: u16 = 0xFF11;

/// Per-process endpoint shared by every channel of that process.
pub struct World<C: Communicator> {
    transport: C,
    next_context: AtomicU32,
    loopback: Mutex<HashMap<CommTag, VecDeque<Vec<u8>>>>,
}

impl<C: Communicator> std::fmt::Debug for World<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("rank", &self.transport.rank())
            .field("size", &self.transport.size())
            .field("next_context", &self.next_context.load(Ordering::Relaxed))
            .finish()
    }
}

impl<C: Communicator> World<C> {
    pub fn new(transport: C) -> Arc<Self> {
        Arc::new(Self {
            transport,
            // context 0 belongs to the world channel
            next_context: AtomicU32::new(1),
            loopback: Mutex::new(HashMap::new()),
        })
    }

    pub fn transport(&self) -> &C {
        &self.transport
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Terminate the whole job.
    pub fn abort(&self, code: i32) -> ! {
        self.transport.abort(code)
    }

    fn send(&self, dst: usize, tag: CommTag, buf: &[u8]) -> Result<(), PioError> {
        if dst >= self.size() {
            return Err(PioError::comm(dst, "destination outside world"));
        }
        if dst == self.rank() {
            self.loopback
                .lock()
                .entry(tag)
                .or_default()
                .push_back(buf.to_vec());
            return Ok(());
        }
        let _ = self.transport.isend(dst, tag, buf).wait();
        Ok(())
    }

    fn recv(&self, src: usize, tag: CommTag) -> Result<Vec<u8>, PioError> {
        if src >= self.size() {
            return Err(PioError::comm(src, "source outside world"));
        }
        if src == self.rank() {
            return self
                .loopback
                .lock()
                .get_mut(&tag)
                .and_then(|q| q.pop_front())
                .ok_or_else(|| PioError::comm(src, format!("no pending self message on {tag:?}")));
        }
        self.transport
            .irecv(src, tag)
            .wait()
            .ok_or_else(|| PioError::comm(src, "receive completed without data"))
    }

    fn probe(&self, src: usize, tag: CommTag) -> bool {
        if src == self.rank() {
            return self
                .loopback
                .lock()
                .get(&tag)
                .is_some_and(|q| !q.is_empty());
        }
        src < self.size() && self.transport.iprobe(src, tag)
    }

    pub(crate) fn next_context(&self) -> u32 {
        self.next_context.load(Ordering::SeqCst)
    }

    /// Mark contexts `agreed .. agreed + width` as taken on this process.
    pub(crate) fn reserve_contexts(&self, agreed: u32, width: u32) {
        self.next_context
            .fetch_max(agreed.saturating_add(width), Ordering::SeqCst);
    }
}

/// Intra-group channel.
pub struct Comm<C: Communicator> {
    world: Arc<World<C>>,
    context: u32,
    group: Group,
    rank: usize,
}

impl<C: Communicator> Clone for Comm<C> {
    fn clone(&self) -> Self {
        Self {
            world: Arc::clone(&self.world),
            context: self.context,
            group: self.group.clone(),
            rank: self.rank,
        }
    }
}

impl<C: Communicator> std::fmt::Debug for Comm<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.group.size())
            .finish()
    }
}

impl<C: Communicator> Comm<C> {
    /// Channel spanning every process of `transport`.
    pub fn world(transport: C) -> Self {
        let world = World::new(transport);
        let group = Group::world(world.size());
        let rank = world.rank();
        Self {
            world,
            context: 0,
            group,
            rank,
        }
    }

    pub(crate) fn from_parts(world: Arc<World<C>>, context: u32, group: Group) -> Option<Self> {
        let rank = group.rank_of(world.rank())?;
        Some(Self {
            world,
            context,
            group,
            rank,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.group.size()
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    pub fn world_endpoint(&self) -> &Arc<World<C>> {
        &self.world
    }

    pub fn world_rank(&self) -> usize {
        self.world.rank()
    }

    pub fn abort(&self, code: i32) -> ! {
        self.world.abort(code)
    }

    fn world_of(&self, rank: usize) -> Result<usize, PioError> {
        self.group
            .world_rank(rank)
            .ok_or_else(|| PioError::invalid(format!("rank {rank} outside channel of {}", self.size())))
    }

    pub(crate) fn send_raw(&self, dst: usize, tag: u16, buf: &[u8]) -> Result<(), PioError> {
        let w = self.world_of(dst)?;
        self.world
            .send(w, CommTag::with_context(self.context, tag), buf)
    }

    pub(crate) fn recv_raw(&self, src: usize, tag: u16) -> Result<Vec<u8>, PioError> {
        let w = self.world_of(src)?;
        self.world.recv(w, CommTag::with_context(self.context, tag))
    }

    fn check_tag(tag: u16) -> Result<(), PioError> {
        if tag > MAX_USER_TAG {
            return Err(PioError::invalid(format!("tag {tag:#x} is reserved")));
        }
        Ok(())
    }

    /// Point-to-point send; never blocks.
    pub fn send(&self, dst: usize, tag: u16, buf: &[u8]) -> Result<(), PioError> {
        Self::check_tag(tag)?;
        self.send_raw(dst, tag, buf)
    }

    /// Blocking receive of the next message from `src` with `tag`.
    pub fn recv(&self, src: usize, tag: u16) -> Result<Vec<u8>, PioError> {
        Self::check_tag(tag)?;
        self.recv_raw(src, tag)
    }

    /// Is a message from `src` with `tag` waiting?
    pub fn probe(&self, src: usize, tag: u16) -> bool {
        match self.group.world_rank(src) {
            Some(w) => self.world.probe(w, CommTag::with_context(self.context, tag)),
            None => false,
        }
    }

    pub fn send_pod<T: Pod>(&self, dst: usize, tag: u16, data: &[T]) -> Result<(), PioError> {
        self.send(dst, tag, cast_slice(data))
    }

    pub fn recv_pod<T: Pod>(&self, src: usize, tag: u16) -> Result<Vec<T>, PioError> {
        vec_from_bytes(&self.recv(src, tag)?)
    }

    // ----- collectives -----

    /// Broadcast `data` from `root`; non-roots pass anything (ignored).
    pub fn bcast_bytes(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, PioError> {
        self.world_of(root)?;
        if self.rank == root {
            for r in (0..self.size()).filter(|&r| r != root) {
                self.send_raw(r, TAG_BCAST, data)?;
            }
            Ok(data.to_vec())
        } else {
            self.recv_raw(root, TAG_BCAST)
        }
    }

    pub fn bcast_vec<T: Pod>(&self, root: usize, data: &[T]) -> Result<Vec<T>, PioError> {
        vec_from_bytes(&self.bcast_bytes(root, cast_slice(data))?)
    }

    pub fn bcast_one<T: Pod>(&self, root: usize, value: T) -> Result<T, PioError> {
        read_one(&self.bcast_bytes(root, cast_slice(&[value]))?)
    }

    /// Values of every rank, in rank order, on every rank.
    pub fn allgather<T: Pod>(&self, value: T) -> Result<Vec<T>, PioError> {
        let all = self.gather_to_zero(TAG_GATHER, value)?;
        self.bcast_vec(0, &all)
    }

    /// Fold `op` over every rank's value in rank order; everyone gets the
    /// result.
    pub fn allreduce<T, F>(&self, value: T, op: F) -> Result<T, PioError>
    where
        T: Pod,
        F: Fn(T, T) -> T,
    {
        let all = self.gather_to_zero(TAG_REDUCE, value)?;
        let folded = all.into_iter().reduce(&op).unwrap_or(value);
        self.bcast_one(0, folded)
    }

    pub fn allreduce_max_i64(&self, value: i64) -> Result<i64, PioError> {
        self.allreduce(value, i64::max)
    }

    pub fn allreduce_min_i32(&self, value: i32) -> Result<i32, PioError> {
        self.allreduce(value, i32::min)
    }

    pub fn barrier(&self) -> Result<(), PioError> {
        self.gather_to_zero(TAG_BARRIER, 0u8)?;
        self.bcast_one(0, 0u8).map(|_| ())
    }

    fn gather_to_zero<T: Pod>(&self, tag: u16, value: T) -> Result<Vec<T>, PioError> {
        if self.rank == 0 {
            let mut all = Vec::with_capacity(self.size());
            all.push(value);
            for r in 1..self.size() {
                all.push(read_one(&self.recv_raw(r, tag)?)?);
            }
            Ok(all)
        } else {
            self.send_raw(0, tag, cast_slice(&[value]))?;
            Ok(Vec::new())
        }
    }

    /// Pairwise exchange: `outgoing[r]` goes to rank `r`, the result holds
    /// what rank `r` sent here. All sends are posted before any receive, and
    /// receives complete in rank order.
    pub fn alltoallv<B: AsRef<[u8]>>(&self, outgoing: &[B]) -> Result<Vec<Vec<u8>>, PioError> {
        if outgoing.len() != self.size() {
            return Err(PioError::invalid(format!(
                "exchange needs {} buffers, got {}",
                self.size(),
                outgoing.len()
            )));
        }
        for (r, buf) in outgoing.iter().enumerate() {
            self.send_raw(r, TAG_ALLTOALL, buf.as_ref())?;
        }
        (0..self.size())
            .map(|r| self.recv_raw(r, TAG_ALLTOALL))
            .collect()
    }

    /// Sparse exchange: `outgoing[k].1` goes to rank `outgoing[k].0`, then
    /// one message is received from each rank of `sources`, in that order.
    /// Both sides must agree on who talks to whom.
    pub fn exchange<B: AsRef<[u8]>>(
        &self,
        outgoing: &[(usize, B)],
        sources: &[usize],
    ) -> Result<Vec<Vec<u8>>, PioError> {
        for (dst, buf) in outgoing {
            self.send_raw(*dst, TAG_EXCHANGE, buf.as_ref())?;
        }
        sources
            .iter()
            .map(|&src| self.recv_raw(src, TAG_EXCHANGE))
            .collect()
    }

    // ----- channel construction -----

    /// Agree on a fresh context id, reserving `width` consecutive ids on
    /// every member.
    pub(crate) fn agree_context(&self, width: u32) -> Result<u32, PioError> {
        let local = self.world.next_context();
        let agreed = self.allreduce(local, u32::max)?;
        self.world.reserve_contexts(agreed, width);
        Ok(agreed)
    }

    /// New channel over `group`, which must be a subset of this channel's
    /// members. Collective over `self`; non-members get `None`.
    pub fn create(&self, group: &Group) -> Result<Option<Comm<C>>, PioError> {
        if let Some(w) = group
            .world_ranks()
            .iter()
            .find(|w| !self.group.contains(**w))
        {
            return Err(PioError::invalid(format!(
                "world rank {w} is not a member of the parent channel"
            )));
        }
        let context = self.agree_context(1)?;
        log::trace!(
            "rank {}: context {context} for group of {}",
            self.world.rank(),
            group.size()
        );
        Ok(Comm::from_parts(Arc::clone(&self.world), context, group.clone()))
    }

    /// Channel over the members at `ranks` of this channel.
    pub fn create_from_ranks(&self, ranks: &[usize]) -> Result<Option<Comm<C>>, PioError> {
        let group = self.group.include(ranks)?;
        self.create(&group)
    }

    /// Same members, fresh context.
    pub fn dup(&self) -> Result<Comm<C>, PioError> {
        self.create(&self.group)?
            .ok_or_else(|| PioError::Internal("dup lost the calling rank".into()))
    }

    /// Encode a list of world ranks for transport.
    pub(crate) fn encode_ranks(ranks: &[usize]) -> Vec<WireCount> {
        ranks.iter().map(|&r| WireCount::new(r)).collect()
    }

    pub(crate) fn decode_ranks(counts: &[WireCount]) -> Vec<usize> {
        counts.iter().map(WireCount::get).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{LocalUniverse, NoComm};

    #[test]
    fn serial_collectives_loop_back() {
        let comm = Comm::world(NoComm);
        assert_eq!(comm.bcast_one(0, 42u32).unwrap(), 42);
        assert_eq!(comm.allreduce_max_i64(-3).unwrap(), -3);
        assert_eq!(comm.allgather(7u16).unwrap(), vec![7]);
        comm.barrier().unwrap();
        let dup = comm.dup().unwrap();
        assert_ne!(dup.context(), comm.context());
        let back = comm.alltoallv(&[vec![1u8, 2]]).unwrap();
        assert_eq!(back, vec![vec![1, 2]]);
    }

    #[test]
    fn allreduce_and_allgather_over_threads() {
        let out = LocalUniverse::run(4, |t| {
            let comm = Comm::world(t);
            let r = comm.rank() as i64;
            let max = comm.allreduce_max_i64(r * 10).unwrap();
            let all = comm.allgather(r as u32).unwrap();
            (max, all)
        });
        for (max, all) in out {
            assert_eq!(max, 30);
            assert_eq!(all, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn create_gives_members_distinct_contexts() {
        let out = LocalUniverse::run(4, |t| {
            let comm = Comm::world(t);
            let evens = comm.create_from_ranks(&[0, 2]).unwrap();
            let odds = comm.create_from_ranks(&[1, 3]).unwrap();
            let mine = evens.or(odds).unwrap();
            let sum = mine.allreduce(comm.rank() as u32, |a, b| a + b).unwrap();
            (mine.rank(), mine.context(), sum)
        });
        assert_eq!(out[0].2, 2);
        assert_eq!(out[1].2, 4);
        assert_eq!(out[2].0, 1);
        assert_ne!(out[0].1, out[1].1);
    }

    #[test]
    fn alltoallv_delivers_in_rank_order() {
        let out = LocalUniverse::run(3, |t| {
            let comm = Comm::world(t);
            let me = comm.rank() as u8;
            let bufs: Vec<Vec<u8>> = (0..3).map(|r| vec![me, r as u8]).collect();
            comm.alltoallv(&bufs).unwrap()
        });
        for (me, got) in out.iter().enumerate() {
            for (src, buf) in got.iter().enumerate() {
                assert_eq!(buf, &vec![src as u8, me as u8]);
            }
        }
    }

    #[test]
    fn exchange_only_touches_listed_peers() {
        // ranks 1..4 report to rank (r % 2), which listens to its own
        let out = LocalUniverse::run(4, |t| {
            let comm = Comm::world(t);
            let me = comm.rank();
            let outgoing = if me > 0 { vec![(me % 2, vec![me as u8])] } else { Vec::new() };
            let sources: Vec<usize> = match me {
                0 => vec![2],
                1 => vec![1, 3],
                _ => Vec::new(),
            };
            let got = comm.exchange(&outgoing, &sources).unwrap();
            // nothing else is left queued for the exchange
            let stray = (0..4).any(|r| comm.world.probe(r, CommTag::with_context(0, TAG_EXCHANGE)));
            (got, stray)
        });
        assert_eq!(out[0], (vec![vec![2]], false));
        assert_eq!(out[1], (vec![vec![1], vec![3]], false));
        assert_eq!(out[2], (Vec::<Vec<u8>>::new(), false));
    }

    #[test]
    fn reserved_tags_are_refused() {
        let comm = Comm::world(NoComm);
        assert!(comm.send(0, TAG_BCAST, b"x").is_err());
    }
}
