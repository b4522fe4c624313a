//! Channels between two disjoint groups, and their merge into one group.

use std::sync::Arc;

use super::communicator::Communicator;
use super::group::Group;
use super::intracomm::{Comm, TAG_INTER_MERGE};
use super::wire::{WireCount, WireHandshake, read_one, vec_from_bytes};
use crate::pio_error::PioError;

/// Inter-group channel.
///
/// Reserves two contexts: `context` for traffic between the groups and
/// `context + 1` for the channel produced by [`InterComm::merge`].
pub struct InterComm<C: Communicator> {
    local: Comm<C>,
    remote: Group,
    context: u32,
    local_leader: usize,
    remote_leader_world: usize,
}

impl<C: Communicator> Clone for InterComm<C> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            remote: self.remote.clone(),
            context: self.context,
            local_leader: self.local_leader,
            remote_leader_world: self.remote_leader_world,
        }
    }
}

impl<C: Communicator> std::fmt::Debug for InterComm<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterComm")
            .field("context", &self.context)
            .field("local_size", &self.local.size())
            .field("remote_size", &self.remote.size())
            .finish()
    }
}

impl<C: Communicator> InterComm<C> {
    /// Build the channel. Collective over `local`; the two leaders
    /// additionally talk over `peer` using `tag`.
    ///
    /// `local_leader` is a rank of `local`, `remote_leader` a rank of `peer`.
    pub fn create(
        local: &Comm<C>,
        local_leader: usize,
        peer: &Comm<C>,
        remote_leader: usize,
        tag: u16,
    ) -> Result<Self, PioError> {
        if local_leader >= local.size() {
            return Err(PioError::invalid(format!(
                "local leader {local_leader} outside group of {}",
                local.size()
            )));
        }
        let local_max = local.agree_context(0)?;

        let mut summary: Vec<WireCount> = Vec::new();
        if local.rank() == local_leader {
            let hs = WireHandshake::new(local_max, false, local.size());
            peer.send_pod(remote_leader, tag, &[hs])?;
            peer.send_pod(remote_leader, tag, &Comm::<C>::encode_ranks(local.group().world_ranks()))?;
            let theirs: WireHandshake = read_one(&peer.recv(remote_leader, tag)?)?;
            let ranks: Vec<WireCount> = vec_from_bytes(&peer.recv(remote_leader, tag)?)?;
            if ranks.len() != theirs.group_len() {
                return Err(PioError::Internal(format!(
                    "peer announced {} ranks, sent {}",
                    theirs.group_len(),
                    ranks.len()
                )));
            }
            let context = local_max.max(theirs.context());
            let leader_world = peer
                .group()
                .world_rank(remote_leader)
                .ok_or_else(|| PioError::invalid(format!("remote leader {remote_leader} outside peer channel")))?;
            summary.push(WireCount::new(context as usize));
            summary.push(WireCount::new(leader_world));
            summary.extend(ranks);
        }
        let summary = local.bcast_vec(local_leader, &summary)?;
        if summary.len() < 2 {
            return Err(PioError::Internal("truncated inter-channel summary".into()));
        }
        let context = summary[0].get() as u32;
        let remote_leader_world = summary[1].get();
        let remote = Group::from_world_ranks(&Comm::<C>::decode_ranks(&summary[2..]))?;
        if !remote.is_disjoint(local.group()) {
            return Err(PioError::invalid("inter-channel groups overlap"));
        }
        local.world_endpoint().reserve_contexts(context, 2);
        log::debug!(
            "rank {}: inter-channel context {context}, {} local / {} remote",
            local.world_rank(),
            local.size(),
            remote.size()
        );
        Ok(Self {
            local: local.clone(),
            remote,
            context,
            local_leader,
            remote_leader_world,
        })
    }

    pub fn local(&self) -> &Comm<C> {
        &self.local
    }

    pub fn remote_group(&self) -> &Group {
        &self.remote
    }

    pub fn remote_size(&self) -> usize {
        self.remote.size()
    }

    pub fn context(&self) -> u32 {
        self.context
    }

    /// Remote members as a channel view, used to address the other side.
    fn remote_view(&self) -> Result<Comm<C>, PioError> {
        // remote members first so remote ranks index directly; point-to-point only
        let mut members = self.remote.world_ranks().to_vec();
        members.push(self.local.world_rank());
        let group = Group::from_world_ranks(&members)?;
        Comm::from_parts(Arc::clone(self.local.world_endpoint()), self.context, group)
            .ok_or_else(|| PioError::Internal("inter-channel view lost the caller".into()))
    }

    /// Send to rank `dst` of the remote group.
    pub fn send(&self, dst: usize, tag: u16, buf: &[u8]) -> Result<(), PioError> {
        self.remote_view()?.send(dst, tag, buf)
    }

    /// Receive from rank `src` of the remote group.
    pub fn recv(&self, src: usize, tag: u16) -> Result<Vec<u8>, PioError> {
        self.remote_view()?.recv(src, tag)
    }

    /// Merge both groups into one intra-group channel. The side passing
    /// `high = true` is ordered after the other; if both sides pass the same
    /// value, the side whose leader has the lower world rank goes first.
    /// Collective over both groups.
    pub fn merge(&self, high: bool) -> Result<Comm<C>, PioError> {
        let mut flags = [0u8; 1];
        if self.local.rank() == self.local_leader {
            let view = self.remote_view()?;
            let remote_leader = self
                .remote
                .rank_of(self.remote_leader_world)
                .ok_or_else(|| PioError::Internal("remote leader left its group".into()))?;
            view.send_raw(remote_leader, TAG_INTER_MERGE, &[high as u8])?;
            let theirs = view.recv_raw(remote_leader, TAG_INTER_MERGE)?;
            flags[0] = theirs.first().copied().unwrap_or(0);
        }
        let remote_high = self.local.bcast_bytes(self.local_leader, &flags)?
            .first()
            .copied()
            .unwrap_or(0)
            != 0;

        let local_first = if high != remote_high {
            !high
        } else {
            let leader = self
                .local
                .group()
                .world_rank(self.local_leader)
                .unwrap_or(usize::MAX);
            leader < self.remote_leader_world
        };
        let group = if local_first {
            self.local.group().union(&self.remote)
        } else {
            self.remote.union(self.local.group())
        };
        Comm::from_parts(Arc::clone(self.local.world_endpoint()), self.context + 1, group)
            .ok_or_else(|| PioError::Internal("merged channel lost the caller".into()))
    }
}
