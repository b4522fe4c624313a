use std::collections::BTreeMap;

use crate::comm::{Comm, Communicator, InterComm};
use crate::error_policy::{self, ErrorHandling};
use crate::iosystem::{IoSystem, MsgInfo, Topology, UnionLayout};
use crate::pio_error::PioError;
use crate::registry::Pio;
use crate::types::{IoSysId, Rearranger};

use super::{INTERCOMM_TAG, check_components};

/// Peer rank and size of the group whose rank 0 is this process, or
/// `(-1, 0)`; reduced with an element-wise max over the peer channel.
fn discover_leader<C: Communicator>(peer: &Comm<C>, group: Option<&Comm<C>>) -> Result<(usize, usize), PioError> {
    let mine: [i64; 2] = match group {
        Some(g) if g.rank() == 0 => [peer.rank() as i64, g.size() as i64],
        _ => [-1, 0],
    };
    let [leader, size] = peer.allreduce(mine, |a, b| [a[0].max(b[0]), a[1].max(b[1])])?;
    if leader < 0 {
        return Err(PioError::invalid("group has no member in the peer channel"));
    }
    Ok((leader as usize, size as usize))
}

impl<C: Communicator> Pio<C> {
    /// Build one IOSystem per compute channel in `comp_comms` around the
    /// existing IO channel. Collective over `peer`, which must contain every
    /// compute and IO task.
    ///
    /// `comp_comms[k]` is `Some` on the members of component `k`; `io_comm`
    /// is `Some` on IO tasks. IO tasks serve requests and return once every
    /// component has been finalized.
    pub fn init_intercomm(
        &mut self,
        peer: &Comm<C>,
        comp_comms: &[Option<Comm<C>>],
        io_comm: Option<&Comm<C>>,
        rearranger: Rearranger,
    ) -> Result<Vec<IoSysId>, PioError> {
        let checked = check_components(comp_comms.len()).and_then(|_| {
            let memberships = comp_comms.iter().filter(|c| c.is_some()).count() + io_comm.is_some() as usize;
            if memberships > 1 {
                Err(PioError::invalid("a task may belong to only one compute or IO channel"))
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            return self.policy(None, Err(e));
        }
        let r = self.build_intercomm(peer, comp_comms, io_comm, rearranger);
        error_policy::apply(ErrorHandling::Internal, self.world(), r)
    }

    fn build_intercomm(
        &mut self,
        peer: &Comm<C>,
        comp_comms: &[Option<Comm<C>>],
        io_comm: Option<&Comm<C>>,
        rearranger: Rearranger,
    ) -> Result<Vec<IoSysId>, PioError> {
        let components = comp_comms.len();
        let (io_leader, num_io) = discover_leader(peer, io_comm)?;
        let first_id = self.take_iosysids(Some(peer), components)?;
        let io = io_comm.map(Comm::dup).transpose()?;

        let mut ids = Vec::with_capacity(components);
        for (k, comp_comm) in comp_comms.iter().enumerate() {
            let (comp_leader, num_comp) = discover_leader(peer, comp_comm.as_ref())?;
            let comp = comp_comm.as_ref().map(Comm::dup).transpose()?;
            let tag = INTERCOMM_TAG + k as u16;
            let (union_comm, intercomm) = match (&io, &comp) {
                (Some(io), _) => {
                    let inter = InterComm::create(io, 0, peer, comp_leader, tag)?;
                    (Some(inter.merge(true)?), Some(inter))
                }
                (None, Some(comp)) => {
                    let inter = InterComm::create(comp, 0, peer, io_leader, tag)?;
                    (Some(inter.merge(false)?), Some(inter))
                }
                (None, None) => (None, None),
            };
            if let Some(u) = &union_comm {
                if u.size() != num_comp + num_io {
                    return Err(PioError::Internal(format!(
                        "merged channel has {} tasks, expected {}",
                        u.size(),
                        num_comp + num_io
                    )));
                }
            }
            let id = first_id + k as IoSysId;
            log::debug!(
                "rank {}: intercomm iosystem {id} (component {k}), {num_comp} compute / {num_io} io",
                peer.world_rank()
            );
            let ios = IoSystem {
                id,
                topology: Topology::PreSplit { component: k, components },
                is_compute: comp.is_some(),
                is_io: io.is_some(),
                comp_comm: comp,
                io_comm: io.clone(),
                union_comm,
                intercomm,
                layout: UnionLayout::io_high(num_comp, num_io),
                default_rearranger: rearranger,
                error_handling: self.default_error_handling(),
                msg: MsgInfo::default(),
                hints: BTreeMap::new(),
            };
            self.register_iosystem(ios);
            ids.push(id);
        }

        if let Some(io) = &io {
            let service = io.dup()?;
            self.serve(&service, &ids)?;
        }
        Ok(ids)
    }
}
