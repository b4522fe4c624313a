use std::collections::BTreeMap;

use crate::comm::{Comm, Communicator};
use crate::error_policy::{self, ErrorHandling};
use crate::iosystem::{IoSystem, MsgInfo, Topology, UnionLayout};
use crate::pio_error::PioError;
use crate::registry::Pio;
use crate::types::{IoSysId, Rearranger};

use super::shared_io_ranks;

impl<C: Communicator> Pio<C> {
    /// Build an IOSystem in which every task of `base_comm` computes and
    /// `num_io_tasks` of them, `stride` apart starting at rank `base`, also
    /// do IO. Collective over `base_comm`.
    pub fn init_shared(
        &mut self,
        base_comm: &Comm<C>,
        num_io_tasks: usize,
        stride: usize,
        base: usize,
        rearranger: Rearranger,
    ) -> Result<IoSysId, PioError> {
        let io_ranks = match shared_io_ranks(base_comm.size(), num_io_tasks, stride, base) {
            Ok(r) => r,
            Err(e) => return self.policy(None, Err(e)),
        };
        let r = self.build_shared(base_comm, io_ranks, stride, base, rearranger);
        error_policy::apply(ErrorHandling::Internal, self.world(), r)
    }

    fn build_shared(
        &mut self,
        base_comm: &Comm<C>,
        io_ranks: Vec<usize>,
        stride: usize,
        base: usize,
        rearranger: Rearranger,
    ) -> Result<IoSysId, PioError> {
        let union = base_comm.dup()?;
        let comp = base_comm.dup()?;
        let io = base_comm.create_from_ranks(&io_ranks)?;
        let id = self.take_iosysids(None, 1)?;
        let is_io = io.is_some();
        log::debug!(
            "rank {}: shared iosystem {id}, io ranks {io_ranks:?}, io task: {is_io}",
            base_comm.world_rank()
        );
        let ios = IoSystem {
            id,
            topology: Topology::Shared { stride, base },
            is_compute: true,
            is_io,
            comp_comm: Some(comp),
            io_comm: io,
            union_comm: Some(union),
            intercomm: None,
            layout: UnionLayout::shared(base_comm.size(), io_ranks),
            default_rearranger: rearranger,
            error_handling: self.default_error_handling(),
            msg: MsgInfo::default(),
            hints: BTreeMap::new(),
        };
        self.register_iosystem(ios);
        Ok(id)
    }
}
