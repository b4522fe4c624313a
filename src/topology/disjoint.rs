use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::comm::{Comm, Communicator, InterComm};
use crate::error_policy::{self, ErrorHandling};
use crate::iosystem::{IoSystem, MsgInfo, Topology, UnionLayout};
use crate::pio_error::PioError;
use crate::registry::Pio;
use crate::types::{IoSysId, Rearranger};

use super::{INTERCOMM_TAG, check_components, check_disjoint};

/// Who does what in an async topology. Ranks are ranks of the world channel
/// handed to [`Pio::init_async`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncLayout {
    pub num_io_procs: usize,
    /// IO ranks; defaults to `0..num_io_procs`.
    pub io_proc_list: Option<Vec<usize>>,
    /// Compute task count of every component.
    pub comp_sizes: Vec<usize>,
    /// Compute ranks of every component; defaults to consecutive blocks of
    /// the ranks left after the IO ranks, in component order.
    pub comp_proc_lists: Option<Vec<Vec<usize>>>,
    pub rearranger: Rearranger,
}

impl AsyncLayout {
    /// `num_io_procs` IO tasks first, then one block per entry of
    /// `comp_sizes`.
    pub fn contiguous(num_io_procs: usize, comp_sizes: Vec<usize>, rearranger: Rearranger) -> Self {
        Self {
            num_io_procs,
            io_proc_list: None,
            comp_sizes,
            comp_proc_lists: None,
            rearranger,
        }
    }

    /// Concrete IO ranks and per-component compute ranks for a world of
    /// `size` tasks.
    pub fn resolve(&self, size: usize) -> Result<(Vec<usize>, Vec<Vec<usize>>), PioError> {
        check_components(self.comp_sizes.len())?;
        if self.num_io_procs == 0 {
            return Err(PioError::invalid("async topology needs at least one IO task"));
        }
        if let Some(k) = self.comp_sizes.iter().position(|&n| n == 0) {
            return Err(PioError::invalid(format!("component {k} has no compute tasks")));
        }
        let needed = self.num_io_procs + self.comp_sizes.iter().sum::<usize>();
        if needed > size {
            return Err(PioError::invalid(format!(
                "layout needs {needed} tasks, world has {size}"
            )));
        }

        let io = match &self.io_proc_list {
            Some(list) if list.len() != self.num_io_procs => {
                return Err(PioError::invalid(format!(
                    "{} IO ranks listed for {} IO tasks",
                    list.len(),
                    self.num_io_procs
                )));
            }
            Some(list) => list.clone(),
            None => (0..self.num_io_procs).collect(),
        };

        let comps = match &self.comp_proc_lists {
            Some(lists) => {
                if lists.len() != self.comp_sizes.len() {
                    return Err(PioError::invalid(format!(
                        "{} compute rank lists for {} components",
                        lists.len(),
                        self.comp_sizes.len()
                    )));
                }
                for (k, (list, &n)) in lists.iter().zip(&self.comp_sizes).enumerate() {
                    if list.len() != n {
                        return Err(PioError::invalid(format!(
                            "component {k} lists {} ranks, expected {n}",
                            list.len()
                        )));
                    }
                }
                lists.clone()
            }
            None => {
                let mut free = (0..size).filter(|r| !io.contains(r));
                self.comp_sizes
                    .iter()
                    .map(|&n| free.by_ref().take(n).collect())
                    .collect()
            }
        };

        let mut lists: Vec<&[usize]> = vec![io.as_slice()];
        lists.extend(comps.iter().map(Vec::as_slice));
        check_disjoint(size, &lists)?;
        Ok((io, comps))
    }
}

impl<C: Communicator> Pio<C> {
    /// Build one IOSystem per compute component with a dedicated IO pool.
    /// Collective over `world`.
    ///
    /// Compute tasks return the ids right away. IO tasks serve requests and
    /// return only after every component has been finalized.
    pub fn init_async(&mut self, world: &Comm<C>, layout: &AsyncLayout) -> Result<Vec<IoSysId>, PioError> {
        let (io_list, comp_lists) = match layout.resolve(world.size()) {
            Ok(v) => v,
            Err(e) => return self.policy(None, Err(e)),
        };
        let r = self.build_async(world, &io_list, &comp_lists, layout.rearranger);
        error_policy::apply(ErrorHandling::Internal, self.world(), r)
    }

    fn build_async(
        &mut self,
        world: &Comm<C>,
        io_list: &[usize],
        comp_lists: &[Vec<usize>],
        rearranger: Rearranger,
    ) -> Result<Vec<IoSysId>, PioError> {
        let components = comp_lists.len();
        let io_comm = world.create_from_ranks(io_list)?;
        let is_io = io_comm.is_some();
        let first_id = self.take_iosysids(Some(world), components)?;

        let mut ids = Vec::with_capacity(components);
        for (k, comp_list) in comp_lists.iter().enumerate() {
            let comp_comm = world.create_from_ranks(comp_list)?;
            let (union_comm, intercomm) = match (&io_comm, &comp_comm) {
                (Some(io), _) => {
                    let inter = InterComm::create(io, 0, world, comp_list[0], INTERCOMM_TAG + k as u16)?;
                    (Some(inter.merge(true)?), Some(inter))
                }
                (None, Some(comp)) => {
                    let inter = InterComm::create(comp, 0, world, io_list[0], INTERCOMM_TAG + k as u16)?;
                    (Some(inter.merge(false)?), Some(inter))
                }
                (None, None) => (None, None),
            };
            let id = first_id + k as IoSysId;
            log::debug!(
                "rank {}: async iosystem {id} (component {k}), io {is_io}, compute {}",
                world.world_rank(),
                comp_comm.is_some()
            );
            let ios = IoSystem {
                id,
                topology: Topology::DisjointAsync { component: k, components },
                is_compute: comp_comm.is_some(),
                is_io,
                comp_comm,
                io_comm: io_comm.clone(),
                union_comm,
                intercomm,
                layout: UnionLayout::io_high(comp_list.len(), io_list.len()),
                default_rearranger: rearranger,
                error_handling: self.default_error_handling(),
                msg: MsgInfo::default(),
                hints: BTreeMap::new(),
            };
            self.register_iosystem(ios);
            ids.push(id);
        }

        if let Some(io) = &io_comm {
            let service = io.dup()?;
            self.serve(&service, &ids)?;
        }
        Ok(ids)
    }
}
