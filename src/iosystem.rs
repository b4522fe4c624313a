//! The IOSystem record: roles, channels, ranks and policy of one
//! compute/IO configuration.

use std::collections::BTreeMap;

use crate::comm::{Comm, Communicator, InterComm};
use crate::error_policy::ErrorHandling;
use crate::pio_error::PioError;
use crate::types::{IoSysId, Rearranger};

/// First sequence number of async requests.
pub const MSG_START_SEQ_NUM: u64 = 1024;

/// How an IOSystem was built; fixed at construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// IO tasks are a strided subset of the compute tasks.
    Shared { stride: usize, base: usize },
    /// Disjoint IO tasks serving `components` compute groups, carved out of
    /// one world channel.
    DisjointAsync { component: usize, components: usize },
    /// Disjoint IO tasks built from pre-existing compute and IO channels.
    PreSplit { component: usize, components: usize },
}

impl Topology {
    pub fn is_async(&self) -> bool {
        !matches!(self, Topology::Shared { .. })
    }

    /// Component index carried in async requests.
    pub fn component(&self) -> usize {
        match *self {
            Topology::Shared { .. } => 0,
            Topology::DisjointAsync { component, .. } | Topology::PreSplit { component, .. } => component,
        }
    }
}

/// Where compute and IO tasks sit inside the union channel.
///
/// Pure value: built once per IOSystem and identical on every member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnionLayout {
    comp: Vec<usize>,
    io: Vec<usize>,
    num_union: usize,
}

impl UnionLayout {
    /// Every union rank computes; `io_ranks` (in IO-rank order) also serve IO.
    pub fn shared(num_tasks: usize, io_ranks: Vec<usize>) -> Self {
        Self {
            comp: (0..num_tasks).collect(),
            io: io_ranks,
            num_union: num_tasks,
        }
    }

    /// Compute ranks first, IO ranks after them.
    pub fn io_high(num_comp: usize, num_io: usize) -> Self {
        Self {
            comp: (0..num_comp).collect(),
            io: (num_comp..num_comp + num_io).collect(),
            num_union: num_comp + num_io,
        }
    }

    pub fn num_comp(&self) -> usize {
        self.comp.len()
    }

    pub fn num_io(&self) -> usize {
        self.io.len()
    }

    pub fn num_union(&self) -> usize {
        self.num_union
    }

    /// Union ranks of the IO tasks, indexed by IO rank.
    pub fn io_union_ranks(&self) -> &[usize] {
        &self.io
    }

    pub fn comp_union_ranks(&self) -> &[usize] {
        &self.comp
    }

    pub fn io_root(&self) -> usize {
        self.io.first().copied().unwrap_or(0)
    }

    pub fn comp_root(&self) -> usize {
        self.comp.first().copied().unwrap_or(0)
    }

    pub fn io_to_union(&self, io_rank: usize) -> Option<usize> {
        self.io.get(io_rank).copied()
    }

    pub fn comp_to_union(&self, comp_rank: usize) -> Option<usize> {
        self.comp.get(comp_rank).copied()
    }

    pub fn union_to_io(&self, union_rank: usize) -> Option<usize> {
        self.io.iter().position(|&u| u == union_rank)
    }

    pub fn union_to_comp(&self, union_rank: usize) -> Option<usize> {
        self.comp.iter().position(|&u| u == union_rank)
    }
}

/// Sequence bookkeeping of async requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MsgInfo {
    pub seq_num: u64,
    pub prev_tag: u16,
}

impl Default for MsgInfo {
    fn default() -> Self {
        Self {
            seq_num: MSG_START_SEQ_NUM,
            prev_tag: 0,
        }
    }
}

pub struct IoSystem<C: Communicator> {
    pub(crate) id: IoSysId,
    pub(crate) topology: Topology,
    pub(crate) is_compute: bool,
    pub(crate) is_io: bool,
    pub(crate) comp_comm: Option<Comm<C>>,
    pub(crate) io_comm: Option<Comm<C>>,
    pub(crate) union_comm: Option<Comm<C>>,
    pub(crate) intercomm: Option<InterComm<C>>,
    pub(crate) layout: UnionLayout,
    pub(crate) default_rearranger: Rearranger,
    pub(crate) error_handling: ErrorHandling,
    pub(crate) msg: MsgInfo,
    pub(crate) hints: BTreeMap<String, String>,
}

impl<C: Communicator> std::fmt::Debug for IoSystem<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem")
            .field("id", &self.id)
            .field("topology", &self.topology)
            .field("is_compute", &self.is_compute)
            .field("is_io", &self.is_io)
            .field("layout", &self.layout)
            .field("error_handling", &self.error_handling)
            .finish()
    }
}

impl<C: Communicator> IoSystem<C> {
    pub fn id(&self) -> IoSysId {
        self.id
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn is_async(&self) -> bool {
        self.topology.is_async()
    }

    pub fn is_compute_proc(&self) -> bool {
        self.is_compute
    }

    pub fn is_io_proc(&self) -> bool {
        self.is_io
    }

    /// Does this process belong to the IOSystem at all?
    pub fn is_active(&self) -> bool {
        self.union_comm.is_some()
    }

    pub fn layout(&self) -> &UnionLayout {
        &self.layout
    }

    /// IO root as a union rank.
    pub fn io_root(&self) -> usize {
        self.layout.io_root()
    }

    /// Compute root as a union rank.
    pub fn comp_root(&self) -> usize {
        self.layout.comp_root()
    }

    pub fn num_comp_tasks(&self) -> usize {
        self.layout.num_comp()
    }

    pub fn num_io_tasks(&self) -> usize {
        self.layout.num_io()
    }

    pub fn num_union_tasks(&self) -> usize {
        self.layout.num_union()
    }

    pub fn comp_rank(&self) -> Option<usize> {
        self.comp_comm.as_ref().map(Comm::rank)
    }

    pub fn io_rank(&self) -> Option<usize> {
        self.io_comm.as_ref().map(Comm::rank)
    }

    pub fn union_rank(&self) -> Option<usize> {
        self.union_comm.as_ref().map(Comm::rank)
    }

    pub fn default_rearranger(&self) -> Rearranger {
        self.default_rearranger
    }

    pub fn error_handling(&self) -> ErrorHandling {
        self.error_handling
    }

    pub fn msg_info(&self) -> MsgInfo {
        self.msg
    }

    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }

    pub fn comp_comm(&self) -> Option<&Comm<C>> {
        self.comp_comm.as_ref()
    }

    pub fn io_comm(&self) -> Option<&Comm<C>> {
        self.io_comm.as_ref()
    }

    pub fn union_comm(&self) -> Option<&Comm<C>> {
        self.union_comm.as_ref()
    }

    pub fn intercomm(&self) -> Option<&InterComm<C>> {
        self.intercomm.as_ref()
    }

    pub(crate) fn union(&self) -> Result<&Comm<C>, PioError> {
        self.union_comm.as_ref().ok_or_else(|| {
            PioError::invalid(format!("process is not a member of iosystem {}", self.id))
        })
    }

    /// Next request header fields; advances the sequence.
    pub(crate) fn next_msg(&mut self, tag: u16) -> MsgInfo {
        let current = self.msg;
        self.msg = MsgInfo {
            seq_num: current.seq_num + 1,
            prev_tag: tag,
        };
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_high_layout_renumbers() {
        let l = UnionLayout::io_high(6, 2);
        assert_eq!(l.comp_root(), 0);
        assert_eq!(l.io_root(), 6);
        assert_eq!(l.io_to_union(1), Some(7));
        assert_eq!(l.union_to_io(6), Some(0));
        assert_eq!(l.union_to_comp(6), None);
        assert_eq!(l.num_union(), 8);
    }

    #[test]
    fn shared_layout_overlaps() {
        let l = UnionLayout::shared(8, vec![0, 4]);
        assert_eq!(l.io_root(), 0);
        assert_eq!(l.union_to_io(4), Some(1));
        assert_eq!(l.union_to_comp(4), Some(4));
        assert_eq!(l.num_union(), 8);
    }

    #[test]
    fn topology_variants() {
        assert!(!Topology::Shared { stride: 1, base: 0 }.is_async());
        let t = Topology::PreSplit { component: 2, components: 3 };
        assert!(t.is_async());
        assert_eq!(t.component(), 2);
    }
}
