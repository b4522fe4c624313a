//! Subset rearranger: compute task `c` feeds IO task `c % num_io`.
//!
//! Each IO task holds exactly the distinct offsets its compute tasks map,
//! sorted; its regions are the runs of consecutive offsets, cut at the end
//! of every row of the fastest dimension.

use itertools::Itertools;

use crate::comm::wire::{WireOffset, cast_slice, vec_from_bytes};
use crate::comm::{Comm, Communicator};
use crate::iosystem::UnionLayout;
use crate::pio_error::PioError;

use super::{Plan, RecvPlan, Region, SendPlan, unravel};

/// IO rank that serves compute rank `comp_rank`.
pub fn subset_target(comp_rank: usize, num_io: usize) -> usize {
    comp_rank % num_io.max(1)
}

/// Regions covering the sorted, distinct 0-based `offsets`.
pub fn coalesce(offsets: &[u64], dims: &[usize]) -> Vec<Region> {
    let row = dims.last().copied().unwrap_or(1) as u64;
    let mut regions = Vec::new();
    let mut i = 0;
    while i < offsets.len() {
        let first = offsets[i];
        let mut j = i + 1;
        while j < offsets.len() && offsets[j] == offsets[j - 1] + 1 && offsets[j] % row != 0 {
            j += 1;
        }
        let mut count = vec![1; dims.len()];
        if let Some(last) = count.last_mut() {
            *last = j - i;
        }
        regions.push(Region::new(unravel(first as usize, dims), count, i));
        i = j;
    }
    regions
}

fn io_union_rank(layout: &UnionLayout, io: usize) -> Result<usize, PioError> {
    layout
        .io_to_union(io)
        .ok_or_else(|| PioError::Internal(format!("IO rank {io} has no union rank")))
}

/// Union ranks of the compute tasks feeding IO rank `io`, in compute rank
/// order.
pub(crate) fn served_by(layout: &UnionLayout, io: usize) -> Result<Vec<usize>, PioError> {
    (0..layout.num_comp())
        .filter(|&c| subset_target(c, layout.num_io()) == io)
        .map(|c| {
            layout
                .comp_to_union(c)
                .ok_or_else(|| PioError::Internal(format!("compute rank {c} has no union rank")))
        })
        .collect()
}

/// Compute the Subset pattern. Each compute task sends one message to the
/// IO task serving it; nothing travels between other pairs.
pub(crate) fn plan<C: Communicator>(
    union: &Comm<C>,
    layout: &UnionLayout,
    dims: &[usize],
    map: &[u64],
) -> Result<Plan, PioError> {
    let me = union.rank();
    let num_io = layout.num_io();

    // exactly one message per compute task, possibly empty
    let mut send = SendPlan::default();
    let mut outgoing: Vec<(usize, Vec<WireOffset>)> = Vec::new();
    if let Some(c) = layout.union_to_comp(me) {
        let dest = io_union_rank(layout, subset_target(c, num_io))?;
        let (idx, offs): (Vec<usize>, Vec<WireOffset>) = map
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m != 0)
            .map(|(i, &m)| (i, WireOffset::of(m - 1)))
            .unzip();
        if !idx.is_empty() {
            send.targets.push((dest, idx));
        }
        outgoing.push((dest, offs));
    }
    let sources = match layout.union_to_io(me) {
        Some(io) => served_by(layout, io)?,
        None => Vec::new(),
    };
    let bufs: Vec<(usize, &[u8])> = outgoing.iter().map(|(d, v)| (*d, cast_slice(v.as_slice()))).collect();
    let incoming = union.exchange(&bufs, &sources)?;

    let mut recv = RecvPlan::default();
    let mut regions = Vec::new();
    let mut llen = 0;
    if layout.union_to_io(me).is_some() {
        let received: Vec<(usize, Vec<u64>)> = sources
            .iter()
            .zip(&incoming)
            .map(|(&src, bytes)| {
                let offs: Vec<WireOffset> = vec_from_bytes(bytes)?;
                Ok((src, offs.iter().map(WireOffset::get).collect()))
            })
            .collect::<Result<_, PioError>>()?;
        let unique: Vec<u64> = received
            .iter()
            .flat_map(|(_, offs)| offs.iter().copied())
            .sorted_unstable()
            .dedup()
            .collect();
        for (src, offs) in received.into_iter().filter(|(_, o)| !o.is_empty()) {
            let positions = offs
                .iter()
                .map(|o| {
                    unique
                        .binary_search(o)
                        .map_err(|_| PioError::Internal(format!("offset {o} lost while merging")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            recv.sources.push((src, positions));
        }
        regions = coalesce(&unique, dims);
        llen = unique.len();
    }

    Ok(Plan {
        num_aiotasks: num_io,
        regions,
        llen,
        filled: llen,
        send,
        recv,
        local_err: None,
    })
}
