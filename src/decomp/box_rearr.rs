//! Box rearranger: one hyper-rectangular region per active IO task.
//!
//! Without explicit regions the array is split greedily: the number of
//! tasks to use is the array volume over the target block size (clamped to
//! `1..=num_io`), and the split walks the dimensions from the outermost,
//! giving each as many parts as it can hold of what is left to place.
//! Within a dimension, the remainder of an uneven split goes to the last
//! parts.

use crate::comm::wire::{WireOffset, WireStatus, cast_slice, vec_from_bytes};
use crate::comm::{Comm, Communicator};
use crate::iosystem::UnionLayout;
use crate::pio_error::{PIO_NOERR, PioError};

use super::{Plan, RecvPlan, Region, SendPlan, ravel, unravel};

/// IO tasks worth using for an array of `dims` with `type_size`-byte
/// elements when each task should hold about `blocksize` bytes.
pub fn box_task_count(dims: &[usize], num_io: usize, blocksize: usize, type_size: usize) -> usize {
    let volume: usize = dims.iter().product();
    let target = (blocksize / type_size.max(1)).max(1);
    volume.div_ceil(target).clamp(1, num_io.max(1))
}

/// Parts per dimension when splitting `dims` over at most `tasks` tasks.
/// The product of the result is the number of active tasks.
pub fn box_grid(dims: &[usize], tasks: usize) -> Vec<usize> {
    let mut left = tasks.max(1);
    dims.iter()
        .map(|&d| {
            let parts = d.min(left).max(1);
            left /= parts;
            parts
        })
        .collect()
}

/// Start and count of part `p` out of `parts` along a dimension of length
/// `len`; the last `len % parts` parts are one longer.
pub fn part_start_count(len: usize, parts: usize, p: usize) -> (usize, usize) {
    let base = len / parts;
    let rem = len % parts;
    let first_long = parts - rem;
    let start = p * base + p.saturating_sub(first_long);
    let count = base + usize::from(p >= first_long);
    (start, count)
}

/// Region of active task `task` on `grid` (row-major over the grid).
pub fn grid_region(dims: &[usize], grid: &[usize], task: usize) -> Option<Region> {
    let active: usize = grid.iter().product();
    if task >= active {
        return None;
    }
    let pos = unravel(task, grid);
    let (start, count) = dims
        .iter()
        .zip(grid)
        .zip(&pos)
        .map(|((&d, &g), &p)| part_start_count(d, g, p))
        .unzip();
    Some(Region::new(start, count, 0))
}

fn encode_region(region: Option<&Region>) -> Vec<WireOffset> {
    match region {
        Some(r) if !r.is_empty() => r
            .start
            .iter()
            .chain(&r.count)
            .map(|&v| WireOffset::of(v as u64))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_region(words: &[WireOffset], ndims: usize) -> Result<Option<Region>, PioError> {
    if words.is_empty() {
        return Ok(None);
    }
    if words.len() != 2 * ndims {
        return Err(PioError::Internal(format!(
            "region record of {} words for {ndims} dimensions",
            words.len()
        )));
    }
    let vals: Vec<usize> = words.iter().map(|w| w.get() as usize).collect();
    Ok(Some(Region::new(vals[..ndims].to_vec(), vals[ndims..].to_vec(), 0)))
}

/// Compute the Box pattern. Collective over `union`.
pub(crate) fn plan<C: Communicator>(
    union: &Comm<C>,
    layout: &UnionLayout,
    dims: &[usize],
    map: &[u64],
    type_size: usize,
    blocksize: usize,
    explicit: Option<(Vec<usize>, Vec<usize>)>,
) -> Result<Plan, PioError> {
    let me = union.rank();
    let num_io = layout.num_io();
    let io_rank = layout.union_to_io(me);

    // the IO root decides how many IO tasks hold data
    let proposal = if me == layout.io_root() {
        let active = match explicit {
            Some(_) => num_io,
            None => box_grid(dims, box_task_count(dims, num_io, blocksize, type_size))
                .iter()
                .product(),
        };
        WireStatus::new(PIO_NOERR, active as i64)
    } else {
        WireStatus::new(PIO_NOERR, 0)
    };
    let status: WireStatus = union.bcast_one(layout.io_root(), proposal)?;
    if let Some(e) = PioError::from_code(status.code(), "box split failed on the IO root") {
        return Err(e);
    }
    let num_aiotasks = status.value() as usize;
    if num_aiotasks == 0 || num_aiotasks > num_io {
        return Err(PioError::Internal(format!(
            "{num_aiotasks} active IO tasks out of {num_io}"
        )));
    }

    let own = match (io_rank, explicit) {
        (Some(_), Some((start, count))) => Some(Region::new(start, count, 0)),
        (Some(r), None) => grid_region(dims, &box_grid(dims, num_aiotasks), r),
        (None, _) => None,
    };

    // every IO task publishes its region
    let mut regions: Vec<Option<Region>> = Vec::with_capacity(num_io);
    for j in 0..num_io {
        let root = layout
            .io_to_union(j)
            .ok_or_else(|| PioError::Internal(format!("IO rank {j} has no union rank")))?;
        let mine = if me == root { encode_region(own.as_ref()) } else { Vec::new() };
        let words = union.bcast_vec(root, &mine)?;
        regions.push(decode_region(&words, dims.len())?);
    }

    // compute side: route every mapped entry to the IO task owning it
    let mut local_err = None;
    let mut by_dest: Vec<Vec<usize>> = vec![Vec::new(); union.size()];
    let mut offs_by_dest: Vec<Vec<WireOffset>> = vec![Vec::new(); union.size()];
    if layout.union_to_comp(me).is_some() {
        for (i, &m) in map.iter().enumerate() {
            if m == 0 {
                continue;
            }
            let coord = unravel((m - 1) as usize, dims);
            let owner = regions
                .iter()
                .position(|r| r.as_ref().is_some_and(|r| r.contains(&coord)));
            match owner.and_then(|j| layout.io_to_union(j)) {
                Some(dest) => {
                    by_dest[dest].push(i);
                    offs_by_dest[dest].push(WireOffset::of(m - 1));
                }
                None => {
                    local_err.get_or_insert_with(|| {
                        PioError::invalid(format!("map entry {m} lies in no IO region"))
                    });
                }
            }
        }
    }
    let outgoing: Vec<&[u8]> = offs_by_dest.iter().map(|v| cast_slice(v)).collect();
    let incoming = union.alltoallv(&outgoing)?;

    // IO side: place what arrives inside the own region
    let mut recv = RecvPlan::default();
    let mut filled = vec![false; own.as_ref().map_or(0, Region::len)];
    if let Some(region) = &own {
        for (src, bytes) in incoming.iter().enumerate() {
            let offs: Vec<WireOffset> = vec_from_bytes(bytes)?;
            if offs.is_empty() {
                continue;
            }
            let mut positions = Vec::with_capacity(offs.len());
            for off in offs {
                let coord = unravel(off.get() as usize, dims);
                if !region.contains(&coord) {
                    return Err(PioError::Internal(format!(
                        "offset {} sent to the wrong IO task",
                        ravel(&coord, dims)
                    )));
                }
                let p = region.buffer_index(&coord);
                filled[p] = true;
                positions.push(p);
            }
            recv.sources.push((src, positions));
        }
    }

    let send = SendPlan {
        targets: by_dest
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .collect(),
    };
    let regions: Vec<Region> = own.into_iter().filter(|r| !r.is_empty()).collect();
    let llen = regions.iter().map(Region::len).sum();
    Ok(Plan {
        num_aiotasks,
        regions,
        llen,
        filled: filled.iter().filter(|&&f| f).count(),
        send,
        recv,
        local_err,
    })
}
