//! Moving typed data along a decomposition's send/receive plans.
//!
//! Only IOSystems whose union channel holds both sides can move data here;
//! on async IOSystems the IO side is driven by its own service loop. Box
//! data moves through a full exchange over the union channel; Subset data
//! only travels between each compute task and the IO task serving it.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, Bytes, BytesMut};

use crate::comm::{Comm, Communicator};
use crate::comm::wire::vec_from_bytes;
use crate::pio_error::PioError;
use crate::registry::{BufferPool, Pio};
use crate::types::{IoId, Rearranger};

use super::Decomposition;

fn check_element<T: Pod>(d: &Decomposition) -> Result<(), PioError> {
    if size_of::<T>() != d.pio_type.size() {
        return Err(PioError::invalid(format!(
            "{}-byte elements for a decomposition of {:?}",
            size_of::<T>(),
            d.pio_type
        )));
    }
    Ok(())
}

/// For each union rank, the local map indices exchanged with it.
fn by_rank(pairs: &[(usize, Vec<usize>)], size: usize) -> Vec<Option<&[usize]>> {
    let mut out = vec![None; size];
    for (rank, idx) in pairs {
        if let Some(slot) = out.get_mut(*rank) {
            *slot = Some(idx.as_slice());
        }
    }
    out
}

/// Send what `fill` packs for each entry of `to` and return what arrives
/// from each entry of `from`, in the order of `from`.
fn move_along<C, F>(
    union: &Comm<C>,
    rearranger: Rearranger,
    pool: &mut BufferPool,
    to: &[(usize, Vec<usize>)],
    from: &[(usize, Vec<usize>)],
    mut fill: F,
) -> Result<Vec<Vec<u8>>, PioError>
where
    C: Communicator,
    F: FnMut(&[usize], &mut BytesMut),
{
    match rearranger {
        Rearranger::Box => {
            let targets = by_rank(to, union.size());
            let outgoing = pool.pack_with(union.size(), |r, buf| {
                if let Some(idx) = targets[r] {
                    fill(idx, buf);
                }
            });
            let mut incoming = union.alltoallv(&outgoing)?;
            from.iter()
                .map(|(src, _)| {
                    incoming
                        .get_mut(*src)
                        .map(std::mem::take)
                        .ok_or_else(|| PioError::Internal(format!("no exchange slot for rank {src}")))
                })
                .collect()
        }
        Rearranger::Subset => {
            let packed = pool.pack_with(to.len(), |k, buf| fill(&to[k].1, buf));
            let outgoing: Vec<(usize, Bytes)> = to.iter().map(|(r, _)| *r).zip(packed).collect();
            let sources: Vec<usize> = from.iter().map(|(r, _)| *r).collect();
            union.exchange(&outgoing, &sources)
        }
    }
}

impl<C: Communicator> Pio<C> {
    /// Gather the compute-side array `local` (one value per map entry) into
    /// this task's IO buffer. Collective over the union channel. Returns an
    /// empty buffer on tasks that hold no region; positions nothing maps to
    /// are zero.
    pub fn rearrange_comp2io<T: Pod>(&mut self, ioid: IoId, local: &[T]) -> Result<Vec<T>, PioError> {
        let iosysid = self.decomposition(ioid)?.iosysid;
        let r = self.comp2io(ioid, local);
        self.policy(Some(iosysid), r)
    }

    fn comp2io<T: Pod>(&mut self, ioid: IoId, local: &[T]) -> Result<Vec<T>, PioError> {
        let (d, ios, pool) = self.transfer_parts(ioid)?;
        check_element::<T>(d)?;
        if ios.is_async() {
            return Err(PioError::invalid("data movement is not available on async iosystems"));
        }
        let union = ios.union()?;
        if ios.is_compute_proc() && local.len() != d.map.len() {
            return Err(PioError::invalid(format!(
                "local array of {} elements for a map of {}",
                local.len(),
                d.map.len()
            )));
        }

        let incoming = move_along(union, d.rearranger, pool, &d.send.targets, &d.recv.sources, |idx, buf| {
            for &i in idx {
                buf.put_slice(bytemuck::bytes_of(&local[i]));
            }
        })?;

        let mut iobuf = vec![<T as Zeroable>::zeroed(); d.llen];
        for ((src, positions), bytes) in d.recv.sources.iter().zip(&incoming) {
            let vals: Vec<T> = vec_from_bytes(bytes)?;
            if vals.len() != positions.len() {
                return Err(PioError::Internal(format!(
                    "rank {src} sent {} values, expected {}",
                    vals.len(),
                    positions.len()
                )));
            }
            for (&p, v) in positions.iter().zip(vals) {
                iobuf[p] = v;
            }
        }
        Ok(iobuf)
    }

    /// Scatter this task's IO buffer back into the compute-side array
    /// `local`. Collective over the union channel. Entries whose map value
    /// is 0 are left untouched.
    pub fn rearrange_io2comp<T: Pod>(&mut self, ioid: IoId, iobuf: &[T], local: &mut [T]) -> Result<(), PioError> {
        let iosysid = self.decomposition(ioid)?.iosysid;
        let r = self.io2comp(ioid, iobuf, local);
        self.policy(Some(iosysid), r)
    }

    fn io2comp<T: Pod>(&mut self, ioid: IoId, iobuf: &[T], local: &mut [T]) -> Result<(), PioError> {
        let (d, ios, pool) = self.transfer_parts(ioid)?;
        check_element::<T>(d)?;
        if ios.is_async() {
            return Err(PioError::invalid("data movement is not available on async iosystems"));
        }
        let union = ios.union()?;
        if iobuf.len() != d.llen {
            return Err(PioError::invalid(format!(
                "IO buffer of {} elements, decomposition holds {}",
                iobuf.len(),
                d.llen
            )));
        }
        if ios.is_compute_proc() && local.len() != d.map.len() {
            return Err(PioError::invalid(format!(
                "local array of {} elements for a map of {}",
                local.len(),
                d.map.len()
            )));
        }

        let incoming = move_along(union, d.rearranger, pool, &d.recv.sources, &d.send.targets, |positions, buf| {
            for &p in positions {
                buf.put_slice(bytemuck::bytes_of(&iobuf[p]));
            }
        })?;

        for ((dest, idx), bytes) in d.send.targets.iter().zip(&incoming) {
            let vals: Vec<T> = vec_from_bytes(bytes)?;
            if vals.len() != idx.len() {
                return Err(PioError::Internal(format!(
                    "rank {dest} returned {} values, expected {}",
                    vals.len(),
                    idx.len()
                )));
            }
            for (&i, v) in idx.iter().zip(vals) {
                local[i] = v;
            }
        }
        Ok(())
    }
}
