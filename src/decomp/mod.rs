//! Decompositions: how a global array is spread over compute tasks, and the
//! precomputed pattern that moves it to and from the IO tasks.
//!
//! A local map lists, for each local element, its 1-based offset in the
//! row-major global array (0 = not transferred). [`Pio::init_decomp`] turns
//! the map into a [`Decomposition`] with either rearranger:
//!
//! * **Box**: every IO task owns one hyper-rectangular region of the global
//!   array, either given explicitly or found by [`box_rearr::box_grid`].
//! * **Subset**: compute task `c` feeds IO task `c % num_io`, which holds
//!   exactly the sorted, de-duplicated offsets it receives.

pub mod box_rearr;
pub mod subset;
mod transfer;

use crate::async_service::AsyncRequest;
use crate::comm::Communicator;
use crate::error_policy;
use crate::pio_error::PioError;
use crate::registry::Pio;
use crate::storage::{DecompMapRecord, uniq_name};
use crate::types::{IoId, IoSysId, PioType, Rearranger};

/// One contiguous block of the global array held by an IO task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: Vec<usize>,
    pub count: Vec<usize>,
    /// Position of the region's first element in the IO buffer.
    pub loffset: usize,
}

impl Region {
    pub fn new(start: Vec<usize>, count: Vec<usize>, loffset: usize) -> Self {
        Self { start, count, loffset }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.count.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, coord: &[usize]) -> bool {
        coord
            .iter()
            .zip(self.start.iter().zip(&self.count))
            .all(|(&c, (&s, &n))| c >= s && c < s + n)
    }

    /// IO buffer position of `coord`, which must lie in the region.
    pub fn buffer_index(&self, coord: &[usize]) -> usize {
        let mut idx = 0;
        for ((&c, &s), &n) in coord.iter().zip(&self.start).zip(&self.count) {
            idx = idx * n + (c - s);
        }
        self.loffset + idx
    }
}

/// Compute side: local map indices sent to each union rank, in send order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendPlan {
    pub targets: Vec<(usize, Vec<usize>)>,
}

/// IO side: IO buffer positions filled from each union rank, in receive
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecvPlan {
    pub sources: Vec<(usize, Vec<usize>)>,
}

/// What a rearranger produces on one task.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub num_aiotasks: usize,
    pub regions: Vec<Region>,
    /// IO buffer length on this task.
    pub llen: usize,
    /// Distinct IO buffer positions that receive data on this task.
    pub filled: usize,
    pub send: SendPlan,
    pub recv: RecvPlan,
    pub local_err: Option<PioError>,
}

/// Optional arguments of [`Pio::init_decomp`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecompOptions {
    /// Overrides the IOSystem's default rearranger.
    pub rearranger: Option<Rearranger>,
    /// Explicit Box region of this IO task (with `iocount`).
    pub iostart: Option<Vec<usize>>,
    pub iocount: Option<Vec<usize>>,
}

#[derive(Clone, Debug)]
pub struct Decomposition {
    pub(crate) ioid: IoId,
    pub(crate) iosysid: IoSysId,
    pub(crate) pio_type: PioType,
    pub(crate) dims: Vec<usize>,
    pub(crate) map: Vec<u64>,
    pub(crate) rearranger: Rearranger,
    pub(crate) num_aiotasks: usize,
    pub(crate) regions: Vec<Region>,
    pub(crate) llen: usize,
    pub(crate) max_io_buffer_len: usize,
    pub(crate) send: SendPlan,
    pub(crate) recv: RecvPlan,
    pub(crate) needs_fill: bool,
}

impl Decomposition {
    pub fn ioid(&self) -> IoId {
        self.ioid
    }

    pub fn iosysid(&self) -> IoSysId {
        self.iosysid
    }

    pub fn pio_type(&self) -> PioType {
        self.pio_type
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn maplen(&self) -> usize {
        self.map.len()
    }

    pub fn map(&self) -> &[u64] {
        &self.map
    }

    pub fn rearranger(&self) -> Rearranger {
        self.rearranger
    }

    /// IO tasks that own data; at most the IOSystem's IO task count.
    pub fn num_active_io_tasks(&self) -> usize {
        self.num_aiotasks
    }

    /// Regions held by this task (empty on tasks that do no IO).
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// IO buffer length of this task, in elements.
    pub fn io_buffer_len(&self) -> usize {
        self.llen
    }

    /// Largest IO buffer over all IO tasks, in elements.
    pub fn max_io_buffer_len(&self) -> usize {
        self.max_io_buffer_len
    }

    pub fn max_io_buffer_bytes(&self) -> usize {
        self.max_io_buffer_len * self.pio_type.size()
    }

    pub fn send_plan(&self) -> &SendPlan {
        &self.send
    }

    pub fn recv_plan(&self) -> &RecvPlan {
        &self.recv
    }

    /// Does some part of the global array receive no data?
    pub fn needs_fill(&self) -> bool {
        self.needs_fill
    }
}

/// Row-major coordinates of a 0-based `offset`.
pub fn unravel(mut offset: usize, dims: &[usize]) -> Vec<usize> {
    let mut coord = vec![0; dims.len()];
    for (c, &d) in coord.iter_mut().zip(dims).rev() {
        *c = offset % d;
        offset /= d;
    }
    coord
}

/// 0-based row-major offset of `coord`.
pub fn ravel(coord: &[usize], dims: &[usize]) -> usize {
    coord.iter().zip(dims).fold(0, |acc, (&c, &d)| acc * d + c)
}

fn validate_dims(dims: &[usize]) -> Result<usize, PioError> {
    if dims.is_empty() {
        return Err(PioError::invalid("decomposition needs at least one dimension"));
    }
    if let Some(i) = dims.iter().position(|&d| d == 0) {
        return Err(PioError::invalid(format!("dimension {i} has length 0")));
    }
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| PioError::invalid("global array volume overflows"))
}

fn validate_explicit(start: &[usize], count: &[usize], dims: &[usize]) -> Result<(), PioError> {
    if start.len() != dims.len() || count.len() != dims.len() {
        return Err(PioError::invalid(format!(
            "iostart/iocount need {} entries, got {}/{}",
            dims.len(),
            start.len(),
            count.len()
        )));
    }
    for (i, ((&s, &c), &d)) in start.iter().zip(count).zip(dims).enumerate() {
        if s.checked_add(c).is_none_or(|end| end > d) {
            return Err(PioError::invalid(format!(
                "region {s}+{c} exceeds dimension {i} of length {d}"
            )));
        }
    }
    Ok(())
}

/// Copy of `map` with out-of-range entries turned into skips, plus an
/// error describing the first of them.
fn sanitize_map(map: &[u64], volume: usize) -> (Vec<u64>, Option<PioError>) {
    let mut err = None;
    let clean = map
        .iter()
        .map(|&m| {
            if m as u128 > volume as u128 {
                err.get_or_insert_with(|| {
                    PioError::invalid(format!("map entry {m} beyond global volume {volume}"))
                });
                0
            } else {
                m
            }
        })
        .collect();
    (clean, err)
}

impl<C: Communicator> Pio<C> {
    /// Create a decomposition. Collective over the IOSystem's union channel;
    /// on an async IOSystem compute tasks forward the call to the IO side
    /// first. Returns the new id.
    pub fn init_decomp(
        &mut self,
        iosysid: IoSysId,
        pio_type: PioType,
        dims: &[usize],
        map: &[u64],
        opts: DecompOptions,
    ) -> Result<IoId, PioError> {
        let r = self.init_decomp_inner(iosysid, pio_type, dims, map, opts);
        self.policy(Some(iosysid), r)
    }

    fn init_decomp_inner(
        &mut self,
        iosysid: IoSysId,
        pio_type: PioType,
        dims: &[usize],
        map: &[u64],
        opts: DecompOptions,
    ) -> Result<IoId, PioError> {
        let volume = validate_dims(dims)?;
        let ios = self.iosystem(iosysid)?;
        let rearranger = opts.rearranger.unwrap_or(ios.default_rearranger());
        let explicit = match (opts.iostart, opts.iocount) {
            (Some(s), Some(c)) => {
                validate_explicit(&s, &c, dims)?;
                Some((s, c))
            }
            (None, None) => None,
            _ => return Err(PioError::invalid("iostart and iocount must be given together")),
        };
        if explicit.is_some() && rearranger == Rearranger::Subset {
            log::debug!("iostart/iocount ignored by the subset rearranger");
        }
        if ios.is_async() {
            let narrow = |v: &[usize]| v.iter().map(|&d| d as u64).collect::<Vec<_>>();
            self.forward(
                iosysid,
                AsyncRequest::InitDecomp {
                    iosysid,
                    pio_type: pio_type.code(),
                    dims: narrow(dims),
                    rearranger: Some(rearranger.code()),
                    iostart: explicit.as_ref().map(|(s, _)| narrow(s)),
                    iocount: explicit.as_ref().map(|(_, c)| narrow(c)),
                },
            )?;
        }

        let ios = self.iosystem(iosysid)?;
        let union = ios.union()?.clone();
        let layout = ios.layout().clone();
        let mode = ios.error_handling();
        let is_compute = ios.is_compute_proc();
        let scope = ios.is_async().then_some(&union);
        let ioid = self.take_ioid(scope)?;

        let (map, map_err) = sanitize_map(map, volume);
        let mut plan = match rearranger {
            Rearranger::Box => box_rearr::plan(
                &union,
                &layout,
                dims,
                &map,
                pio_type.size(),
                self.config().box_blocksize,
                explicit,
            )?,
            Rearranger::Subset => subset::plan(&union, &layout, dims, &map)?,
        };

        let [max_llen, filled] = union.allreduce([plan.llen as u64, plan.filled as u64], |a, b| {
            [a[0].max(b[0]), a[1] + b[1]]
        })?;
        let max_io_buffer_len = max_llen as usize;
        if max_io_buffer_len.checked_mul(pio_type.size()).is_none() {
            plan.local_err.get_or_insert(PioError::OutOfMemory(format!(
                "IO buffer of {max_io_buffer_len} elements"
            )));
        }
        let local = match map_err.or(plan.local_err.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        };
        error_policy::agree(mode, &union, local)?;

        log::debug!(
            "decomposition {ioid}: {rearranger:?}, {} active io tasks, max io buffer {max_io_buffer_len}",
            plan.num_aiotasks
        );
        let decomp = Decomposition {
            ioid,
            iosysid,
            pio_type,
            dims: dims.to_vec(),
            map,
            rearranger,
            num_aiotasks: plan.num_aiotasks,
            regions: plan.regions,
            llen: plan.llen,
            max_io_buffer_len,
            send: plan.send,
            recv: plan.recv,
            needs_fill: (filled as usize) < volume,
        };
        if self.config().save_decomps && is_compute {
            self.save_decomp(&decomp, union.rank(), layout.num_comp(), layout.num_io())?;
        }
        self.decomps.insert(ioid, decomp);
        Ok(ioid)
    }

    fn save_decomp(&mut self, d: &Decomposition, task_rank: usize, num_comp: usize, num_io: usize) -> Result<(), PioError> {
        let counter = self.next_uniq();
        let name = uniq_name(
            &self.config().decomp_file_prefix,
            ".dat",
            num_comp,
            num_io,
            d.ndims(),
            counter,
        );
        let record = DecompMapRecord {
            ioid: d.ioid,
            pio_type: d.pio_type,
            dims: &d.dims,
            map: &d.map,
            task_rank,
            num_tasks: num_comp,
        };
        self.storage.write_decomp_map(&name, &record)
    }

    /// Legacy entry point taking a 0-based map with -1 for skipped entries.
    pub fn init_decomp_zero_based(
        &mut self,
        iosysid: IoSysId,
        pio_type: PioType,
        dims: &[usize],
        map: &[i64],
        opts: DecompOptions,
    ) -> Result<IoId, PioError> {
        let converted: Result<Vec<u64>, PioError> = map
            .iter()
            .map(|&m| {
                if m < -1 {
                    Err(PioError::invalid(format!("0-based map entry {m} below -1")))
                } else {
                    Ok((m + 1) as u64)
                }
            })
            .collect();
        match converted {
            Ok(map) => self.init_decomp(iosysid, pio_type, dims, &map, opts),
            Err(e) => self.policy(Some(iosysid), Err(e)),
        }
    }

    /// Decomposition of the block `start .. start + count` of the global
    /// array, moved with the Subset rearranger.
    pub fn init_decomp_bc(
        &mut self,
        iosysid: IoSysId,
        pio_type: PioType,
        dims: &[usize],
        start: &[i64],
        count: &[i64],
    ) -> Result<IoId, PioError> {
        match block_map(dims, start, count) {
            Ok(map) => {
                let opts = DecompOptions {
                    rearranger: Some(Rearranger::Subset),
                    ..DecompOptions::default()
                };
                self.init_decomp(iosysid, pio_type, dims, &map, opts)
            }
            Err(e) => self.policy(Some(iosysid), Err(e)),
        }
    }

    /// Release a decomposition; on an async IOSystem compute tasks tell the
    /// IO side first.
    pub fn free_decomp(&mut self, iosysid: IoSysId, ioid: IoId) -> Result<(), PioError> {
        let r = self.free_decomp_inner(iosysid, ioid);
        self.policy(Some(iosysid), r)
    }

    fn free_decomp_inner(&mut self, iosysid: IoSysId, ioid: IoId) -> Result<(), PioError> {
        let owner = self.decomposition(ioid)?.iosysid;
        if owner != iosysid {
            return Err(PioError::invalid(format!(
                "decomposition {ioid} belongs to iosystem {owner}, not {iosysid}"
            )));
        }
        if self.iosystem(iosysid)?.is_async() {
            self.forward(iosysid, AsyncRequest::FreeDecomp { iosysid, ioid })?;
        }
        self.decomps.remove(&ioid);
        Ok(())
    }
}

/// 1-based row-major map of a block; validated against `dims`.
pub fn block_map(dims: &[usize], start: &[i64], count: &[i64]) -> Result<Vec<u64>, PioError> {
    validate_dims(dims)?;
    if start.len() != dims.len() || count.len() != dims.len() {
        return Err(PioError::invalid(format!(
            "start/count need {} entries, got {}/{}",
            dims.len(),
            start.len(),
            count.len()
        )));
    }
    let mut s = Vec::with_capacity(dims.len());
    let mut c = Vec::with_capacity(dims.len());
    for (i, ((&st, &ct), &d)) in start.iter().zip(count).zip(dims).enumerate() {
        if st < 0 || ct < 0 || (st as u128 + ct as u128) > d as u128 {
            return Err(PioError::invalid(format!(
                "block {st}+{ct} invalid for dimension {i} of length {d}"
            )));
        }
        s.push(st as usize);
        c.push(ct as usize);
    }
    let block = Region::new(s, c, 0);
    let mut map = Vec::with_capacity(block.len());
    for i in 0..block.len() {
        let local = unravel(i, &block.count);
        let global: Vec<usize> = local.iter().zip(&block.start).map(|(l, s)| l + s).collect();
        map.push(ravel(&global, dims) as u64 + 1);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ravel_unravel_agree() {
        let dims = [3, 4, 5];
        for off in [0, 7, 59] {
            assert_eq!(ravel(&unravel(off, &dims), &dims), off);
        }
        assert_eq!(unravel(7, &dims), vec![0, 1, 2]);
    }

    #[test]
    fn region_indexing() {
        let r = Region::new(vec![1, 2], vec![2, 3], 10);
        assert_eq!(r.len(), 6);
        assert!(r.contains(&[2, 4]));
        assert!(!r.contains(&[3, 2]));
        assert_eq!(r.buffer_index(&[1, 2]), 10);
        assert_eq!(r.buffer_index(&[2, 3]), 14);
    }

    #[test]
    fn block_map_is_row_major() {
        let map = block_map(&[3, 4], &[1, 1], &[2, 2]).unwrap();
        assert_eq!(map, vec![6, 7, 10, 11]);
        assert!(block_map(&[3, 4], &[2, 0], &[2, 1]).is_err());
        assert!(block_map(&[3, 4], &[-1, 0], &[1, 1]).is_err());
        assert!(block_map(&[3], &[0, 0], &[1, 1]).is_err());
    }

    #[test]
    fn dims_and_maps_are_checked() {
        assert!(validate_dims(&[]).is_err());
        assert!(validate_dims(&[4, 0]).is_err());
        assert_eq!(validate_dims(&[4, 3]).unwrap(), 12);
        let (clean, err) = sanitize_map(&[1, 13, 0], 12);
        assert_eq!(clean, vec![1, 0, 0]);
        assert!(err.is_some());
        assert!(validate_explicit(&[0, 2], &[4, 2], &[4, 4]).is_ok());
        assert!(validate_explicit(&[0, 3], &[4, 2], &[4, 4]).is_err());
    }
}
