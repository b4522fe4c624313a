//! Narrow interface to the file-format backend.
//!
//! The core only asks a backend which on-disk formats it supports and, on
//! request, hands it a decomposition map to persist. Everything else about
//! files lives outside this crate.

use serde::{Deserialize, Serialize};

use crate::pio_error::PioError;
use crate::types::{IoId, PioType};

/// On-disk format families.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum IoType {
    Pnetcdf = 1,
    Netcdf = 2,
    Netcdf4c = 3,
    Netcdf4p = 4,
}

/// What a backend receives when a decomposition map is saved.
#[derive(Debug, Clone, Copy)]
pub struct DecompMapRecord<'a> {
    pub ioid: IoId,
    pub pio_type: PioType,
    pub dims: &'a [usize],
    /// 1-based offsets, 0 = skip.
    pub map: &'a [u64],
    pub task_rank: usize,
    pub num_tasks: usize,
}

pub trait StorageBackend {
    fn iotype_available(&self, iotype: IoType) -> bool;

    /// Persist `record` under `name`.
    fn write_decomp_map(&mut self, name: &str, record: &DecompMapRecord<'_>) -> Result<(), PioError>;
}

/// Backend with no formats; map writes are accepted and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStorage;

impl StorageBackend for NoStorage {
    fn iotype_available(&self, _iotype: IoType) -> bool {
        false
    }

    fn write_decomp_map(&mut self, name: &str, record: &DecompMapRecord<'_>) -> Result<(), PioError> {
        log::debug!(
            "no storage backend; dropping map {name} ({} entries)",
            record.map.len()
        );
        Ok(())
    }
}

fn counter_width(n: usize) -> usize {
    if n < 100 {
        2
    } else if n < 10_000 {
        4
    } else {
        6
    }
}

/// Unique name for an auxiliary file:
/// `prefix + NNtasks + NNio + NNdims + counter + suffix`, each number
/// zero-padded to 2, 4 or 6 digits by magnitude.
pub fn uniq_name(
    prefix: &str,
    suffix: &str,
    num_comp_tasks: usize,
    num_io_tasks: usize,
    ndims: usize,
    counter: usize,
) -> String {
    let w = counter_width(num_comp_tasks);
    let d = counter_width(ndims);
    let c = counter_width(counter);
    format!(
        "{prefix}{num_comp_tasks:0w$}tasks{num_io_tasks:0w$}io{ndims:0d$}dims{counter:0c$}{suffix}"
    )
}
