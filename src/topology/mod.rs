//! Process topology builders.
//!
//! Three ways to turn base channels into IOSystems:
//!
//! * [`Pio::init_shared`](crate::Pio::init_shared): every task computes, a
//!   strided subset also does IO.
//! * [`Pio::init_async`](crate::Pio::init_async): a disjoint IO pool serves
//!   one or more compute components carved out of one world channel.
//! * [`Pio::init_intercomm`](crate::Pio::init_intercomm): the same, starting
//!   from already split compute and IO channels.
//!
//! Argument checks run locally before any collective call. Once channels are
//! being built, a failure leaves the other processes blocked in a collective
//! and is treated as fatal regardless of the error handling mode.

mod disjoint;
mod presplit;
mod shared;

use itertools::Itertools;

use crate::pio_error::PioError;

pub use disjoint::AsyncLayout;

/// First tag used for the inter-channel handshakes of the async builders;
/// component `k` uses `INTERCOMM_TAG + k`.
pub(crate) const INTERCOMM_TAG: u16 = 0x0C00;

/// Largest component count the async builders accept.
pub const MAX_COMPONENTS: usize = 1024;

/// IO ranks of a shared topology over `n` tasks:
/// `{(base + i * stride) mod n : i in 0..num_io}` in that order.
pub fn shared_io_ranks(n: usize, num_io: usize, stride: usize, base: usize) -> Result<Vec<usize>, PioError> {
    if num_io < 1 || num_io > n {
        return Err(PioError::invalid(format!(
            "number of IO tasks {num_io} outside 1..={n}"
        )));
    }
    if stride < 1 {
        return Err(PioError::invalid("IO task stride must be at least 1"));
    }
    if base >= n {
        return Err(PioError::invalid(format!("IO base rank {base} outside 0..{n}")));
    }
    match stride.checked_mul(num_io - 1) {
        Some(span) if span < n => {}
        _ => {
            return Err(PioError::invalid(format!(
                "stride {stride} with {num_io} IO tasks does not fit in {n} tasks"
            )));
        }
    }
    Ok((0..num_io).map(|i| (base + i * stride) % n).collect())
}

pub(crate) fn check_components(n: usize) -> Result<(), PioError> {
    if n == 0 || n > MAX_COMPONENTS {
        return Err(PioError::invalid(format!(
            "component count {n} outside 1..={MAX_COMPONENTS}"
        )));
    }
    Ok(())
}

/// Ranks must be in range and used at most once across all lists.
pub(crate) fn check_disjoint(size: usize, lists: &[&[usize]]) -> Result<(), PioError> {
    let all: Vec<usize> = lists.iter().flat_map(|l| l.iter().copied()).collect();
    if let Some(r) = all.iter().find(|&&r| r >= size) {
        return Err(PioError::invalid(format!("rank {r} outside 0..{size}")));
    }
    if let Some(r) = all.iter().duplicates().next() {
        return Err(PioError::invalid(format!("rank {r} assigned twice")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_tasks_stride_four() {
        assert_eq!(shared_io_ranks(8, 2, 4, 0).unwrap(), vec![0, 4]);
        assert_eq!(shared_io_ranks(8, 2, 4, 6).unwrap(), vec![6, 2]);
    }

    #[test]
    fn shared_preconditions() {
        assert!(shared_io_ranks(8, 0, 1, 0).is_err());
        assert!(shared_io_ranks(8, 9, 1, 0).is_err());
        assert!(shared_io_ranks(8, 2, 0, 0).is_err());
        assert!(shared_io_ranks(8, 2, 1, 8).is_err());
        assert!(shared_io_ranks(8, 3, 4, 0).is_err());
        assert!(shared_io_ranks(8, 2, usize::MAX, 0).is_err());
    }

    #[test]
    fn disjoint_lists() {
        assert!(check_disjoint(4, &[&[0, 1], &[2, 3]]).is_ok());
        assert!(check_disjoint(4, &[&[0, 1], &[1, 3]]).is_err());
        assert!(check_disjoint(4, &[&[0, 4]]).is_err());
        assert!(check_components(0).is_err());
    }
}
