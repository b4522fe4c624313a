mod util;
use util::*;

use pio_core::PioError;
use pio_core::topology::shared_io_ranks;
use pio_core::types::FIRST_IOSYSID;
use pio_core::{Rearranger, Topology};
use proptest::prelude::*;

#[test]
fn strided_io_tasks_on_eight_ranks() {
    let out = run_ranks(8, |world, mut pio| {
        let id = pio.init_shared(&world, 2, 4, 0, Rearranger::Box).unwrap();
        let ios = pio.iosystem(id).unwrap();
        let row = (
            id,
            pio.iam_iotask(id).unwrap(),
            pio.iotask_rank(id).unwrap(),
            pio.num_iotasks(id).unwrap(),
            ios.io_root(),
            ios.comp_root(),
            ios.topology(),
        );
        pio.finalize(id).unwrap();
        assert!(!pio.buffer_pool_active());
        row
    });
    for (rank, (id, is_io, io_rank, num_io, io_root, comp_root, topo)) in out.into_iter().enumerate() {
        assert_eq!(id, FIRST_IOSYSID);
        assert_eq!(is_io, rank == 0 || rank == 4, "rank {rank}");
        let want = match rank {
            0 => Some(0),
            4 => Some(1),
            _ => None,
        };
        assert_eq!(io_rank, want);
        assert_eq!(num_io, 2);
        assert_eq!(io_root, 0);
        assert_eq!(comp_root, 0);
        assert_eq!(topo, Topology::Shared { stride: 4, base: 0 });
    }
}

#[test]
fn io_root_is_first_listed_rank() {
    let out = run_ranks(4, |world, mut pio| {
        let id = pio.init_shared(&world, 2, 2, 3, Rearranger::Subset).unwrap();
        let ios = pio.iosystem(id).unwrap();
        (ios.io_root(), ios.io_rank(), ios.default_rearranger())
    });
    // io ranks are 3 then (3 + 2) % 4 = 1
    assert_eq!(out[3].0, 3);
    assert_eq!(out[3].1, Some(0));
    assert_eq!(out[1].1, Some(1));
    assert_eq!(out[0].1, None);
    assert!(out.iter().all(|r| r.2 == Rearranger::Subset));
}

#[test]
fn consecutive_iosystems_take_consecutive_ids() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let a = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let b = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    assert_eq!(b, a + 1);
    assert_eq!(pio.num_iosystems(), 2);
}

#[test]
fn bad_arguments_are_refused_before_any_collective() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    for (n_io, stride, base) in [(0, 1, 0), (2, 1, 0), (1, 0, 0), (1, 1, 1)] {
        let err = pio.init_shared(&world, n_io, stride, base, Rearranger::Box).unwrap_err();
        assert!(matches!(err, PioError::InvalidArgument(_)), "{n_io} {stride} {base}: {err}");
    }
    assert_eq!(pio.num_iosystems(), 0);
    assert!(!pio.buffer_pool_active());
}

proptest! {
    #[test]
    fn shared_io_ranks_are_distinct_and_in_range(
        n in 1usize..64,
        num_io in 1usize..16,
        stride in 1usize..8,
        base in 0usize..64,
    ) {
        match shared_io_ranks(n, num_io, stride, base) {
            Ok(ranks) => {
                prop_assert_eq!(ranks.len(), num_io);
                prop_assert_eq!(ranks[0], base);
                prop_assert!(ranks.iter().all(|&r| r < n));
                let mut sorted = ranks.clone();
                sorted.sort_unstable();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), num_io);
            }
            Err(_) => {
                prop_assert!(num_io > n || base >= n || stride * (num_io - 1) >= n);
            }
        }
    }
}
