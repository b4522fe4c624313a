mod util;
use util::*;

use pio_core::decomp::box_rearr::{box_grid, box_task_count, grid_region};
use pio_core::decomp::{ravel, unravel};
use pio_core::prelude::*;
use proptest::prelude::*;

/// Four ranks, IO on ranks 0 and 2; rank `r` owns row `r` of a 4x6 array.
fn rows_on_four_ranks<R, F>(f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&mut Pio<ThreadComm>, IoSysId, usize, Vec<u64>) -> R + Sync,
{
    run_ranks(4, |world, mut pio| {
        let id = pio.init_shared(&world, 2, 2, 0, Rearranger::Box).unwrap();
        let map = contiguous_map(6 * world.rank() as u64, 6);
        f(&mut pio, id, world.rank(), map)
    })
}

#[test]
fn explicit_regions_make_every_io_task_active() {
    let out = rows_on_four_ranks(|pio, id, rank, map| {
        let opts = match rank {
            0 => DecompOptions {
                iostart: Some(vec![0, 0]),
                iocount: Some(vec![2, 6]),
                ..DecompOptions::default()
            },
            2 => DecompOptions {
                iostart: Some(vec![2, 0]),
                iocount: Some(vec![2, 6]),
                ..DecompOptions::default()
            },
            _ => DecompOptions::default(),
        };
        let ioid = pio.init_decomp(id, PioType::Double, &[4, 6], &map, opts).unwrap();
        let local: Vec<f64> = map.iter().map(|&m| (m - 1) as f64).collect();
        let iobuf = pio.rearrange_comp2io(ioid, &local).unwrap();

        let mut back = vec![-1.0; local.len()];
        pio.rearrange_io2comp(ioid, &iobuf, &mut back).unwrap();
        assert_eq!(back, local);

        let d = pio.decomposition(ioid).unwrap();
        (d.num_active_io_tasks(), d.max_io_buffer_len(), d.needs_fill(), iobuf)
    });
    for (rank, (active, max_len, needs_fill, iobuf)) in out.into_iter().enumerate() {
        assert_eq!(active, 2);
        assert_eq!(max_len, 12);
        assert!(!needs_fill);
        let want: Vec<f64> = match rank {
            0 => (0..12).map(f64::from).collect(),
            2 => (12..24).map(f64::from).collect(),
            _ => Vec::new(),
        };
        assert_eq!(iobuf, want, "rank {rank}");
    }
}

#[test]
fn small_blocks_spread_over_all_io_tasks() {
    let out = rows_on_four_ranks(|pio, id, _, map| {
        pio.set_blocksize(16);
        let ioid = pio
            .init_decomp(id, PioType::Int, &[4, 6], &map, DecompOptions::default())
            .unwrap();
        let d = pio.decomposition(ioid).unwrap();
        (d.num_active_io_tasks(), d.io_buffer_len(), d.regions().to_vec())
    });
    assert!(out.iter().all(|(active, _, _)| *active == 2));
    let held: usize = out.iter().map(|(_, len, _)| len).sum();
    assert_eq!(held, 24);
    assert_eq!(out[0].2[0].start, vec![0, 0]);
    assert_eq!(out[2].2[0].start, vec![2, 0]);
    assert!(out[1].2.is_empty() && out[3].2.is_empty());
}

#[test]
fn small_arrays_stay_on_the_io_root() {
    let out = rows_on_four_ranks(|pio, id, _, map| {
        let ioid = pio
            .init_decomp(id, PioType::Int, &[4, 6], &map, DecompOptions::default())
            .unwrap();
        let local: Vec<i32> = map.iter().map(|&m| m as i32).collect();
        let iobuf = pio.rearrange_comp2io(ioid, &local).unwrap();
        let d = pio.decomposition(ioid).unwrap();
        (d.num_active_io_tasks(), iobuf)
    });
    assert!(out.iter().all(|(active, _)| *active == 1));
    assert_eq!(out[0].1, (1..=24).collect::<Vec<i32>>());
    assert!(out[2].1.is_empty());
}

#[test]
fn skipped_entries_are_left_alone() {
    let out = rows_on_four_ranks(|pio, id, rank, mut map| {
        // rank 3 holds nothing, rank 1 skips its first element
        if rank == 3 {
            map.clear();
        }
        if rank == 1 {
            map[0] = 0;
        }
        let ioid = pio
            .init_decomp(id, PioType::Int, &[4, 6], &map, DecompOptions::default())
            .unwrap();
        let local: Vec<i32> = map.iter().map(|&m| m as i32 * 10).collect();
        let iobuf = pio.rearrange_comp2io(ioid, &local).unwrap();
        let mut back = vec![7; map.len()];
        pio.rearrange_io2comp(ioid, &iobuf, &mut back).unwrap();
        (pio.decomposition(ioid).unwrap().needs_fill(), back, iobuf)
    });
    assert!(out.iter().all(|(fill, _, _)| *fill));
    assert_eq!(out[1].1[0], 7);
    assert_eq!(out[1].1[1..], [80, 90, 100, 110, 120]);
    assert!(out[3].1.is_empty());
    // unfilled IO positions are zero
    assert_eq!(out[0].2[6], 0);
    assert_eq!(out[0].2[18], 0);
}

#[test]
fn bad_maps_and_regions_are_invalid_arguments() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let beyond = pio.init_decomp(id, PioType::Int, &[4], &[1, 5], DecompOptions::default());
    assert!(matches!(beyond, Err(PioError::InvalidArgument(_))));

    let half = DecompOptions {
        iostart: Some(vec![0]),
        ..DecompOptions::default()
    };
    assert!(pio.init_decomp(id, PioType::Int, &[4], &[1], half).is_err());
    let zero_dim = pio.init_decomp(id, PioType::Int, &[4, 0], &[], DecompOptions::default());
    assert!(matches!(zero_dim, Err(PioError::InvalidArgument(_))));

    // element width must match the declared type
    let ioid = pio
        .init_decomp(id, PioType::Int, &[2], &[1, 2], DecompOptions::default())
        .unwrap();
    assert!(pio.rearrange_comp2io(ioid, &[1.0f64, 2.0]).is_err());
    assert!(pio.rearrange_comp2io(ioid, &[1i32]).is_err());
    assert_eq!(pio.local_array_size(ioid).unwrap(), 2);
}

#[test]
fn zero_based_maps_convert() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let ioid = pio
        .init_decomp_zero_based(id, PioType::Short, &[3], &[2, -1, 0], DecompOptions::default())
        .unwrap();
    assert_eq!(pio.decomposition(ioid).unwrap().map(), &[3, 0, 1]);
    assert!(
        pio.init_decomp_zero_based(id, PioType::Short, &[3], &[-2], DecompOptions::default())
            .is_err()
    );
}

proptest! {
    #[test]
    fn box_split_tiles_the_array(
        dims in prop::collection::vec(1usize..7, 1..4),
        num_io in 1usize..9,
        blocksize in 1usize..256,
    ) {
        let tasks = box_task_count(&dims, num_io, blocksize, 4);
        let grid = box_grid(&dims, tasks);
        let active: usize = grid.iter().product();
        prop_assert!(active >= 1 && active <= num_io);
        // IO tasks recompute the grid from the active count alone
        prop_assert_eq!(box_grid(&dims, active), grid.clone());

        let volume: usize = dims.iter().product();
        let mut seen = vec![0u8; volume];
        for t in 0..active {
            let r = grid_region(&dims, &grid, t).unwrap();
            prop_assert!(!r.is_empty());
            for i in 0..r.len() {
                let local = unravel(i, &r.count);
                let g: Vec<usize> = local.iter().zip(&r.start).map(|(a, b)| a + b).collect();
                seen[ravel(&g, &dims)] += 1;
            }
        }
        prop_assert!(seen.iter().all(|&s| s == 1));
    }
}
