mod util;
use util::*;

use pio_core::error_policy::ErrorHandling;
use pio_core::prelude::*;
use pio_core::types::{FIRST_FILEID, FIRST_IOID, FIRST_IOSYSID};
use serial_test::serial;

/// What a compute task saw while driving its component.
#[derive(Debug)]
struct ComputeReport {
    component: usize,
    union_size: usize,
    io_root: usize,
    ioid: IoId,
    active_io: usize,
    max_io_len: usize,
    needs_fill: bool,
    frame_after_set: i32,
    frame_after_advance: i32,
    old_mode: ErrorHandling,
}

#[derive(Debug)]
enum Role {
    Io { ids: Vec<IoSysId>, left_open: usize, pool: bool },
    Compute(ComputeReport),
}

fn drive_component(pio: &mut Pio<ThreadComm>, ids: &[IoSysId]) -> ComputeReport {
    let (k, id) = ids
        .iter()
        .enumerate()
        .find(|&(_, &id)| pio.iosystem_is_active(id).unwrap())
        .map(|(k, &id)| (k, id))
        .unwrap();
    let ios = pio.iosystem(id).unwrap();
    let comp_rank = ios.comp_rank().unwrap();
    let union_size = ios.num_union_tasks();
    let io_root = ios.io_root();

    let map = contiguous_map(4 * comp_rank as u64, 4);
    let ioid = pio
        .init_decomp(id, PioType::Double, &[8], &map, DecompOptions::default())
        .unwrap();
    let d = pio.decomposition(ioid).unwrap();
    let (active_io, max_io_len, needs_fill) = (d.num_active_io_tasks(), d.max_io_buffer_len(), d.needs_fill());

    let ncid = pio.open_file(id).unwrap();
    pio.set_frame(ncid, 3, -5).unwrap();
    let frame_after_set = pio.frame(ncid, 3).unwrap();
    pio.advance_frame(ncid, 3).unwrap();
    let frame_after_advance = pio.frame(ncid, 3).unwrap();
    pio.close_file(ncid).unwrap();

    let old_mode = pio
        .set_error_handling(ErrorTarget::IoSystem(id), ErrorHandling::Broadcast.code())
        .unwrap();
    pio.free_decomp(id, ioid).unwrap();
    for &other in ids {
        pio.finalize(other).unwrap();
    }
    assert!(!pio.buffer_pool_active());

    ComputeReport {
        component: k,
        union_size,
        io_root,
        ioid,
        active_io,
        max_io_len,
        needs_fill,
        frame_after_set,
        frame_after_advance,
        old_mode,
    }
}

#[test]
#[serial]
fn io_pool_serves_two_components() {
    // world: io rank 0, component 0 on ranks 1-2, component 1 on ranks 3-4
    let out = run_ranks(5, |world, mut pio| {
        let layout = AsyncLayout::contiguous(1, vec![2, 2], Rearranger::Box);
        let ids = pio.init_async(&world, &layout).unwrap();
        if world.rank() == 0 {
            Role::Io {
                ids,
                left_open: pio.num_iosystems(),
                pool: pio.buffer_pool_active(),
            }
        } else {
            Role::Compute(drive_component(&mut pio, &ids))
        }
    });

    let mut ioids = Vec::new();
    for (rank, role) in out.into_iter().enumerate() {
        match role {
            Role::Io { ids, left_open, pool } => {
                assert_eq!(rank, 0);
                assert_eq!(ids, vec![FIRST_IOSYSID, FIRST_IOSYSID + 1]);
                assert_eq!(left_open, 0);
                assert!(!pool);
            }
            Role::Compute(r) => {
                assert_eq!(r.component, (rank - 1) / 2);
                assert_eq!(r.union_size, 3);
                // io ranks sit after the compute ranks
                assert_eq!(r.io_root, 2);
                assert_eq!(r.active_io, 1);
                assert_eq!(r.max_io_len, 8);
                assert!(!r.needs_fill);
                assert_eq!(r.frame_after_set, -1);
                assert_eq!(r.frame_after_advance, 0);
                assert_eq!(r.old_mode, ErrorHandling::Return);
                assert!(r.ioid >= FIRST_IOID);
                ioids.push((r.component, r.ioid));
            }
        }
    }
    // both tasks of a component agree on the id
    ioids.sort_unstable();
    assert_eq!(ioids[0], ioids[1]);
    assert_eq!(ioids[2], ioids[3]);
    assert_ne!(ioids[0].1, ioids[2].1);
}

#[test]
#[serial]
fn explicit_io_list_and_files_ids() {
    // io on the last rank, one component of two tasks
    let out = run_ranks(3, |world, mut pio| {
        let mut layout = AsyncLayout::contiguous(1, vec![2], Rearranger::Subset);
        layout.io_proc_list = Some(vec![2]);
        let ids = pio.init_async(&world, &layout).unwrap();
        if world.rank() == 2 {
            return None;
        }
        let id = ids[0];
        assert!(!pio.iam_iotask(id).unwrap());
        assert_eq!(pio.iotask_rank(id).unwrap(), None);
        let ncid = pio.open_file(id).unwrap();
        let map = contiguous_map(3 * world.rank() as u64, 3);
        let ioid = pio
            .init_decomp(id, PioType::Int, &[2, 3], &map, DecompOptions::default())
            .unwrap();
        let rearranger = pio.decomposition(ioid).unwrap().rearranger();
        pio.finalize(id).unwrap();
        Some((ncid, rearranger))
    });
    assert_eq!(out[0], Some((FIRST_FILEID, Rearranger::Subset)));
    assert_eq!(out[1], out[0]);
    assert_eq!(out[2], None);
}

#[test]
#[serial]
fn explicit_regions_reach_the_io_pool() {
    // io ranks 0-1 share the region handed in by the compute tasks
    let out = run_ranks(4, |world, mut pio| {
        let layout = AsyncLayout::contiguous(2, vec![2], Rearranger::Box);
        let ids = pio.init_async(&world, &layout).unwrap();
        if world.rank() < 2 {
            return None;
        }
        let id = ids[0];
        let comp_rank = pio.iosystem(id).unwrap().comp_rank().unwrap();
        let opts = DecompOptions {
            iostart: Some(vec![0]),
            iocount: Some(vec![8]),
            ..DecompOptions::default()
        };
        let map = contiguous_map(4 * comp_rank as u64, 4);
        let ioid = pio.init_decomp(id, PioType::Int, &[8], &map, opts).unwrap();
        let d = pio.decomposition(ioid).unwrap();
        let seen = (d.num_active_io_tasks(), pio.num_iotasks(id).unwrap(), d.max_io_buffer_len());
        pio.finalize(id).unwrap();
        Some(seen)
    });
    assert_eq!(out[2], Some((2, 2, 8)));
    assert_eq!(out[3], out[2]);
}

#[test]
#[serial]
fn every_io_task_follows_the_relayed_requests() {
    // io ranks 0-1, one component on ranks 2-4
    let out = run_ranks(5, |world, mut pio| {
        let layout = AsyncLayout::contiguous(2, vec![3], Rearranger::Box);
        let ids = pio.init_async(&world, &layout).unwrap();
        if world.rank() < 2 {
            return (pio.num_iosystems(), Vec::new());
        }
        let id = ids[0];
        let comp_rank = pio.iosystem(id).unwrap().comp_rank().unwrap();
        let map = contiguous_map(2 * comp_rank as u64, 2);
        let mut active = Vec::new();
        for rearranger in [Rearranger::Box, Rearranger::Subset] {
            let opts = DecompOptions {
                rearranger: Some(rearranger),
                ..DecompOptions::default()
            };
            let ioid = pio.init_decomp(id, PioType::Double, &[6], &map, opts).unwrap();
            let d = pio.decomposition(ioid).unwrap();
            active.push((d.num_active_io_tasks(), d.max_io_buffer_len()));
            pio.free_decomp(id, ioid).unwrap();
        }
        let ncid = pio.open_file(id).unwrap();
        pio.advance_frame(ncid, 0).unwrap();
        pio.close_file(ncid).unwrap();
        pio.finalize(id).unwrap();
        (pio.num_iosystems(), active)
    });
    // both io tasks left the service loop with nothing open
    assert_eq!(out[0], (0, Vec::new()));
    assert_eq!(out[1], (0, Vec::new()));
    // a small box stays on the io root; subset uses both io tasks, the
    // first serving compute ranks 0 and 2
    for report in &out[2..] {
        assert_eq!(report, &(0, vec![(1, 6), (2, 4)]));
    }
}

#[test]
fn bad_layout_is_refused_locally() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let layout = AsyncLayout::contiguous(1, vec![1], Rearranger::Box);
    assert!(matches!(
        pio.init_async(&world, &layout),
        Err(PioError::InvalidArgument(_))
    ));
}
