mod util;
use util::*;

use pio_core::prelude::*;
use pio_core::types::FIRST_IOSYSID;
use pio_core::Topology;
use serial_test::serial;

#[test]
#[serial]
fn presplit_channels_join_with_io_high() {
    // component 0 on ranks 0-1, component 1 on rank 2, io on rank 3
    let out = run_ranks(4, |world, mut pio| {
        let comp0 = world.create_from_ranks(&[0, 1]).unwrap();
        let comp1 = world.create_from_ranks(&[2]).unwrap();
        let io = world.create_from_ranks(&[3]).unwrap();
        let ids = pio
            .init_intercomm(&world, &[comp0, comp1], io.as_ref(), Rearranger::Subset)
            .unwrap();
        if world.rank() == 3 {
            assert_eq!(pio.num_iosystems(), 0);
            return (ids, None);
        }
        let k = usize::from(world.rank() == 2);
        let id = ids[k];
        assert!(pio.iosystem_is_active(id).unwrap());
        assert!(!pio.iosystem_is_active(ids[1 - k]).unwrap());
        let ios = pio.iosystem(id).unwrap();
        let seen = (
            ios.topology(),
            ios.num_union_tasks(),
            ios.io_root(),
            ios.comp_root(),
            ios.union_rank(),
        );

        let comp_rank = ios.comp_rank().unwrap();
        let map = contiguous_map(2 * comp_rank as u64, 2);
        let ioid = pio
            .init_decomp(id, PioType::Float, &[4], &map, DecompOptions::default())
            .unwrap();
        let d = pio.decomposition(ioid).unwrap();
        // component 1 only covers half the array
        assert_eq!(d.needs_fill(), k == 1);
        assert_eq!(d.num_active_io_tasks(), 1);
        for &other in &ids {
            pio.finalize(other).unwrap();
        }
        (ids, Some(seen))
    });

    let all_ids = vec![FIRST_IOSYSID, FIRST_IOSYSID + 1];
    for (ids, _) in &out {
        assert_eq!(ids, &all_ids);
    }
    let (topo, union, io_root, comp_root, union_rank) = out[1].1.unwrap();
    assert_eq!(topo, Topology::PreSplit { component: 0, components: 2 });
    assert_eq!((union, io_root, comp_root, union_rank), (3, 2, 0, Some(1)));
    let (topo, union, io_root, _, union_rank) = out[2].1.unwrap();
    assert_eq!(topo, Topology::PreSplit { component: 1, components: 2 });
    assert_eq!((union, io_root, union_rank), (2, 1, Some(0)));
}

#[test]
fn a_task_in_two_channels_is_refused() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let comp = Some(world.dup().unwrap());
    let io = world.dup().unwrap();
    let err = pio
        .init_intercomm(&world, &[comp], Some(&io), Rearranger::Box)
        .unwrap_err();
    assert!(matches!(err, PioError::InvalidArgument(_)));
}
