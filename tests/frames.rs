mod util;
use util::*;

use pio_core::frame::{MAX_VARS, NO_FRAME};
use pio_core::prelude::*;
use pio_core::types::FIRST_FILEID;

#[test]
fn negative_frames_collapse_to_no_frame() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let ncid = pio.open_file(id).unwrap();
    assert_eq!(ncid, FIRST_FILEID);

    assert_eq!(pio.frame(ncid, 0).unwrap(), NO_FRAME);
    pio.set_frame(ncid, 0, -5).unwrap();
    assert_eq!(pio.frame(ncid, 0).unwrap(), -1);
    pio.advance_frame(ncid, 0).unwrap();
    pio.advance_frame(ncid, 0).unwrap();
    assert_eq!(pio.frame(ncid, 0).unwrap(), 1);
    pio.set_frame(ncid, 0, 40).unwrap();
    assert_eq!(pio.frame(ncid, 0).unwrap(), 40);
    // other variables are untouched
    assert_eq!(pio.frame(ncid, 1).unwrap(), NO_FRAME);
}

#[test]
fn variable_ids_are_bounded() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let ncid = pio.open_file(id).unwrap();
    let last = MAX_VARS - 1;
    pio.set_frame(ncid, last, 2).unwrap();
    for varid in [-1, MAX_VARS] {
        assert!(matches!(
            pio.set_frame(ncid, varid, 0),
            Err(PioError::InvalidArgument(_))
        ));
        assert!(pio.advance_frame(ncid, varid).is_err());
    }
}

#[test]
fn closed_files_are_gone() {
    let world = serial_world();
    let mut pio = returning_pio(&world);
    let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
    let a = pio.open_file(id).unwrap();
    let b = pio.open_file(id).unwrap();
    assert_eq!(b, a + 1);
    pio.close_file(a).unwrap();
    assert!(!pio.file_is_open(a));
    assert!(matches!(pio.frame(a, 0), Err(PioError::NotFound { .. })));
    assert!(pio.close_file(a).is_err());
    // finalize closes what is left
    pio.finalize(id).unwrap();
    assert!(!pio.file_is_open(b));
}
