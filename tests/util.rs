#![allow(dead_code)]
use pio_core::prelude::*;

/// Serial world channel.
pub fn serial_world() -> Comm<NoComm> {
    Comm::world(NoComm)
}

/// Handle that returns errors instead of aborting.
pub fn returning_pio<C: Communicator>(world: &Comm<C>) -> Pio<C> {
    Pio::new(world, PioConfig::returning_errors())
}

/// Run `f` on `n` in-process ranks, each with its own world channel and
/// returning handle; results in rank order.
pub fn run_ranks<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Comm<ThreadComm>, Pio<ThreadComm>) -> R + Sync,
{
    LocalUniverse::run(n, |tc| {
        let world = Comm::world(tc);
        let pio = returning_pio(&world);
        f(world, pio)
    })
}

/// 1-based map of a contiguous block of `len` elements starting at `first`.
pub fn contiguous_map(first: u64, len: usize) -> Vec<u64> {
    (0..len as u64).map(|i| first + i + 1).collect()
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
