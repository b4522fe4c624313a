//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* addressed by world rank and a
//! [`CommTag`] (channel context + tag). Sends never block; the backend owns
//! the payload until delivery. Receives return a waitable handle. Group algebra and collectives are built
//! on top of this trait in [`crate::comm::intracomm`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Channel context plus message tag.
///
/// The context separates traffic of different channels that share a pair of
/// processes; the tag separates traffic inside one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag {
    context: u32,
    tag: u16,
}

impl CommTag {
    /// Tag on the world channel (context 0).
    pub const fn new(tag: u16) -> Self {
        Self { context: 0, tag }
    }

    pub const fn with_context(context: u32, tag: u16) -> Self {
        Self { context, tag }
    }

    pub const fn as_u16(self) -> u16 {
        self.tag
    }

    pub const fn context(self) -> u32 {
        self.context
    }

    /// Same context, tag shifted by `delta` (wrapping).
    pub const fn offset(self, delta: u16) -> Self {
        Self {
            context: self.context,
            tag: self.tag.wrapping_add(delta),
        }
    }
}

/// Message-passing interface addressed by world rank.
pub trait Communicator: 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process in the world.
    fn rank(&self) -> usize;
    /// Number of processes in the world.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: CommTag) -> Self::RecvHandle;

    /// Is a message from `peer` with `tag` ready to be received?
    fn iprobe(&self, peer: usize, tag: CommTag) -> bool;

    /// Terminate every process of the job.
    fn abort(&self, code: i32) -> !;

    /// Returns true if this communicator is a no-op (serial) comm.
    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Serial world of one process. Remote traffic vanishes; self traffic is
/// looped back by [`crate::comm::World`].
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: CommTag, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: CommTag) {}
    fn iprobe(&self, _peer: usize, _tag: CommTag) -> bool {
        false
    }
    fn abort(&self, code: i32) -> ! {
        log::error!("serial job aborted with code {code}");
        panic!("pio abort: code {code}");
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: one thread per rank inside a single process ---

type Key = (usize, usize, CommTag); // (src, dst, tag)

/// Shared mailbox of an in-process job.
pub struct LocalUniverse {
    size: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    ready: Condvar,
    aborted: AtomicBool,
    failure: Mutex<Option<(usize, i32)>>,
}

impl std::fmt::Debug for LocalUniverse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalUniverse")
            .field("size", &self.size)
            .field("pending", &self.mailbox.len())
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalUniverse {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            mailbox: DashMap::new(),
            lock: Mutex::new(()),
            ready: Condvar::new(),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Endpoint for `rank`.
    pub fn comm(self: &Arc<Self>, rank: usize) -> ThreadComm {
        assert!(rank < self.size, "rank {rank} outside universe of {}", self.size);
        ThreadComm {
            rank,
            universe: Arc::clone(self),
        }
    }

    /// Run `f` once per rank on its own thread and collect the results in
    /// rank order. If any rank panics (including an abort), the first failing
    /// rank's panic is resumed on the caller.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let universe = LocalUniverse::new(size);
        let joined: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm = universe.comm(rank);
                    let f = &f;
                    s.spawn(move || {
                        let _guard = FailOnPanic(comm.clone());
                        f(comm)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let first = (*universe.failure.lock()).map(|(rank, _)| rank);
        let mut out = Vec::with_capacity(size);
        let mut payloads: Vec<_> = Vec::new();
        for (rank, res) in joined.into_iter().enumerate() {
            match res {
                Ok(r) => out.push(r),
                Err(p) => payloads.push((rank, p)),
            }
        }
        if !payloads.is_empty() {
            let idx = first
                .and_then(|r| payloads.iter().position(|(rank, _)| *rank == r))
                .unwrap_or(0);
            let (_, payload) = payloads.swap_remove(idx);
            std::panic::resume_unwind(payload);
        }
        out
    }

    fn push(&self, key: Key, data: Bytes) {
        self.mailbox.entry(key).or_default().push_back(data);
        let _g = self.lock.lock();
        self.ready.notify_all();
    }

    fn try_take(&self, key: &Key) -> Option<Bytes> {
        self.mailbox.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn has(&self, key: &Key) -> bool {
        self.mailbox.get(key).is_some_and(|q| !q.is_empty())
    }

    fn fail(&self, rank: usize, code: i32) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some((rank, code));
            }
        }
        self.aborted.store(true, Ordering::SeqCst);
        let _g = self.lock.lock();
        self.ready.notify_all();
    }

    fn abort_code(&self) -> i32 {
        (*self.failure.lock()).map(|(_, c)| c).unwrap_or(-1)
    }

    fn take_blocking(&self, key: &Key) -> Bytes {
        loop {
            if let Some(b) = self.try_take(key) {
                return b;
            }
            let mut g = self.lock.lock();
            if let Some(b) = self.try_take(key) {
                return b;
            }
            if self.aborted.load(Ordering::SeqCst) {
                drop(g);
                panic!("pio abort: code {}", self.abort_code());
            }
            self.ready.wait(&mut g);
        }
    }
}

struct FailOnPanic(ThreadComm);

impl Drop for FailOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.universe.fail(self.0.rank, -1);
        }
    }
}

/// One rank of a [`LocalUniverse`].
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    universe: Arc<LocalUniverse>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadComm({}/{})", self.rank, self.universe.size)
    }
}

/// Pending receive on a [`ThreadComm`].
pub struct LocalHandle {
    universe: Arc<LocalUniverse>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.universe.take_blocking(&self.key).to_vec())
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.universe.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle {
        self.universe
            .push((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> Self::RecvHandle {
        LocalHandle {
            universe: Arc::clone(&self.universe),
            key: (peer, self.rank, tag),
        }
    }

    fn iprobe(&self, peer: usize, tag: CommTag) -> bool {
        if self.universe.aborted.load(Ordering::SeqCst) {
            panic!("pio abort: code {}", self.universe.abort_code());
        }
        self.universe.has(&(peer, self.rank, tag))
    }

    fn abort(&self, code: i32) -> ! {
        log::error!("rank {} aborting job with code {code}", self.rank);
        self.universe.fail(self.rank, code);
        panic!("pio abort: code {code}");
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use crate::pio_error::PioError;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::collections::HashMap;

    /// Every frame travels under one MPI tag; the real tag is in the header.
    const WIRE_TAG: i32 = 0x5049;
    /// Header: context (u32 LE), tag (u16 LE), two bytes padding.
    const HDR: usize = 8;

    /// Immediate send whose frame is owned here until the request completes.
    struct InFlight {
        request: Request<'static, [u8], StaticScope>,
        frame: *mut [u8],
    }

    impl InFlight {
        fn post(world: &SimpleCommunicator, peer: usize, frame: Vec<u8>) -> Self {
            let ptr = Box::into_raw(frame.into_boxed_slice());
            // SAFETY: freed only by `release`, after the request completes
            let data: &'static [u8] = unsafe { &*ptr };
            let request = world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, WIRE_TAG);
            Self { request, frame: ptr }
        }

        /// Completed sends release their frame; pending ones come back.
        fn test(self) -> Option<Self> {
            match self.request.test() {
                Ok(_) => {
                    Self::release(self.frame);
                    None
                }
                Err(request) => Some(Self { request, frame: self.frame }),
            }
        }

        fn finish(self) {
            self.request.wait();
            Self::release(self.frame);
        }

        fn release(frame: *mut [u8]) {
            // SAFETY: allocated in `post`; the request reading it is complete
            drop(unsafe { Box::from_raw(frame) });
        }
    }

    struct MpiInner {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        stash: Mutex<HashMap<(usize, CommTag), VecDeque<Vec<u8>>>>,
        in_flight: Mutex<Vec<InFlight>>,
        // dropped last: finalizes MPI
        _universe: Universe,
    }

    impl MpiInner {
        /// Receive one frame from `peer` and file it under its tag.
        fn pull(&self, peer: usize) {
            self.progress();
            let (frame, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(WIRE_TAG);
            let context = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let tag = u16::from_le_bytes([frame[4], frame[5]]);
            self.stash
                .lock()
                .entry((peer, CommTag::with_context(context, tag)))
                .or_default()
                .push_back(frame[HDR..].to_vec());
        }

        fn take(&self, peer: usize, tag: CommTag) -> Option<Vec<u8>> {
            self.stash
                .lock()
                .get_mut(&(peer, tag))
                .and_then(|q| q.pop_front())
        }

        /// Drop the sends that have completed.
        fn progress(&self) {
            let mut in_flight = self.in_flight.lock();
            let pending = std::mem::take(&mut *in_flight);
            in_flight.extend(pending.into_iter().filter_map(InFlight::test));
        }
    }

    impl Drop for MpiInner {
        fn drop(&mut self) {
            let pending = std::mem::take(self.in_flight.get_mut());
            if !pending.is_empty() {
                log::debug!("rank {}: completing {} pending sends", self.rank, pending.len());
            }
            pending.into_iter().for_each(InFlight::finish);
        }
    }

    /// World communicator backed by MPI immediate sends.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiInner>,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, PioError> {
            let universe = mpi::initialize()
                .ok_or_else(|| PioError::comm(0, "MPI was already initialized"))?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                inner: Arc::new(MpiInner {
                    world,
                    rank,
                    size,
                    stash: Mutex::new(HashMap::new()),
                    in_flight: Mutex::new(Vec::new()),
                    _universe: universe,
                }),
            })
        }

        /// Sends posted but not yet delivered.
        pub fn pending_sends(&self) -> usize {
            self.inner.progress();
            self.inner.in_flight.lock().len()
        }
    }

    pub struct MpiHandle {
        inner: Arc<MpiInner>,
        peer: usize,
        tag: CommTag,
    }

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            loop {
                if let Some(msg) = self.inner.take(self.peer, self.tag) {
                    return Some(msg);
                }
                self.inner.pull(self.peer);
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.inner.rank
        }

        fn size(&self) -> usize {
            self.inner.size
        }

        fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) {
            let mut frame = Vec::with_capacity(HDR + buf.len());
            frame.extend_from_slice(&tag.context().to_le_bytes());
            frame.extend_from_slice(&tag.as_u16().to_le_bytes());
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(buf);
            self.inner.progress();
            let send = InFlight::post(&self.inner.world, peer, frame);
            self.inner.in_flight.lock().push(send);
        }

        fn irecv(&self, peer: usize, tag: CommTag) -> MpiHandle {
            MpiHandle {
                inner: Arc::clone(&self.inner),
                peer,
                tag,
            }
        }

        fn iprobe(&self, peer: usize, tag: CommTag) -> bool {
            self.inner.progress();
            while self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_probe_with_tag(WIRE_TAG)
                .is_some()
            {
                self.inner.pull(peer);
            }
            self.inner
                .stash
                .lock()
                .get(&(peer, tag))
                .is_some_and(|q| !q.is_empty())
        }

        fn abort(&self, code: i32) -> ! {
            log::error!("rank {} aborting MPI job with code {code}", self.inner.rank);
            self.inner.world.abort(code)
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
