//! The per-process library handle.
//!
//! [`Pio`] owns every open IOSystem, decomposition and file of one process,
//! the id counters, the library-wide default error handling, the shared
//! staging pool and the storage backend. Nothing here is global: create one
//! handle per process with [`Pio::new`] and drop it (or call
//! [`Pio::teardown`]) when done.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::async_service::message::AsyncRequest;
use crate::comm::{Comm, Communicator, World};
use crate::config::PioConfig;
use crate::decomp::Decomposition;
use crate::error_policy::{self, ErrorHandling};
use crate::frame::{self, OpenFile};
use crate::iosystem::IoSystem;
use crate::pio_error::PioError;
use crate::storage::{IoType, NoStorage, StorageBackend};
use crate::types::{FIRST_FILEID, FIRST_IOID, FIRST_IOSYSID, FileId, IoId, IoSysId};

/// Which error handling setting to change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorTarget {
    /// Library default, inherited by IOSystems created afterwards.
    Default,
    IoSystem(IoSysId),
}

/// Staging memory shared by every open IOSystem of a process.
#[derive(Debug)]
pub(crate) struct BufferPool {
    buf: BytesMut,
}

impl BufferPool {
    fn new(bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(bytes),
        }
    }

    /// Fill `n` consecutive chunks through `fill` and hand them out frozen.
    /// Capacity is reclaimed once the chunks are dropped.
    pub(crate) fn pack_with<F>(&mut self, n: usize, mut fill: F) -> Vec<Bytes>
    where
        F: FnMut(usize, &mut BytesMut),
    {
        self.buf.clear();
        (0..n)
            .map(|i| {
                fill(i, &mut self.buf);
                self.buf.split().freeze()
            })
            .collect()
    }
}

pub struct Pio<C: Communicator> {
    world: Arc<World<C>>,
    config: PioConfig,
    default_error_handling: ErrorHandling,
    pub(crate) iosystems: BTreeMap<IoSysId, IoSystem<C>>,
    pub(crate) decomps: BTreeMap<IoId, Decomposition>,
    pub(crate) files: BTreeMap<FileId, OpenFile>,
    next_iosysid: IoSysId,
    next_ioid: IoId,
    next_ncid: FileId,
    pool: Option<BufferPool>,
    uniq_counter: usize,
    pub(crate) storage: Box<dyn StorageBackend>,
}

impl<C: Communicator> std::fmt::Debug for Pio<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pio")
            .field("rank", &self.world.rank())
            .field("iosystems", &self.iosystems.keys().collect::<Vec<_>>())
            .field("decomps", &self.decomps.keys().collect::<Vec<_>>())
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("pool", &self.pool.is_some())
            .finish()
    }
}

impl<C: Communicator> Pio<C> {
    /// Initialize the library for this process. `world` is any channel of
    /// the job; only its endpoint is kept (for aborts).
    pub fn new(world: &Comm<C>, config: PioConfig) -> Self {
        Self::with_storage(world, config, Box::new(NoStorage))
    }

    pub fn with_storage(world: &Comm<C>, config: PioConfig, storage: Box<dyn StorageBackend>) -> Self {
        let default_error_handling = config.default_error_handling;
        Self {
            world: Arc::clone(world.world_endpoint()),
            config,
            default_error_handling,
            iosystems: BTreeMap::new(),
            decomps: BTreeMap::new(),
            files: BTreeMap::new(),
            next_iosysid: FIRST_IOSYSID,
            next_ioid: FIRST_IOID,
            next_ncid: FIRST_FILEID,
            pool: None,
            uniq_counter: 0,
            storage,
        }
    }

    /// Drop every record without talking to other processes.
    pub fn teardown(mut self) {
        if !self.iosystems.is_empty() {
            log::warn!(
                "rank {}: tearing down with {} iosystem(s) still open",
                self.world.rank(),
                self.iosystems.len()
            );
        }
        self.files.clear();
        self.decomps.clear();
        self.iosystems.clear();
        self.pool = None;
        self.uniq_counter = 0;
        self.default_error_handling = self.config.default_error_handling;
    }

    pub fn config(&self) -> &PioConfig {
        &self.config
    }

    pub fn world(&self) -> &Arc<World<C>> {
        &self.world
    }

    pub fn default_error_handling(&self) -> ErrorHandling {
        self.default_error_handling
    }

    // ----- lookups -----

    pub fn iosystem(&self, iosysid: IoSysId) -> Result<&IoSystem<C>, PioError> {
        self.iosystems.get(&iosysid).ok_or(PioError::NotFound {
            kind: "iosystem",
            id: iosysid,
        })
    }

    pub(crate) fn iosystem_mut(&mut self, iosysid: IoSysId) -> Result<&mut IoSystem<C>, PioError> {
        self.iosystems.get_mut(&iosysid).ok_or(PioError::NotFound {
            kind: "iosystem",
            id: iosysid,
        })
    }

    pub fn decomposition(&self, ioid: IoId) -> Result<&Decomposition, PioError> {
        self.decomps.get(&ioid).ok_or(PioError::NotFound {
            kind: "decomposition",
            id: ioid,
        })
    }

    pub(crate) fn file(&self, ncid: FileId) -> Result<&OpenFile, PioError> {
        self.files.get(&ncid).ok_or(PioError::NotFound {
            kind: "file",
            id: ncid,
        })
    }

    pub fn num_iosystems(&self) -> usize {
        self.iosystems.len()
    }

    /// Is the shared staging pool currently held?
    pub fn buffer_pool_active(&self) -> bool {
        self.pool.is_some()
    }

    /// A decomposition, its IOSystem and the staging pool, borrowed together.
    pub(crate) fn transfer_parts(
        &mut self,
        ioid: IoId,
    ) -> Result<(&Decomposition, &IoSystem<C>, &mut BufferPool), PioError> {
        let decomp = self
            .decomps
            .get(&ioid)
            .ok_or(PioError::NotFound { kind: "decomposition", id: ioid })?;
        let ios = self
            .iosystems
            .get(&decomp.iosysid)
            .ok_or(PioError::NotFound { kind: "iosystem", id: decomp.iosysid })?;
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| PioError::Internal("buffer pool used with no open iosystem".into()))?;
        Ok((decomp, ios, pool))
    }

    /// Route `r` through the error mode of `iosysid` (or the library
    /// default when the IOSystem is unknown).
    pub(crate) fn policy<T>(&self, iosysid: Option<IoSysId>, r: Result<T, PioError>) -> Result<T, PioError> {
        let mode = iosysid
            .and_then(|id| self.iosystems.get(&id))
            .map(|ios| ios.error_handling)
            .unwrap_or(self.default_error_handling);
        error_policy::apply(mode, &self.world, r)
    }

    // ----- ids -----

    /// Take `count` consecutive ids from `counter`, agreed over `scope` when
    /// given.
    fn take_ids(counter: &mut i32, scope: Option<&Comm<C>>, count: i32) -> Result<i32, PioError> {
        let first = match scope {
            Some(comm) => comm.allreduce(*counter, i32::max)?,
            None => *counter,
        };
        *counter = first + count;
        Ok(first)
    }

    pub(crate) fn take_iosysids(&mut self, scope: Option<&Comm<C>>, count: usize) -> Result<IoSysId, PioError> {
        Self::take_ids(&mut self.next_iosysid, scope, count as i32)
    }

    pub(crate) fn take_ioid(&mut self, scope: Option<&Comm<C>>) -> Result<IoId, PioError> {
        Self::take_ids(&mut self.next_ioid, scope, 1)
    }

    fn take_ncid(&mut self, scope: Option<&Comm<C>>) -> Result<FileId, PioError> {
        Self::take_ids(&mut self.next_ncid, scope, 1)
    }

    pub(crate) fn next_uniq(&mut self) -> usize {
        let c = self.uniq_counter;
        self.uniq_counter += 1;
        c
    }

    /// Add a freshly built IOSystem; the staging pool is created with the
    /// first one.
    pub(crate) fn register_iosystem(&mut self, ios: IoSystem<C>) {
        if self.pool.is_none() {
            log::debug!(
                "rank {}: allocating {} byte buffer pool",
                self.world.rank(),
                self.config.buffer_pool_bytes
            );
            self.pool = Some(BufferPool::new(self.config.buffer_pool_bytes));
        }
        self.iosystems.insert(ios.id, ios);
    }

    // ----- lifecycle -----

    /// Close an IOSystem. Collective over its union channel; on an async
    /// IOSystem the compute side tells the IO side first.
    pub fn finalize(&mut self, iosysid: IoSysId) -> Result<(), PioError> {
        let mode = self
            .iosystems
            .get(&iosysid)
            .map(|ios| ios.error_handling)
            .unwrap_or(self.default_error_handling);
        let r = self.finalize_inner(iosysid);
        error_policy::apply(mode, &self.world, r)
    }

    fn finalize_inner(&mut self, iosysid: IoSysId) -> Result<(), PioError> {
        let ios = self.iosystem(iosysid)?;
        if ios.is_async() && ios.is_active() {
            self.forward(iosysid, AsyncRequest::Finalize { iosysid })?;
        }
        self.files.retain(|_, f| f.iosysid != iosysid);
        self.decomps.retain(|_, d| d.iosysid() != iosysid);
        self.iosystems.remove(&iosysid);
        log::debug!(
            "rank {}: finalized iosystem {iosysid}, {} still open",
            self.world.rank(),
            self.iosystems.len()
        );
        if self.iosystems.is_empty() && self.pool.take().is_some() {
            log::debug!("rank {}: released buffer pool", self.world.rank());
        }
        Ok(())
    }

    // ----- queries -----

    pub fn iosystem_is_active(&self, iosysid: IoSysId) -> Result<bool, PioError> {
        Ok(self.iosystem(iosysid)?.is_active())
    }

    pub fn iam_iotask(&self, iosysid: IoSysId) -> Result<bool, PioError> {
        Ok(self.iosystem(iosysid)?.is_io_proc())
    }

    /// Rank in the IO channel, `None` on tasks that do no IO.
    pub fn iotask_rank(&self, iosysid: IoSysId) -> Result<Option<usize>, PioError> {
        Ok(self.iosystem(iosysid)?.io_rank())
    }

    pub fn num_iotasks(&self, iosysid: IoSysId) -> Result<usize, PioError> {
        Ok(self.iosystem(iosysid)?.num_io_tasks())
    }

    /// Length of the local map of a decomposition.
    pub fn local_array_size(&self, ioid: IoId) -> Result<usize, PioError> {
        Ok(self.decomposition(ioid)?.maplen())
    }

    pub fn iotype_available(&self, iotype: IoType) -> bool {
        self.storage.iotype_available(iotype)
    }

    // ----- settings -----

    /// Change an error handling mode and return the previous one.
    ///
    /// An unknown `method` is refused with `InvalidArgument` and nothing
    /// changes. Under an async IOSystem a compute task forwards the change to
    /// the IO side first.
    pub fn set_error_handling(&mut self, target: ErrorTarget, method: i32) -> Result<ErrorHandling, PioError> {
        let mode = ErrorHandling::try_from(method)?;
        match target {
            ErrorTarget::Default => {
                let old = std::mem::replace(&mut self.default_error_handling, mode);
                log::debug!("default error handling {old:?} -> {mode:?}");
                Ok(old)
            }
            ErrorTarget::IoSystem(iosysid) => {
                let ios = self.iosystem(iosysid)?;
                if ios.is_async() && ios.is_active() {
                    self.forward(iosysid, AsyncRequest::SetErrorHandling { iosysid, method })?;
                }
                let ios = self.iosystem_mut(iosysid)?;
                Ok(std::mem::replace(&mut ios.error_handling, mode))
            }
        }
    }

    /// Per-file variant: changes the owning IOSystem's mode.
    #[deprecated(note = "use set_error_handling with ErrorTarget::IoSystem")]
    pub fn set_file_error_handling(&mut self, ncid: FileId, method: i32) -> Result<ErrorHandling, PioError> {
        let iosysid = self.file(ncid)?.iosysid;
        self.set_error_handling(ErrorTarget::IoSystem(iosysid), method)
    }

    /// Store a hint for the storage layer; kept on IO tasks only.
    pub fn set_hint(&mut self, iosysid: IoSysId, key: &str, value: &str) -> Result<(), PioError> {
        let r = self.set_hint_inner(iosysid, key, value);
        self.policy(Some(iosysid), r)
    }

    fn set_hint_inner(&mut self, iosysid: IoSysId, key: &str, value: &str) -> Result<(), PioError> {
        if key.is_empty() {
            return Err(PioError::invalid("empty hint key"));
        }
        let ios = self.iosystem_mut(iosysid)?;
        if ios.is_io {
            ios.hints.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Box target block size in bytes; non-positive values are ignored.
    pub fn set_blocksize(&mut self, bytes: i64) {
        if bytes > 0 {
            self.config.box_blocksize = bytes as usize;
        }
    }

    // ----- files and frames -----

    /// Register a file under `iosysid`. Collective over the union channel of
    /// async IOSystems, where the id is agreed.
    pub fn open_file(&mut self, iosysid: IoSysId) -> Result<FileId, PioError> {
        let r = self.open_file_inner(iosysid);
        self.policy(Some(iosysid), r)
    }

    fn open_file_inner(&mut self, iosysid: IoSysId) -> Result<FileId, PioError> {
        let ios = self.iosystem(iosysid)?;
        let scope = if ios.is_async() {
            Some(ios.union()?.clone())
        } else {
            None
        };
        if ios.is_async() {
            self.forward(iosysid, AsyncRequest::OpenFile { iosysid })?;
        }
        let ncid = self.take_ncid(scope.as_ref())?;
        self.files.insert(ncid, OpenFile::new(ncid, iosysid));
        log::debug!("rank {}: file {ncid} open on iosystem {iosysid}", self.world.rank());
        Ok(ncid)
    }

    pub fn close_file(&mut self, ncid: FileId) -> Result<(), PioError> {
        let iosysid = self.files.get(&ncid).map(|f| f.iosysid);
        let r = self.close_file_inner(ncid);
        self.policy(iosysid, r)
    }

    fn close_file_inner(&mut self, ncid: FileId) -> Result<(), PioError> {
        let iosysid = self.file(ncid)?.iosysid;
        if self.iosystem(iosysid)?.is_async() {
            self.forward(iosysid, AsyncRequest::CloseFile { ncid })?;
        }
        self.files.remove(&ncid);
        Ok(())
    }

    pub fn file_is_open(&self, ncid: FileId) -> bool {
        self.files.contains_key(&ncid)
    }

    /// Current frame of `varid` in `ncid`.
    pub fn frame(&self, ncid: FileId, varid: i32) -> Result<i32, PioError> {
        self.file(ncid)?.frames().get(varid)
    }

    /// Set the frame of a variable; negative values become -1.
    pub fn set_frame(&mut self, ncid: FileId, varid: i32, frame: i32) -> Result<(), PioError> {
        let iosysid = self.files.get(&ncid).map(|f| f.iosysid);
        let r = self.set_frame_inner(ncid, varid, frame);
        self.policy(iosysid, r)
    }

    fn set_frame_inner(&mut self, ncid: FileId, varid: i32, frame: i32) -> Result<(), PioError> {
        let frame = frame::normalize_frame(frame);
        let iosysid = self.file(ncid)?.iosysid;
        frame::check_varid(varid)?;
        if self.iosystem(iosysid)?.is_async() {
            self.forward(iosysid, AsyncRequest::SetFrame { ncid, varid, frame })?;
        }
        self.files
            .get_mut(&ncid)
            .ok_or(PioError::NotFound { kind: "file", id: ncid })?
            .frames_mut()
            .set(varid, frame)
    }

    /// Move a variable to its next record.
    pub fn advance_frame(&mut self, ncid: FileId, varid: i32) -> Result<(), PioError> {
        let iosysid = self.files.get(&ncid).map(|f| f.iosysid);
        let r = self.advance_frame_inner(ncid, varid);
        self.policy(iosysid, r)
    }

    fn advance_frame_inner(&mut self, ncid: FileId, varid: i32) -> Result<(), PioError> {
        let iosysid = self.file(ncid)?.iosysid;
        frame::check_varid(varid)?;
        if self.iosystem(iosysid)?.is_async() {
            self.forward(iosysid, AsyncRequest::AdvanceFrame { ncid, varid })?;
        }
        self.files
            .get_mut(&ncid)
            .ok_or(PioError::NotFound { kind: "file", id: ncid })?
            .frames_mut()
            .advance(varid)
            .map(|_| ())
    }
}
