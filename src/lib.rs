#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pio-core
//!
//! pio-core is the process-topology and data-rearrangement core of a
//! parallel IO library. A set of compute tasks holding pieces of large
//! multi-dimensional arrays is paired with a (possibly disjoint) set of IO
//! tasks; the crate builds the channels between them, computes how array
//! elements move from one side to the other, and carries remote requests to
//! a dedicated IO pool.
//!
//! ## Features
//! - Three topologies: IO tasks inside the compute set
//!   ([`Pio::init_shared`]), a dedicated IO pool serving several compute
//!   components ([`Pio::init_async`]), or pre-split channels joined by an
//!   inter-group channel ([`Pio::init_intercomm`])
//! - Box and Subset rearrangers producing per-task send/receive plans, and
//!   typed data movement along them
//! - A request protocol (versioned `bytemuck` header, `bincode` payload)
//!   between compute roots and the IO pool
//! - Per-IOSystem error handling: abort, agree, or return
//! - Pluggable messaging backends: serial, in-process threads, MPI
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! pio-core = "0.3"
//! # features = ["mpi-support"]
//! ```
//!
//! Every process owns one [`Pio`] handle; there is no global state.
//!
//! ```
//! use pio_core::prelude::*;
//!
//! let world = Comm::world(NoComm);
//! let mut pio = Pio::new(&world, PioConfig::default());
//! let ios = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
//! let ioid = pio
//!     .init_decomp(ios, PioType::Int, &[4], &[1, 2, 3, 4], DecompOptions::default())
//!     .unwrap();
//! let iobuf = pio.rearrange_comp2io(ioid, &[10i32, 20, 30, 40]).unwrap();
//! assert_eq!(iobuf, vec![10, 20, 30, 40]);
//! pio.finalize(ios).unwrap();
//! ```

pub mod async_service;
pub mod comm;
pub mod config;
pub mod decomp;
pub mod error_policy;
pub mod frame;
pub mod iosystem;
pub mod pio_error;
pub mod registry;
pub mod storage;
pub mod topology;
pub mod types;

pub use config::PioConfig;
pub use decomp::{DecompOptions, Decomposition, Region};
pub use error_policy::ErrorHandling;
pub use iosystem::{IoSystem, Topology, UnionLayout};
pub use pio_error::PioError;
pub use registry::{ErrorTarget, Pio};
pub use topology::AsyncLayout;
pub use types::{FileId, IoId, IoSysId, PioType, Rearranger};

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::comm::{Comm, Communicator, LocalUniverse, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::config::PioConfig;
    pub use crate::decomp::{DecompOptions, Decomposition};
    pub use crate::error_policy::ErrorHandling;
    pub use crate::pio_error::PioError;
    pub use crate::registry::{ErrorTarget, Pio};
    pub use crate::storage::{IoType, StorageBackend};
    pub use crate::topology::AsyncLayout;
    pub use crate::types::{IoId, IoSysId, PioType, Rearranger};
}
