//! Messaging substrate: transports, groups, channels and collectives.

pub mod communicator;
pub mod group;
pub mod intercomm;
pub mod intracomm;
pub mod wire;

pub use communicator::{CommTag, Communicator, LocalUniverse, NoComm, ThreadComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
pub use group::Group;
pub use intercomm::InterComm;
pub use intracomm::{Comm, MAX_USER_TAG, World};
