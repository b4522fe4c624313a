//! Remote-call protocol between compute tasks and a dedicated IO pool.
//!
//! A compute task calling an operation on an async IOSystem first sends an
//! [`message::Envelope`] from its compute root to the IO root, then does its
//! own share of the work. IO tasks sit in [`crate::Pio`]'s service loop,
//! receive the same envelope and run the same operation, so both sides meet
//! in whatever collectives the operation needs.

mod handler;
pub mod message;

pub use message::{ASYNC_REQUEST_TAG, AsyncRequest, Envelope, MsgTag};
