//! PioError: unified error type for pio-core public APIs
//!
//! Every public operation returns `Result<_, PioError>`. Each variant maps to a
//! stable integer code so that a failure observed on one process can be
//! broadcast and rebuilt on the others (see [`crate::error_policy`]).

use thiserror::Error;

/// Success code carried on the wire.
pub const PIO_NOERR: i32 = 0;
/// Unknown IOSystem, decomposition or file id.
pub const PIO_EBADID: i32 = -33;
/// Malformed dims, ranks, ids, modes or a missing required argument.
pub const PIO_EINVAL: i32 = -36;
/// Allocation failure.
pub const PIO_ENOMEM: i32 = -61;
/// A messaging substrate primitive failed.
pub const PIO_ECOMM: i32 = -100;
/// Protocol desynchronization or unreachable state.
pub const PIO_EINTERNAL: i32 = -500;

/// Unified error type for pio-core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PioError {
    /// Malformed argument (dims, ranks, ids, modes, null required argument).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// No open object with this id.
    #[error("{kind} id {id} not found")]
    NotFound { kind: &'static str, id: i32 },
    /// A buffer could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// Communication with `neighbor` failed.
    #[error("communication failure with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<CommFailure>,
    },
    /// Protocol desynchronization or an unreachable state.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Boxed description of a failed substrate primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommFailure(pub String);

impl From<String> for Box<CommFailure> {
    fn from(s: String) -> Self {
        Box::new(CommFailure(s))
    }
}

impl From<&str> for Box<CommFailure> {
    fn from(s: &str) -> Self {
        Box::new(CommFailure(s.to_string()))
    }
}

impl PioError {
    /// Shorthand for [`PioError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        PioError::InvalidArgument(msg.into())
    }

    /// Shorthand for a [`PioError::CommError`] against `neighbor`.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        PioError::CommError {
            neighbor,
            source: msg.into().into(),
        }
    }

    /// Integer code of this error.
    pub fn code(&self) -> i32 {
        match self {
            PioError::InvalidArgument(_) => PIO_EINVAL,
            PioError::NotFound { .. } => PIO_EBADID,
            PioError::OutOfMemory(_) => PIO_ENOMEM,
            PioError::CommError { .. } => PIO_ECOMM,
            PioError::Internal(_) => PIO_EINTERNAL,
        }
    }

    /// Rebuild an error from a code received from another process.
    ///
    /// Returns `None` for [`PIO_NOERR`]. Unknown codes become
    /// [`PioError::Internal`].
    pub fn from_code(code: i32, context: &str) -> Option<Self> {
        let err = match code {
            PIO_NOERR => return None,
            PIO_EINVAL => PioError::InvalidArgument(context.to_string()),
            PIO_EBADID => PioError::NotFound { kind: "object", id: -1 },
            PIO_ENOMEM => PioError::OutOfMemory(context.to_string()),
            PIO_ECOMM => PioError::comm(usize::MAX, context),
            other => PioError::Internal(format!("{context} (code {other})")),
        };
        Some(err)
    }
}

impl From<bincode::Error> for PioError {
    fn from(e: bincode::Error) -> Self {
        PioError::Internal(format!("malformed async payload: {e}"))
    }
}

/// Collapse a result into its wire code.
pub fn result_code<T>(r: &Result<T, PioError>) -> i32 {
    match r {
        Ok(_) => PIO_NOERR,
        Err(e) => e.code(),
    }
}
