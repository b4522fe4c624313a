//! Per-IOSystem error handling modes.
//!
//! * [`ErrorHandling::Internal`] aborts the whole job on the first error.
//! * [`ErrorHandling::Broadcast`] makes every member of a collective scope
//!   observe the same code at each agreement point.
//! * [`ErrorHandling::Return`] hands the error to the calling process only;
//!   collective state may diverge across ranks.

use serde::{Deserialize, Serialize};

use crate::comm::{Comm, Communicator, World};
use crate::pio_error::{PIO_NOERR, PioError, result_code};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorHandling {
    #[default]
    Internal = -51,
    Broadcast = -52,
    Return = -53,
}

impl ErrorHandling {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ErrorHandling {
    type Error = PioError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            -51 => Ok(ErrorHandling::Internal),
            -52 => Ok(ErrorHandling::Broadcast),
            -53 => Ok(ErrorHandling::Return),
            other => Err(PioError::invalid(format!(
                "unknown error handling method {other}"
            ))),
        }
    }
}

/// Apply `mode` to a result observed by this process alone.
pub fn apply<C: Communicator, T>(
    mode: ErrorHandling,
    world: &World<C>,
    r: Result<T, PioError>,
) -> Result<T, PioError> {
    match r {
        Err(e) if mode == ErrorHandling::Internal => {
            log::error!("rank {}: {e}; aborting", world.rank());
            world.abort(e.code())
        }
        other => other,
    }
}

/// Collective agreement point over `scope`.
///
/// Under `Broadcast` every member reports its code and all of them return
/// the most severe one (lowest code). `Return` and `Internal` behave as in
/// [`apply`] and involve no communication.
pub fn agree<C: Communicator>(
    mode: ErrorHandling,
    scope: &Comm<C>,
    r: Result<(), PioError>,
) -> Result<(), PioError> {
    if mode != ErrorHandling::Broadcast {
        return apply(mode, scope.world_endpoint(), r);
    }
    let local = result_code(&r);
    let agreed = scope.allreduce_min_i32(local)?;
    if agreed == PIO_NOERR {
        return Ok(());
    }
    match r {
        Err(e) if e.code() == agreed => Err(e),
        _ => Err(PioError::from_code(agreed, "error reported by another member")
            .unwrap_or_else(|| PioError::Internal("lost error code".into()))),
    }
}
