//! Open-file bookkeeping and per-variable record frames.

use std::collections::BTreeMap;

use crate::pio_error::PioError;
use crate::types::{FileId, IoSysId};

/// Upper bound (exclusive) on variable ids in one file.
pub const MAX_VARS: i32 = 8192;
/// Frame of a variable with no record dimension.
pub const NO_FRAME: i32 = -1;

/// State the core keeps for one open file.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub ncid: FileId,
    pub iosysid: IoSysId,
    frames: FileFrames,
}

impl OpenFile {
    pub fn new(ncid: FileId, iosysid: IoSysId) -> Self {
        Self {
            ncid,
            iosysid,
            frames: FileFrames::default(),
        }
    }

    pub fn frames(&self) -> &FileFrames {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FileFrames {
        &mut self.frames
    }
}

/// Active record index of every variable of one file. Variables never
/// touched report [`NO_FRAME`].
#[derive(Debug, Clone, Default)]
pub struct FileFrames {
    record: BTreeMap<i32, i32>,
}

pub fn check_varid(varid: i32) -> Result<(), PioError> {
    if (0..MAX_VARS).contains(&varid) {
        Ok(())
    } else {
        Err(PioError::invalid(format!(
            "variable id {varid} outside 0..{MAX_VARS}"
        )))
    }
}

/// Negative frames mean "no record dimension".
pub fn normalize_frame(frame: i32) -> i32 {
    if frame < 0 {
        log::trace!("resetting frame {frame} to {NO_FRAME}");
        NO_FRAME
    } else {
        frame
    }
}

impl FileFrames {
    pub fn get(&self, varid: i32) -> Result<i32, PioError> {
        check_varid(varid)?;
        Ok(self.record.get(&varid).copied().unwrap_or(NO_FRAME))
    }

    pub fn set(&mut self, varid: i32, frame: i32) -> Result<(), PioError> {
        check_varid(varid)?;
        self.record.insert(varid, normalize_frame(frame));
        Ok(())
    }

    /// Move to the next record and return it.
    pub fn advance(&mut self, varid: i32) -> Result<i32, PioError> {
        check_varid(varid)?;
        let slot = self.record.entry(varid).or_insert(NO_FRAME);
        *slot = slot.saturating_add(1);
        Ok(*slot)
    }
}
