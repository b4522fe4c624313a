//! Ids, element types and rearranger kinds.

use serde::{Deserialize, Serialize};

use crate::pio_error::PioError;

/// IOSystem id.
pub type IoSysId = i32;
/// Decomposition id.
pub type IoId = i32;
/// Open file id.
pub type FileId = i32;

/// First IOSystem id handed out.
pub const FIRST_IOSYSID: IoSysId = 65536;
/// First decomposition id handed out.
pub const FIRST_IOID: IoId = 512;
/// First file id handed out.
pub const FIRST_FILEID: FileId = 16;

/// Data rearrangement algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Rearranger {
    /// Contiguous hyper-rectangular regions per IO task.
    Box = 1,
    /// Each compute task feeds exactly one IO task.
    Subset = 2,
}

impl Rearranger {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Rearranger {
    type Error = PioError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Rearranger::Box),
            2 => Ok(Rearranger::Subset),
            other => Err(PioError::invalid(format!("unknown rearranger {other}"))),
        }
    }
}

/// Element type of a distributed array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PioType {
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Float = 5,
    Double = 6,
    UByte = 7,
    UShort = 8,
    UInt = 9,
    Int64 = 10,
    UInt64 = 11,
}

impl PioType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            PioType::Byte | PioType::Char | PioType::UByte => 1,
            PioType::Short | PioType::UShort => 2,
            PioType::Int | PioType::Float | PioType::UInt => 4,
            PioType::Double | PioType::Int64 | PioType::UInt64 => 8,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for PioType {
    type Error = PioError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => PioType::Byte,
            2 => PioType::Char,
            3 => PioType::Short,
            4 => PioType::Int,
            5 => PioType::Float,
            6 => PioType::Double,
            7 => PioType::UByte,
            8 => PioType::UShort,
            9 => PioType::UInt,
            10 => PioType::Int64,
            11 => PioType::UInt64,
            other => return Err(PioError::invalid(format!("unknown element type {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for code in 1..=11 {
            let t = PioType::try_from(code).unwrap();
            assert_eq!(t.code(), code);
            assert!(matches!(t.size(), 1 | 2 | 4 | 8));
        }
        assert!(PioType::try_from(0).is_err());
        assert!(Rearranger::try_from(3).is_err());
        assert_eq!(Rearranger::try_from(2).unwrap(), Rearranger::Subset);
    }
}
