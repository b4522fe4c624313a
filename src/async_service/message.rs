//! Request envelope of the async service: a fixed header followed by a
//! `bincode` payload.

use serde::{Deserialize, Serialize};

use crate::comm::wire::{WIRE_VERSION, WireMsgHdr, cast_slice, read_one};
use crate::pio_error::PioError;
use crate::types::{FileId, IoId, IoSysId};

/// Channel tag of requests travelling from a compute root to the IO root.
pub const ASYNC_REQUEST_TAG: u16 = 0x0A51;

/// Operation carried by a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgTag {
    Invalid = 0,
    OpenFile = 1,
    CloseFile = 2,
    InitDecomp = 3,
    FreeDecomp = 4,
    SetFrame = 5,
    AdvanceFrame = 6,
    SetErrorHandling = 7,
    Finalize = 8,
}

impl MsgTag {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Arguments of a forwarded operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncRequest {
    Finalize {
        iosysid: IoSysId,
    },
    InitDecomp {
        iosysid: IoSysId,
        pio_type: i32,
        dims: Vec<u64>,
        rearranger: Option<i32>,
        /// Explicit Box region, used by every IO task.
        iostart: Option<Vec<u64>>,
        iocount: Option<Vec<u64>>,
    },
    FreeDecomp {
        iosysid: IoSysId,
        ioid: IoId,
    },
    SetFrame {
        ncid: FileId,
        varid: i32,
        frame: i32,
    },
    AdvanceFrame {
        ncid: FileId,
        varid: i32,
    },
    SetErrorHandling {
        iosysid: IoSysId,
        method: i32,
    },
    OpenFile {
        iosysid: IoSysId,
    },
    CloseFile {
        ncid: FileId,
    },
}

impl AsyncRequest {
    pub fn tag(&self) -> MsgTag {
        match self {
            AsyncRequest::Finalize { .. } => MsgTag::Finalize,
            AsyncRequest::InitDecomp { .. } => MsgTag::InitDecomp,
            AsyncRequest::FreeDecomp { .. } => MsgTag::FreeDecomp,
            AsyncRequest::SetFrame { .. } => MsgTag::SetFrame,
            AsyncRequest::AdvanceFrame { .. } => MsgTag::AdvanceFrame,
            AsyncRequest::SetErrorHandling { .. } => MsgTag::SetErrorHandling,
            AsyncRequest::OpenFile { .. } => MsgTag::OpenFile,
            AsyncRequest::CloseFile { .. } => MsgTag::CloseFile,
        }
    }
}

/// Header plus request, as sent on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub comp_idx: u32,
    pub seq: u64,
    pub prev_tag: u16,
    pub request: AsyncRequest,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, PioError> {
        let payload = bincode::serialize(&self.request)?;
        let hdr = WireMsgHdr::new(
            self.request.tag().code(),
            self.comp_idx,
            self.seq,
            self.prev_tag,
            payload.len(),
        );
        let mut out = Vec::with_capacity(WireMsgHdr::SIZE + payload.len());
        out.extend_from_slice(cast_slice(&[hdr]));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PioError> {
        if bytes.len() < WireMsgHdr::SIZE {
            return Err(PioError::Internal(format!(
                "async request of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let (head, payload) = bytes.split_at(WireMsgHdr::SIZE);
        let hdr: WireMsgHdr = read_one(head)?;
        if hdr.version() != WIRE_VERSION {
            return Err(PioError::Internal(format!(
                "async request version {} (expected {WIRE_VERSION})",
                hdr.version()
            )));
        }
        if hdr.payload_len() != payload.len() {
            return Err(PioError::Internal(format!(
                "async payload announced {} bytes, got {}",
                hdr.payload_len(),
                payload.len()
            )));
        }
        let request: AsyncRequest = bincode::deserialize(payload)?;
        if request.tag().code() != hdr.tag() {
            return Err(PioError::Internal(format!(
                "header tag {} does not match payload {:?}",
                hdr.tag(),
                request.tag()
            )));
        }
        Ok(Self {
            comp_idx: hdr.comp_idx(),
            seq: hdr.seq(),
            prev_tag: hdr.prev_tag(),
            request,
        })
    }
}
