//! Compute-side forwarding and the IO-side dispatch loop.

use crate::async_service::message::{ASYNC_REQUEST_TAG, AsyncRequest, Envelope};
use crate::comm::wire::WireStatus;
use crate::comm::{Comm, Communicator};
use crate::decomp::DecompOptions;
use crate::iosystem::MsgInfo;
use crate::pio_error::{PioError, result_code};
use crate::registry::{ErrorTarget, Pio};
use crate::types::{IoSysId, PioType, Rearranger};

impl<C: Communicator> Pio<C> {
    /// Send `request` from the compute root of an async IOSystem to its IO
    /// root. Collective over the compute channel: every compute task gets
    /// the root's send status. A no-op on IO tasks, on shared IOSystems and
    /// on processes outside the IOSystem.
    pub(crate) fn forward(&mut self, iosysid: IoSysId, request: AsyncRequest) -> Result<(), PioError> {
        let ios = self.iosystem_mut(iosysid)?;
        if !ios.is_async() || ios.is_io {
            return Ok(());
        }
        let (Some(comp), Some(union)) = (ios.comp_comm.clone(), ios.union_comm.clone()) else {
            return Ok(());
        };
        let io_root = ios.io_root();
        let comp_idx = ios.topology.component() as u32;
        let info = ios.next_msg(request.tag().code());
        log::trace!(
            "iosystem {iosysid}: forwarding {:?} seq {}",
            request.tag(),
            info.seq_num
        );

        let sent = if comp.rank() == 0 {
            Envelope {
                comp_idx,
                seq: info.seq_num,
                prev_tag: info.prev_tag,
                request,
            }
            .encode()
            .and_then(|bytes| union.send(io_root, ASYNC_REQUEST_TAG, &bytes))
        } else {
            Ok(())
        };
        let status: WireStatus = comp.bcast_one(0, WireStatus::new(result_code(&sent), 0))?;
        match PioError::from_code(status.code(), "async request not delivered") {
            None => Ok(()),
            Some(remote) => Err(sent.err().unwrap_or(remote)),
        }
    }

    /// Serve requests for `served` until each of them has been finalized.
    ///
    /// `service` spans the IO tasks only; its rank 0 polls the compute roots
    /// and relays every request so all IO tasks dispatch the same sequence.
    pub(crate) fn serve(&mut self, service: &Comm<C>, served: &[IoSysId]) -> Result<(), PioError> {
        let mut open = served
            .iter()
            .map(|&id| Ok((id, self.iosystem(id)?.topology().component() as u32)))
            .collect::<Result<Vec<_>, PioError>>()?;
        log::debug!(
            "rank {}: entering service loop for {} component(s)",
            self.world().rank(),
            open.len()
        );

        while !open.is_empty() {
            let bytes = if service.rank() == 0 {
                let bytes = self.poll(&open)?;
                service.bcast_bytes(0, &bytes)?
            } else {
                service.bcast_bytes(0, &[])?
            };
            let env = Envelope::decode(&bytes)?;
            let Some(&(iosysid, _)) = open.iter().find(|(_, idx)| *idx == env.comp_idx) else {
                return Err(PioError::Internal(format!(
                    "request for unknown component {}",
                    env.comp_idx
                )));
            };
            self.check_sequence(iosysid, &env)?;
            let finalize = matches!(env.request, AsyncRequest::Finalize { .. });
            let tag = env.request.tag();
            if let Err(e) = self.dispatch(env.request) {
                log::error!("iosystem {iosysid}: {tag:?} failed on IO side: {e}");
            }
            if finalize {
                open.retain(|(id, _)| *id != iosysid);
            }
        }
        log::debug!("rank {}: service loop done", self.world().rank());
        Ok(())
    }

    /// Block until some open component has a request; return it.
    fn poll(&self, open: &[(IoSysId, u32)]) -> Result<Vec<u8>, PioError> {
        loop {
            for &(iosysid, _) in open {
                let ios = self.iosystem(iosysid)?;
                let union = ios.union()?;
                let root = ios.comp_root();
                if union.probe(root, ASYNC_REQUEST_TAG) {
                    return union.recv(root, ASYNC_REQUEST_TAG);
                }
            }
            std::thread::yield_now();
        }
    }

    fn check_sequence(&mut self, iosysid: IoSysId, env: &Envelope) -> Result<(), PioError> {
        let ios = self.iosystem_mut(iosysid)?;
        let expected = ios.msg;
        if env.seq != expected.seq_num || env.prev_tag != expected.prev_tag {
            log::warn!(
                "iosystem {iosysid}: request seq {} prev {} but expected seq {} prev {}",
                env.seq,
                env.prev_tag,
                expected.seq_num,
                expected.prev_tag
            );
        }
        ios.msg = MsgInfo {
            seq_num: env.seq + 1,
            prev_tag: env.request.tag().code(),
        };
        Ok(())
    }

    fn dispatch(&mut self, request: AsyncRequest) -> Result<(), PioError> {
        match request {
            AsyncRequest::Finalize { iosysid } => self.finalize(iosysid),
            AsyncRequest::InitDecomp {
                iosysid,
                pio_type,
                dims,
                rearranger,
                iostart,
                iocount,
            } => {
                let pio_type = PioType::try_from(pio_type)?;
                let rearranger = rearranger.map(Rearranger::try_from).transpose()?;
                let widen = |v: Vec<u64>| v.into_iter().map(|d| d as usize).collect::<Vec<_>>();
                let dims = widen(dims);
                let opts = DecompOptions {
                    rearranger,
                    iostart: iostart.map(widen),
                    iocount: iocount.map(widen),
                };
                self.init_decomp(iosysid, pio_type, &dims, &[], opts).map(|_| ())
            }
            AsyncRequest::FreeDecomp { iosysid, ioid } => self.free_decomp(iosysid, ioid),
            AsyncRequest::SetFrame { ncid, varid, frame } => self.set_frame(ncid, varid, frame),
            AsyncRequest::AdvanceFrame { ncid, varid } => self.advance_frame(ncid, varid),
            AsyncRequest::SetErrorHandling { iosysid, method } => self
                .set_error_handling(ErrorTarget::IoSystem(iosysid), method)
                .map(|_| ()),
            AsyncRequest::OpenFile { iosysid } => self.open_file(iosysid).map(|_| ()),
            AsyncRequest::CloseFile { ncid } => self.close_file(ncid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_service::message::MsgTag;
    use crate::comm::NoComm;
    use crate::config::PioConfig;
    use crate::iosystem::MSG_START_SEQ_NUM;

    fn serial_pio() -> (Pio<NoComm>, IoSysId) {
        let world = Comm::world(NoComm);
        let mut pio = Pio::new(&world, PioConfig::returning_errors());
        let id = pio.init_shared(&world, 1, 1, 0, Rearranger::Box).unwrap();
        (pio, id)
    }

    #[test]
    fn out_of_order_request_resyncs() {
        let (mut pio, id) = serial_pio();
        let env = Envelope {
            comp_idx: 0,
            seq: MSG_START_SEQ_NUM + 7,
            prev_tag: MsgTag::CloseFile.code(),
            request: AsyncRequest::OpenFile { iosysid: id },
        };
        // a mismatch is reported but does not stop the loop
        pio.check_sequence(id, &env).unwrap();
        let info = pio.iosystem(id).unwrap().msg_info();
        assert_eq!(info.seq_num, env.seq + 1);
        assert_eq!(info.prev_tag, MsgTag::OpenFile.code());

        // the next request in order is accepted as is
        let next = Envelope {
            seq: env.seq + 1,
            prev_tag: MsgTag::OpenFile.code(),
            request: AsyncRequest::CloseFile { ncid: 16 },
            ..env
        };
        pio.check_sequence(id, &next).unwrap();
        assert_eq!(pio.iosystem(id).unwrap().msg_info().seq_num, env.seq + 2);
    }

    #[test]
    fn dispatch_carries_explicit_regions() {
        let (mut pio, id) = serial_pio();
        pio.dispatch(AsyncRequest::InitDecomp {
            iosysid: id,
            pio_type: PioType::Int.code(),
            dims: vec![6],
            rearranger: Some(Rearranger::Box.code()),
            iostart: Some(vec![2]),
            iocount: Some(vec![3]),
        })
        .unwrap();
        let (_, d) = pio.decomps.iter().next().unwrap();
        assert_eq!(d.regions()[0].start, vec![2]);
        assert_eq!(d.io_buffer_len(), 3);
    }
}
