//! One imported device: port state, endpoint map, request ledger and the
//! transport the PDUs travel over.
//!
//! Submitters call [`DeviceSession::submit`] and [`DeviceSession::unlink`]
//! from any thread. A single reader calls [`DeviceSession::receive`] in a
//! loop, which decodes every reply and completes the request it belongs to.

use std::{
    io,
    num::NonZeroU16,
    sync::{Mutex, PoisonError, RwLock},
};

use crate::{
    UsbSpeed, UsbDeviceInfo,
    descriptor::EndpointMap,
    ledger::{Ledger, LedgerEntry, LedgerError, RequestState},
    net::Transport,
    proto::{
        Command, Direction, HeaderBody, Pdu, PduHeader, ProtocolError, SeqNum,
        pdu::{MAX_ISO_PACKETS, USBIP_HEADER_SIZE},
    },
    status::UsbdStatus,
    transfer::{self, DecodeError, EncodeContext, EncodeError},
    urb::{Completion, ResetPipe, TrackedRequest, TransferError, TransferRequest},
};

use self::state::{DeviceState, PortState, TransitionError};

pub mod state;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionConfig {
    /// Upper bound for packets per isochronous transfer
    pub max_iso_packets: u32,
    /// Clear the halt of a bulk, interrupt or isochronous endpoint after it
    /// returned a STALL
    pub reset_pipe_on_stall: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iso_packets: MAX_ISO_PACKETS,
            reset_pipe_on_stall: true,
        }
    }
}

/// Identity of the remote device, cached from the import reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeviceMetadata {
    /// `bus_num << 16 | dev_num` on the exporting host
    pub devid: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub speed: UsbSpeed,
}

impl From<&UsbDeviceInfo> for DeviceMetadata {
    fn from(info: &UsbDeviceInfo) -> Self {
        Self {
            devid: info.devid(),
            id_vendor: info.id_vendor,
            id_product: info.id_product,
            speed: info.speed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("device is gone")]
    DeviceGone,
    #[error("device is not connected (state is {0})")]
    NotConnected(DeviceState),
    #[error("failed to encode request ({0})")]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Ledger(LedgerError),
    /// The request has already been completed with
    /// [`TransferError::DeviceGone`]
    #[error("failed to send request {seqnum} ({source})")]
    Transport {
        seqnum: SeqNum,
        #[source]
        source: io::Error,
    },
}

impl From<LedgerError> for SubmitError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Closed => Self::DeviceGone,
            e => Self::Ledger(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("transport failed ({0})")]
    Transport(#[from] io::Error),
    #[error("malformed reply ({0})")]
    Protocol(#[from] ProtocolError),
}

/// What happened to an inbound reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply completed the request with this sequence number
    Completed(SeqNum),
    /// The server acknowledged a `CMD_UNLINK`
    Unlinked { seqnum: SeqNum, target: SeqNum },
    /// Nothing was waiting for the reply, usually because the request was
    /// canceled. The reply has been consumed and dropped.
    CorrelationMiss(SeqNum),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub device: DeviceMetadata,
    pub state: DeviceState,
    pub port: u16,
    pub pending: usize,
    pub sent: usize,
    pub requests: Vec<LedgerEntry>,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct DeviceSession<T> {
    metadata: DeviceMetadata,
    config: SessionConfig,
    port: Mutex<PortState>,
    endpoints: RwLock<EndpointMap>,
    ledger: Ledger,
    #[derivative(Debug = "ignore")]
    transport: T,
}

impl<T: Transport> DeviceSession<T> {
    /// Creates an unplugged session. Only the default pipe is known until
    /// [`DeviceSession::set_endpoints`] is called.
    pub fn new(transport: T, metadata: DeviceMetadata, config: SessionConfig) -> Self {
        Self {
            metadata,
            config,
            port: Mutex::new(PortState::unplugged()),
            endpoints: RwLock::new(EndpointMap::new()),
            ledger: Ledger::new(),
            transport,
        }
    }

    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn port_state(&self) -> PortState {
        *self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the endpoint map, typically after the configuration
    /// descriptor has been read or a new alternate setting was selected
    /// (see [`EndpointMap::select_alternate_setting`])
    pub fn set_endpoints(&self, endpoints: EndpointMap) {
        *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = endpoints;
    }

    pub fn endpoints(&self) -> EndpointMap {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    fn transition(
        &self,
        f: impl FnOnce(PortState) -> Result<PortState, TransitionError>,
    ) -> Result<PortState, TransitionError> {
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);

        *port = f(*port)?;

        Ok(*port)
    }

    /// Remote handshake started
    pub fn begin_connect(&self) -> Result<(), TransitionError> {
        self.transition(PortState::connecting).map(drop)
    }

    /// Remote side accepted the import, submits are accepted from here on
    pub fn connected(&self) -> Result<(), TransitionError> {
        self.transition(PortState::connected)?;
        self.ledger.reopen();

        Ok(())
    }

    pub fn plug(&self, port: NonZeroU16) -> Result<(), TransitionError> {
        self.transition(|s| s.plugged(port)).map(drop)
    }

    /// Link to the server lost. Everything in flight fails with
    /// [`TransferError::DeviceGone`].
    pub fn link_lost(&self) -> Result<usize, TransitionError> {
        self.transition(PortState::disconnected)?;

        Ok(self.ledger.drain())
    }

    /// Link restored while the device was still exposed
    pub fn reconnect(&self, port: NonZeroU16) -> Result<(), TransitionError> {
        self.transition(|s| s.plugged(port))?;
        self.ledger.reopen();

        Ok(())
    }

    /// Detaches the device. Submits are rejected from the moment this is
    /// called, everything in flight fails with [`TransferError::DeviceGone`].
    pub fn unplug(&self) -> Result<usize, TransitionError> {
        let state = self.port_state().state();

        let drained = match state {
            DeviceState::Plugged | DeviceState::Disconnected => {
                self.transition(PortState::unplugging)?;
                let drained = self.ledger.drain();
                self.transition(PortState::unplugged)?;
                drained
            }
            _ => {
                self.transition(PortState::unplugged)?;
                self.ledger.drain()
            }
        };

        tracing::info!(devid = self.metadata.devid, drained, "device unplugged");

        Ok(drained)
    }

    /// Encodes and sends a request. `completion` runs exactly once, on the
    /// receiving thread when the reply arrives, or on the canceling thread.
    ///
    /// If an error is returned before the request was registered the
    /// completion is dropped without being called.
    pub fn submit(
        &self,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<SeqNum, SubmitError> {
        let port = self.port_state();

        if !port.accepts_submits() {
            return Err(match port.state() {
                DeviceState::Unplugged | DeviceState::Connecting => {
                    SubmitError::NotConnected(port.state())
                }
                _ => SubmitError::DeviceGone,
            });
        }

        let mut pdu = {
            let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);

            let ctx = EncodeContext {
                devid: self.metadata.devid,
                endpoints: &*endpoints,
                max_iso_packets: self.config.max_iso_packets,
            };

            transfer::encode(&request, &ctx).inspect_err(|e| {
                tracing::debug!(kind = ?request.kind(), "rejecting request: {e}");
            })?
        };

        let seqnum = self.ledger.register(
            TrackedRequest::Transfer(request),
            pdu.direction(),
            completion,
        )?;

        pdu.set_seqnum(seqnum);

        self.send_tracked(pdu)?;

        Ok(seqnum)
    }

    fn send_tracked(&self, pdu: Pdu) -> Result<(), SubmitError> {
        let seqnum = pdu.seqnum();

        if let Err(e) = self.ledger.mark_sent(seqnum) {
            // canceled before it reached the wire
            tracing::debug!(%seqnum, "not sending request: {e}");
            return Ok(());
        }

        tracing::trace!(%seqnum, command = %pdu.header.command(), len = pdu.payload.len(), "sending");

        if let Err(source) = self.transport.send(&pdu.to_bytes()) {
            tracing::error!(%seqnum, "failed to send request: {source}");

            self.ledger.abort(seqnum, TransferError::DeviceGone);

            return Err(SubmitError::Transport { seqnum, source });
        }

        Ok(())
    }

    /// Cancels a request. Returns `false` if nothing was canceled because
    /// the request already completed or was never submitted.
    ///
    /// The canceled request completes with [`TransferError::Canceled`] right
    /// away. If it had already been sent a `CMD_UNLINK` follows, and a late
    /// `RET_SUBMIT` for it will be dropped.
    pub fn unlink(&self, target: SeqNum) -> bool {
        match self.ledger.cancel(target) {
            None => {
                tracing::debug!(%target, "nothing to unlink");
                false
            }
            Some(RequestState::Pending) => true,
            Some(RequestState::Sent) => {
                let mut pdu = transfer::encode_unlink(self.metadata.devid, target);

                match self.ledger.register(
                    TrackedRequest::Unlink { target },
                    Direction::Out,
                    Completion::none(),
                ) {
                    Ok(seqnum) => {
                        pdu.set_seqnum(seqnum);

                        if let Err(e) = self.send_tracked(pdu) {
                            tracing::error!(%target, "failed to send CMD_UNLINK: {e}");
                        }
                    }
                    Err(e) => tracing::debug!(%target, "not sending CMD_UNLINK: {e}"),
                }

                true
            }
        }
    }

    /// Reads one reply from the transport and dispatches it.
    ///
    /// A [`ReceiveError::Protocol`] means the reply was discarded; whether the
    /// connection is still usable is up to the caller.
    pub fn receive(&self) -> Result<ReplyOutcome, ReceiveError> {
        let mut raw = [0; USBIP_HEADER_SIZE];
        self.transport.recv(&mut raw)?;

        let header = PduHeader::to_host(&raw).inspect_err(|e| {
            tracing::warn!("dropping malformed reply header: {e}");
        })?;

        let seqnum = header.basic.seqnum;

        match header.command() {
            Command::RetSubmit | Command::RetUnlink => {}
            other => {
                tracing::warn!(%seqnum, "unexpected {other} from server");
                return Err(ProtocolError::UnexpectedCommand(other).into());
            }
        }

        if !seqnum.is_valid() {
            tracing::warn!(%seqnum, "reply with invalid sequence number");
            return Err(ProtocolError::InvalidSeqNum(seqnum).into());
        }

        // replies zero the direction field, the sequence number still has it
        let mut payload = vec![0; header.payload_size(seqnum.direction())];
        self.transport.recv(&mut payload)?;

        Ok(self.handle_reply(&header, &payload))
    }

    /// Completes the request a reply belongs to
    pub fn handle_reply(&self, header: &PduHeader, payload: &[u8]) -> ReplyOutcome {
        let seqnum = header.basic.seqnum;

        let Some(mut entry) = self.ledger.find_sent(seqnum) else {
            tracing::debug!(%seqnum, command = %header.command(), "no request waiting for reply");
            return ReplyOutcome::CorrelationMiss(seqnum);
        };

        let direction = entry.direction();

        let result = match (&header.body, entry.request_mut()) {
            (HeaderBody::RetSubmit(reply), TrackedRequest::Transfer(request)) => {
                transfer::decode(request, reply, direction, payload).inspect_err(|e| {
                    tracing::warn!(%seqnum, "failed to apply reply: {e}");
                })
            }
            (HeaderBody::RetUnlink(reply), TrackedRequest::Unlink { target }) => {
                tracing::debug!(%seqnum, %target, status = %reply.status, "unlink acknowledged");
                Ok(())
            }
            (_, request) => {
                tracing::warn!(
                    %seqnum,
                    command = %header.command(),
                    kind = ?request.kind(),
                    "reply does not match request"
                );

                if let TrackedRequest::Transfer(request) = request {
                    request.set_status(UsbdStatus::InvalidParameter);
                }

                Err(DecodeError::UnexpectedReply(header.command()).into())
            }
        };

        let outcome = match entry.request() {
            TrackedRequest::Unlink { target } => ReplyOutcome::Unlinked {
                seqnum,
                target: *target,
            },
            TrackedRequest::Transfer(_) => ReplyOutcome::Completed(seqnum),
        };

        let stalled = self.stalled_endpoint(entry.request());

        self.ledger.retire(entry, result);

        if let Some(endpoint_address) = stalled {
            self.reset_stalled_pipe(endpoint_address);
        }

        outcome
    }

    fn stalled_endpoint(&self, request: &TrackedRequest) -> Option<u8> {
        if !self.config.reset_pipe_on_stall {
            return None;
        }

        let request = request.as_transfer()?;

        let halts = matches!(
            request,
            TransferRequest::BulkOrInterrupt(_) | TransferRequest::Isoch(_)
        );

        (halts && request.status() == UsbdStatus::StallPid).then(|| request.endpoint_address())
    }

    fn reset_stalled_pipe(&self, endpoint_address: u8) {
        tracing::debug!(endpoint_address, "endpoint stalled, clearing halt");

        let request = TransferRequest::ResetPipe(ResetPipe {
            endpoint_address,
            status: UsbdStatus::Pending,
        });

        let completion = Completion::new(move |completed| {
            if let Err(e) = completed.result {
                tracing::warn!(endpoint_address, "failed to clear halt: {e}");
            }
        });

        if let Err(e) = self.submit(request, completion) {
            tracing::warn!(endpoint_address, "failed to submit pipe reset: {e}");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let port = self.port_state();
        let requests = self.ledger.entries();

        let sent = requests
            .iter()
            .filter(|e| e.state == RequestState::Sent)
            .count();

        SessionSnapshot {
            device: self.metadata,
            state: port.state(),
            port: port.port(),
            pending: requests.len() - sent,
            sent,
            requests,
        }
    }
}

impl<T> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        let drained = self.ledger.drain();

        if drained > 0 {
            tracing::debug!(drained, "session dropped with requests in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        descriptor::{EndpointInfo, PipeType},
        net::MemoryTransport,
        proto::{
            HeaderBasic,
            pdu::{CmdUnlink, RetSubmit, RetUnlink},
            setup::CLEAR_FEATURE,
        },
        status::{TransferFlags, WireStatus},
        urb::{BulkOrInterruptTransfer, Completed, TransferBuffer},
    };

    fn session() -> DeviceSession<MemoryTransport> {
        let session = DeviceSession::new(
            MemoryTransport::new(),
            DeviceMetadata {
                devid: 0x0001_0003,
                ..Default::default()
            },
            SessionConfig::default(),
        );

        let mut endpoints = EndpointMap::new();
        for (address, pipe_type) in [(0x81, PipeType::Bulk), (0x02, PipeType::Bulk)] {
            endpoints.insert(EndpointInfo {
                address,
                pipe_type,
                max_packet_size: 512,
                interval: 0,
            });
        }
        session.set_endpoints(endpoints);

        session.begin_connect().unwrap();
        session.connected().unwrap();
        session
    }

    fn bulk_in(length: u32) -> TransferRequest {
        TransferRequest::BulkOrInterrupt(BulkOrInterruptTransfer {
            endpoint_address: 0x81,
            flags: TransferFlags::DIRECTION_IN | TransferFlags::SHORT_TRANSFER_OK,
            buffer: TransferBuffer::for_read(length),
            status: UsbdStatus::Pending,
        })
    }

    fn ret_submit(seqnum: SeqNum, status: WireStatus, data: &[u8]) -> Vec<u8> {
        let header = PduHeader {
            basic: HeaderBasic {
                seqnum,
                devid: 0,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::RetSubmit(RetSubmit {
                status,
                actual_length: data.len() as u32,
                start_frame: 0,
                number_of_packets: None,
                error_count: 0,
            }),
        };

        [&header.to_wire()[..], data].concat()
    }

    fn ret_unlink(seqnum: SeqNum, status: WireStatus) -> Vec<u8> {
        PduHeader {
            basic: HeaderBasic {
                seqnum,
                devid: 0,
                direction: Direction::Out,
                ep: 0,
            },
            body: HeaderBody::RetUnlink(RetUnlink { status }),
        }
        .to_wire()
        .to_vec()
    }

    fn sent_headers(session: &DeviceSession<MemoryTransport>) -> Vec<PduHeader> {
        session
            .transport()
            .take_sent()
            .iter()
            .map(|bytes| PduHeader::to_host(bytes).unwrap())
            .collect()
    }

    #[test]
    fn submit_requires_connection() {
        let session = DeviceSession::new(
            MemoryTransport::new(),
            DeviceMetadata::default(),
            SessionConfig::default(),
        );

        assert!(matches!(
            session.submit(bulk_in(8), Completion::none()),
            Err(SubmitError::NotConnected(DeviceState::Unplugged))
        ));
    }

    #[test]
    fn bulk_in_round_trip() {
        let session = session();
        let (tx, rx) = mpsc::channel::<Completed>();

        let seqnum = session.submit(bulk_in(64), tx.into()).unwrap();

        let sent = sent_headers(&session);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].basic.seqnum, seqnum);
        assert_eq!(sent[0].basic.devid, 0x0001_0003);
        assert_eq!(sent[0].basic.direction, Direction::In);
        assert_eq!(sent[0].basic.ep, 1);

        session
            .transport()
            .push_inbound(&ret_submit(seqnum, WireStatus::SUCCESS, &[0xAB; 40]));

        assert_eq!(session.receive().unwrap(), ReplyOutcome::Completed(seqnum));

        let (request, result) = rx.try_recv().unwrap().into_transfer().unwrap();
        assert!(result.is_ok());
        assert_eq!(request.status(), UsbdStatus::Success);
        assert_eq!(request.buffer().map(|b| b.length), Some(40));
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn unlink_of_sent_request() {
        let session = session();
        let (tx, rx) = mpsc::channel::<Completed>();

        let target = session.submit(bulk_in(64), tx.into()).unwrap();
        sent_headers(&session);

        assert!(session.unlink(target));
        assert!(!session.unlink(target));

        let completed = rx.try_recv().unwrap();
        assert_eq!(completed.result, Err(TransferError::Canceled));
        assert!(rx.try_recv().is_err());

        let sent = sent_headers(&session);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].body,
            HeaderBody::CmdUnlink(CmdUnlink { target })
        );
        let unlink_seqnum = sent[0].basic.seqnum;

        // the late reply carries data, it must still be consumed
        session
            .transport()
            .push_inbound(&ret_submit(target, WireStatus::SUCCESS, &[1; 64]));
        session.transport().push_inbound(&ret_unlink(
            unlink_seqnum,
            WireStatus::from_raw(-104),
        ));

        assert_eq!(
            session.receive().unwrap(),
            ReplyOutcome::CorrelationMiss(target)
        );
        assert_eq!(
            session.receive().unwrap(),
            ReplyOutcome::Unlinked {
                seqnum: unlink_seqnum,
                target
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn stall_triggers_pipe_reset() {
        let session = session();

        let seqnum = session.submit(bulk_in(8), Completion::none()).unwrap();
        sent_headers(&session);

        session
            .transport()
            .push_inbound(&ret_submit(seqnum, WireStatus::from_raw(-32), &[]));
        session.receive().unwrap();

        let sent = sent_headers(&session);
        assert_eq!(sent.len(), 1);

        let HeaderBody::CmdSubmit(body) = sent[0].body else {
            panic!("expected a submit");
        };
        assert_eq!(body.setup.request, CLEAR_FEATURE);
        assert_eq!(body.setup.index, 0x81);
        assert_eq!(session.in_flight(), 1);
    }

    #[test]
    fn no_pipe_reset_when_disabled() {
        let mut session = session();
        session.config.reset_pipe_on_stall = false;

        let seqnum = session.submit(bulk_in(8), Completion::none()).unwrap();
        sent_headers(&session);

        session
            .transport()
            .push_inbound(&ret_submit(seqnum, WireStatus::from_raw(-32), &[]));
        session.receive().unwrap();

        assert!(sent_headers(&session).is_empty());
    }

    #[test]
    fn send_failure_completes_with_device_gone() {
        let session = session();
        let (tx, rx) = mpsc::channel::<Completed>();

        session.transport().set_fail_sends(true);

        let err = session.submit(bulk_in(8), tx.into()).unwrap_err();
        assert!(matches!(err, SubmitError::Transport { .. }));

        assert_eq!(
            rx.try_recv().map(|c| c.result).ok(),
            Some(Err(TransferError::DeviceGone))
        );
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn unplug_drains_and_rejects() {
        let session = session();
        let (tx, rx) = mpsc::channel::<Completed>();

        session.plug(NonZeroU16::new(2).unwrap()).unwrap();
        for _ in 0..3 {
            session.submit(bulk_in(8), tx.clone().into()).unwrap();
        }

        assert_eq!(session.snapshot().sent, 3);
        assert_eq!(session.snapshot().port, 2);

        assert_eq!(session.unplug().unwrap(), 3);
        assert_eq!(
            rx.try_iter().map(|c| c.result).collect::<Vec<_>>(),
            vec![Err(TransferError::DeviceGone); 3]
        );
        assert_eq!(session.port_state().state(), DeviceState::Unplugged);
        assert!(matches!(
            session.submit(bulk_in(8), Completion::none()),
            Err(SubmitError::NotConnected(DeviceState::Unplugged))
        ));
    }

    #[test]
    fn link_loss_and_reconnect() {
        let session = session();
        let port = NonZeroU16::new(1).unwrap();

        session.plug(port).unwrap();
        session.submit(bulk_in(8), Completion::none()).unwrap();

        assert_eq!(session.link_lost().unwrap(), 1);
        assert!(matches!(
            session.submit(bulk_in(8), Completion::none()),
            Err(SubmitError::DeviceGone)
        ));

        session.reconnect(port).unwrap();
        assert!(session.submit(bulk_in(8), Completion::none()).is_ok());
    }

    #[test]
    fn unexpected_inbound_commands_are_rejected() {
        let session = session();

        let mut bytes = ret_submit(SeqNum::from_raw(3), WireStatus::SUCCESS, &[]);
        bytes[3] = 1; // CMD_SUBMIT
        session.transport().push_inbound(&bytes);

        assert!(matches!(
            session.receive(),
            Err(ReceiveError::Protocol(ProtocolError::UnexpectedCommand(
                Command::CmdSubmit
            )))
        ));

        session
            .transport()
            .push_inbound(&ret_submit(SeqNum::from_raw(1), WireStatus::SUCCESS, &[]));

        assert!(matches!(
            session.receive(),
            Err(ReceiveError::Protocol(ProtocolError::InvalidSeqNum(_)))
        ));
    }

    #[test]
    fn mismatched_reply_fails_request() {
        let session = session();
        let (tx, rx) = mpsc::channel::<Completed>();

        let seqnum = session.submit(bulk_in(8), tx.into()).unwrap();
        session
            .transport()
            .push_inbound(&ret_unlink(seqnum, WireStatus::SUCCESS));

        assert_eq!(session.receive().unwrap(), ReplyOutcome::Completed(seqnum));

        let (request, result) = rx.try_recv().unwrap().into_transfer().unwrap();
        assert_eq!(
            result,
            Err(TransferError::InvalidParameter(DecodeError::UnexpectedReply(
                Command::RetUnlink
            )))
        );
        assert_eq!(request.status(), UsbdStatus::InvalidParameter);
    }
}
