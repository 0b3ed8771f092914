//! Server side of an RPC: one reusable slot per unit of service concurrency.
use crate::rpc::bulk::BulkDescriptor;
use crate::rpc::capsule::{decode_header, MsgBody, Payload, SrpcMsg, MSG_SIZE, MSG_VERSION};
use crate::rpc::context::RpcContext;
use crate::rpc::dispatcher::{RpcEvent, ServerEvent, Target};
use crate::rpc::rpc_common::{is_framework_service, Portal, ProcessId, Result, RpcError};
use crate::rpc::service::{RequestBuffer, Service};
use crate::rpc::transport::{EventTarget, MdBuffer, MdHandle, MdOp, Region};
use crate::rpc::workitem::{Lane, Runnable, WorkItem};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Application side of a service.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Handles a new request. May fill in the reply and attach a bulk
    /// descriptor to be moved before the reply is sent. An error drops the
    /// RPC without replying.
    fn handle(&self, call: &mut ServerCall) -> Result<()>;

    /// Called once the bulk transfer finished with `status`; the returned
    /// status decides whether the reply is sent.
    fn bulk_ready(&self, _call: &ServerCall, status: Result<()>) -> Result<()> {
        status
    }

    /// Last look at the call before its slot is recycled.
    fn rpc_done(&self, _call: &ServerCall, _status: &Result<()>) {}
}

/// One inbound request as seen by its handler.
#[derive(Debug)]
pub struct ServerCall {
    service: u32,
    peer: ProcessId,
    request: SrpcMsg,
    swapped: bool,
    reply_status: u32,
    reply_payload: Payload,
    bulk: Option<BulkDescriptor>,
}

impl ServerCall {
    pub fn service(&self) -> u32 {
        self.service
    }

    pub fn peer(&self) -> ProcessId {
        self.peer
    }

    pub fn request(&self) -> &SrpcMsg {
        &self.request
    }

    pub fn request_payload(&self) -> &Payload {
        self.request.payload()
    }

    /// The request arrived in the opposite byte order and was unswapped.
    pub fn is_swapped(&self) -> bool {
        self.swapped
    }

    pub fn reply(&mut self, status: u32, payload: Payload) {
        self.reply_status = status;
        self.reply_payload = payload;
    }

    pub fn reply_status(&self) -> u32 {
        self.reply_status
    }

    pub fn set_bulk(&mut self, bulk: BulkDescriptor) {
        self.bulk = Some(bulk);
    }

    pub fn bulk(&self) -> Option<&BulkDescriptor> {
        self.bulk.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Newborn,
    BulkStarted,
    ReplySubmitted,
    Done,
}

pub(crate) struct ServerInner {
    pub(crate) state: ServerState,
    pub(crate) ev: RpcEvent,
    pub(crate) reqstbuf: Option<Arc<RequestBuffer>>,
    peer: ProcessId,
    reply_id: u64,
    bulk_id: u64,
    reply_mdh: MdHandle,
    bulk_mdh: MdHandle,
    call: Option<ServerCall>,
}

pub(crate) struct ServerRpc {
    wi: WorkItem,
    service: Weak<Service>,
    ctx: Weak<RpcContext>,
    pub(crate) inner: spin::Mutex<ServerInner>,
}

enum Step {
    Continue,
    Suspend,
    Finish(Result<()>),
}

impl ServerRpc {
    pub(crate) fn new(service: Weak<Service>, ctx: Weak<RpcContext>, lane: Lane) -> Self {
        ServerRpc {
            wi: WorkItem::new(lane),
            service,
            ctx,
            inner: spin::Mutex::new(ServerInner {
                state: ServerState::Newborn,
                ev: RpcEvent::idle(),
                reqstbuf: None,
                peer: ProcessId::ANY,
                reply_id: 0,
                bulk_id: 0,
                reply_mdh: MdHandle::INVALID,
                bulk_mdh: MdHandle::INVALID,
                call: None,
            }),
        }
    }

    /// Binds a free slot to a received request. Called under the service lock.
    pub(crate) fn init(&self, buf: Arc<RequestBuffer>) {
        let mut inner = self.inner.lock();
        inner.state = ServerState::Newborn;
        inner.ev = RpcEvent::idle();
        inner.peer = buf.peer();
        inner.reqstbuf = Some(buf);
        inner.reply_id = 0;
        inner.bulk_id = 0;
        inner.reply_mdh = MdHandle::INVALID;
        inner.bulk_mdh = MdHandle::INVALID;
        inner.call = None;
        self.wi.reset();
    }

    pub(crate) fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    fn handle_rpc(self: &Arc<Self>) -> bool {
        let (Some(ctx), Some(sv)) = (self.ctx.upgrade(), self.service.upgrade()) else {
            self.wi.kill();
            return true;
        };

        {
            let guard = sv.inner.lock();
            if guard.shutting_down {
                let (fired, bulk_mdh, reply_mdh) = {
                    let inner = self.inner.lock();
                    (inner.ev.fired, inner.bulk_mdh, inner.reply_mdh)
                };
                drop(guard);
                for mdh in [bulk_mdh, reply_mdh] {
                    if mdh.is_valid() {
                        ctx.transport().unlink(mdh);
                    }
                }
                if fired {
                    self.inner.lock().state = ServerState::Done;
                    self.done(&ctx, &sv, Err(RpcError::Shutdown));
                    return true;
                }
                return false;
            }
        }

        loop {
            let state = self.inner.lock().state;
            let step = match state {
                ServerState::Newborn => self.on_newborn(&ctx, &sv),
                ServerState::BulkStarted => self.on_bulk_started(&ctx, &sv),
                ServerState::ReplySubmitted => self.on_reply_submitted(),
                ServerState::Done => {
                    error!("server rpc for service {} ran after completion", sv.id());
                    self.wi.kill();
                    return true;
                }
            };
            match step {
                Step::Continue => {}
                Step::Suspend => return false,
                Step::Finish(status) => {
                    self.inner.lock().state = ServerState::Done;
                    self.done(&ctx, &sv, status);
                    return true;
                }
            }
        }
    }

    fn on_newborn(self: &Arc<Self>, ctx: &Arc<RpcContext>, sv: &Arc<Service>) -> Step {
        let (buf, peer) = {
            let inner = self.inner.lock();
            (inner.reqstbuf.clone(), inner.peer)
        };
        let Some(buf) = buf else {
            return Step::Finish(Err(RpcError::InvalidState("server rpc without request")));
        };
        let decoded = buf.region.with(|bytes| decode_header(bytes).and_then(|h| Ok((h, SrpcMsg::decode(bytes)?))));
        let (header, request) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return Step::Finish(Err(e)),
        };
        let (reply_id, bulk_id) = match request.body {
            MsgBody::Request { reply_id, bulk_id, .. } => (reply_id, bulk_id),
            MsgBody::Reply { .. } => {
                return Step::Finish(Err(RpcError::Protocol("reply received on request portal".into())))
            }
        };

        let mut call = ServerCall {
            service: sv.id(),
            peer,
            request,
            swapped: header.swapped(),
            reply_status: 0,
            reply_payload: Payload::Empty,
            bulk: None,
        };
        let rc = if header.version != MSG_VERSION {
            warn!(
                "version mismatch from {}: {:#x}, expected {:#x}",
                peer, header.version, MSG_VERSION
            );
            call.reply_status = libc::EPROTO as u32;
            Ok(())
        } else {
            sv.handler.handle(&mut call)
        };
        debug_assert!(call.reply_status == 0 || call.bulk.is_none());

        let bulk = call.bulk.as_ref().map(|b| (b.md_buffer(), b.active_op(), b.is_sink()));
        {
            let mut inner = self.inner.lock();
            inner.reply_id = reply_id;
            inner.bulk_id = bulk_id;
            inner.call = Some(call);
            inner.state = ServerState::BulkStarted;
        }
        if let Err(e) = rc {
            return Step::Finish(Err(e));
        }

        let Some((buffer, op, sink)) = bulk else {
            return Step::Continue;
        };
        let kind = if sink { ServerEvent::BulkGetReplied } else { ServerEvent::BulkPutSent };
        self.inner.lock().ev.arm();
        let rc = ctx.transport().post_active(
            Portal::Rdma,
            bulk_id,
            buffer,
            op,
            peer,
            EventTarget(Target::Server { rpc: self.clone(), kind }),
        );
        let mut inner = self.inner.lock();
        match rc {
            Ok(mdh) => {
                inner.bulk_mdh = mdh;
                Step::Suspend
            }
            Err(e) => {
                inner.ev.fired = true;
                inner.ev.status = Err(e);
                Step::Continue
            }
        }
    }

    fn on_bulk_started(self: &Arc<Self>, ctx: &Arc<RpcContext>, sv: &Arc<Service>) -> Step {
        let (call, bulk_status) = {
            let mut inner = self.inner.lock();
            let has_bulk = inner.call.as_ref().map_or(false, |c| c.bulk.is_some());
            if has_bulk && !inner.ev.fired {
                return Step::Suspend;
            }
            let status = inner.ev.status.clone();
            match inner.call.take() {
                Some(call) => (call, has_bulk.then_some(status)),
                None => return Step::Finish(Err(RpcError::InvalidState("server rpc lost its call"))),
            }
        };
        if let Some(status) = bulk_status {
            if let Err(e) = sv.handler.bulk_ready(&call, status) {
                self.inner.lock().call = Some(call);
                return Step::Finish(Err(e));
            }
        }
        let reply = SrpcMsg::reply(sv.id(), call.reply_status, call.reply_payload.clone());
        {
            let mut inner = self.inner.lock();
            inner.call = Some(call);
            inner.state = ServerState::ReplySubmitted;
        }
        match self.send_reply(ctx, sv, reply) {
            Ok(()) => Step::Suspend,
            Err(e) => Step::Finish(Err(e)),
        }
    }

    fn on_reply_submitted(&self) -> Step {
        let inner = self.inner.lock();
        if !inner.ev.fired {
            return Step::Suspend;
        }
        Step::Finish(inner.ev.status.clone())
    }

    fn send_reply(self: &Arc<Self>, ctx: &Arc<RpcContext>, sv: &Arc<Service>, reply: SrpcMsg) -> Result<()> {
        {
            let guard = sv.inner.lock();
            if !guard.shutting_down && !is_framework_service(sv.id()) {
                // the client may send its next request as soon as it sees
                // this reply
                let buf = self.inner.lock().reqstbuf.take();
                if let Some(buf) = buf {
                    let (_guard, rc) = ctx.post_buffer(sv, guard, buf);
                    if let Err(e) = rc {
                        warn!("failed to repost buffer on service {}: {}", sv.id(), e);
                    }
                }
            }
        }

        let region = Region::new(MSG_SIZE)?;
        region.with_mut(|bytes| reply.encode(ctx.config().wire_order, bytes))?;
        let (reply_id, peer) = {
            let mut inner = self.inner.lock();
            inner.ev.arm();
            (inner.reply_id, inner.peer)
        };
        let rc = ctx.transport().post_active(
            Portal::Rdma,
            reply_id,
            MdBuffer::single(region),
            MdOp::Put,
            peer,
            EventTarget(Target::Server { rpc: self.clone(), kind: ServerEvent::ReplySent }),
        );
        let mut inner = self.inner.lock();
        match rc {
            Ok(mdh) => {
                inner.reply_mdh = mdh;
                Ok(())
            }
            Err(e) => {
                inner.ev.fired = true;
                Err(e)
            }
        }
    }

    fn done(self: &Arc<Self>, ctx: &Arc<RpcContext>, sv: &Arc<Service>, status: Result<()>) {
        let call = self.inner.lock().call.take();
        match &status {
            Ok(()) => debug!("server rpc on service {} done", sv.id()),
            Err(e) => {
                if !sv.is_shutting_down() {
                    warn!("server rpc on service {} dropped: {}", sv.id(), e);
                }
                ctx.with_counters(|c| c.rpcs_dropped += 1);
            }
        }
        if let Some(call) = call {
            sv.handler.rpc_done(&call, &status);
        }

        let mut guard = sv.inner.lock();
        let buf = self.inner.lock().reqstbuf.take();
        if let Some(buf) = buf {
            guard = ctx.recycle_buffer(sv, guard, buf);
        }
        guard.active.retain(|rpc| !Arc::ptr_eq(rpc, self));
        self.wi.kill();

        let next = if guard.shutting_down { None } else { guard.blocked.pop_front() };
        match next {
            Some(buf) => {
                self.init(buf);
                guard.active.push(self.clone());
                ctx.scheduler.schedule(self.clone());
            }
            None => guard.free.push(self.clone()),
        }
    }
}

impl Runnable for ServerRpc {
    fn workitem(&self) -> &WorkItem {
        &self.wi
    }

    fn run(self: Arc<Self>) -> bool {
        self.handle_rpc()
    }
}
