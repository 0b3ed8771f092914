//! Client side of an RPC.
//!
//! ```text
//! Newborn -> RequestSubmitted -> RequestSent -> ReplyReceived -> Done
//!    \______________ abort (any state, idempotent) ______________/
//! ```
//!
//! Request, reply and bulk completions may arrive in any order; each state
//! only waits for the sub-event it depends on.
use crate::rpc::bulk::BulkDescriptor;
use crate::rpc::capsule::{service_reply_type, MsgBody, Payload, SrpcMsg, MSG_SIZE};
use crate::rpc::context::RpcContext;
use crate::rpc::dispatcher::{ClientEvent, RpcEvent, Target};
use crate::rpc::peer::Peer;
use crate::rpc::rpc_common::{request_portal, uses_control_queue, Portal, ProcessId, Result, RpcError, SERVICE_MAX_ID};
use crate::rpc::timer::TimerId;
use crate::rpc::transport::{EventKind, EventTarget, MdBuffer, MdHandle, MdOp, Region};
use crate::rpc::workitem::{Lane, Runnable, WorkItem};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

type DoneCallback = Box<dyn FnOnce(&Arc<ClientRpc>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Newborn,
    RequestSubmitted,
    RequestSent,
    ReplyReceived,
    Done,
}

pub(crate) struct ClientInner {
    state: ClientState,
    aborted: bool,
    closed: bool,
    posted: bool,
    status: Result<()>,
    /// Set while the RPC holds (or is queued for) one of the peer's credits.
    peer: Option<Arc<Peer>>,
    timer: Option<TimerId>,
    reqst_ev: RpcEvent,
    reply_ev: RpcEvent,
    bulk_ev: RpcEvent,
    reqst_mdh: MdHandle,
    reply_mdh: MdHandle,
    request: SrpcMsg,
    reply_region: Region,
    reply: Option<SrpcMsg>,
    bulk: Option<BulkDescriptor>,
}

impl ClientInner {
    pub(crate) fn event_mut(&mut self, kind: ClientEvent) -> &mut RpcEvent {
        match kind {
            ClientEvent::RequestSent => &mut self.reqst_ev,
            ClientEvent::ReplyReceived => &mut self.reply_ev,
            ClientEvent::BulkRequestReceived => &mut self.bulk_ev,
        }
    }

    fn event_pending(&self) -> bool {
        !self.reqst_ev.fired || !self.reply_ev.fired || !self.bulk_ev.fired
    }

    fn reply_status(&self) -> Option<u32> {
        match self.reply.as_ref().map(|msg| &msg.body) {
            Some(MsgBody::Reply { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

pub struct ClientRpc {
    ctx: Arc<RpcContext>,
    wi: WorkItem,
    dest: ProcessId,
    service: u32,
    timeout: Option<Duration>,
    on_done: spin::Mutex<Option<DoneCallback>>,
    pub(crate) inner: spin::Mutex<ClientInner>,
}

pub struct ClientRpcBuilder {
    dest: ProcessId,
    service: u32,
    payload: Payload,
    bulk: Option<BulkDescriptor>,
    timeout: Option<Duration>,
    on_done: Option<DoneCallback>,
}

impl ClientRpcBuilder {
    pub fn new(dest: ProcessId, service: u32) -> Self {
        ClientRpcBuilder { dest, service, payload: Payload::Empty, bulk: None, timeout: None, on_done: None }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn bulk(mut self, bulk: BulkDescriptor) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// The RPC aborts with [`RpcError::Timeout`] if it is not done in time.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoked exactly once when the RPC is done, successful or not.
    pub fn on_done(mut self, cb: impl FnOnce(&Arc<ClientRpc>) + Send + 'static) -> Self {
        self.on_done = Some(Box::new(cb));
        self
    }

    pub fn build(self, ctx: &Arc<RpcContext>) -> Result<Arc<ClientRpc>> {
        if self.service > SERVICE_MAX_ID {
            return Err(RpcError::InvalidArgument(format!("service id {} out of range", self.service)));
        }
        Ok(Arc::new(ClientRpc {
            ctx: ctx.clone(),
            wi: WorkItem::new(Lane::Concurrent),
            dest: self.dest,
            service: self.service,
            timeout: self.timeout.filter(|t| !t.is_zero()),
            on_done: spin::Mutex::new(self.on_done),
            inner: spin::Mutex::new(ClientInner {
                state: ClientState::Newborn,
                aborted: false,
                closed: false,
                posted: false,
                status: Ok(()),
                peer: None,
                timer: None,
                reqst_ev: RpcEvent::idle(),
                reply_ev: RpcEvent::idle(),
                bulk_ev: RpcEvent::idle(),
                reqst_mdh: MdHandle::INVALID,
                reply_mdh: MdHandle::INVALID,
                request: SrpcMsg::request(self.service, self.payload),
                reply_region: Region::new(MSG_SIZE)?,
                reply: None,
                bulk: self.bulk,
            }),
        }))
    }
}

enum Step {
    Continue,
    Suspend,
    /// Abort with this error, then wait for outstanding sub-events.
    Fail(RpcError),
    Finish(Result<()>),
}

impl ClientRpc {
    pub fn builder(dest: ProcessId, service: u32) -> ClientRpcBuilder {
        ClientRpcBuilder::new(dest, service)
    }

    pub fn dest(&self) -> ProcessId {
        self.dest
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    /// Local outcome. Meaningful once the RPC is closed.
    pub fn status(&self) -> Result<()> {
        self.inner.lock().status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    pub fn request(&self) -> SrpcMsg {
        self.inner.lock().request.clone()
    }

    pub fn reply(&self) -> Option<SrpcMsg> {
        self.inner.lock().reply.clone()
    }

    /// Application status carried in the reply, passed through unmodified.
    pub fn reply_status(&self) -> Option<u32> {
        self.inner.lock().reply_status()
    }

    /// Local status, then the remote one.
    pub fn remote_result(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.status.clone()?;
        match inner.reply_status() {
            Some(0) | None => Ok(()),
            Some(status) => Err(RpcError::Remote(status)),
        }
    }

    pub fn with_bulk<R>(&self, f: impl FnOnce(Option<&BulkDescriptor>) -> R) -> R {
        f(self.inner.lock().bulk.as_ref())
    }

    pub fn abort(self: &Arc<Self>, why: RpcError) {
        let mut inner = self.inner.lock();
        self.abort_locked(&mut inner, why);
    }

    fn abort_locked(self: &Arc<Self>, inner: &mut ClientInner, why: RpcError) {
        if inner.aborted || inner.closed {
            return;
        }
        debug!(
            "aborting rpc to {} service {} in state {:?}: {}",
            self.dest, self.service, inner.state, why
        );
        inner.aborted = true;
        inner.status = Err(why);
        if let Some(peer) = inner.peer.clone() {
            // still queued: no credit was taken
            if peer.dequeue(self) {
                inner.peer = None;
            }
        }
        self.ctx.scheduler.schedule(self.clone());
    }

    fn expired(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            warn!("rpc to {} service {} expired", self.dest, self.service);
            inner.timer = None;
            self.ctx.with_counters(|c| c.rpcs_expired += 1);
            self.abort_locked(&mut inner, RpcError::Timeout);
        }
    }

    fn send_rpc(self: &Arc<Self>) -> bool {
        if !self.inner.lock().aborted {
            loop {
                let state = self.inner.lock().state;
                let step = match state {
                    ClientState::Newborn => self.on_newborn(),
                    ClientState::RequestSubmitted => self.on_request_submitted(),
                    ClientState::RequestSent => self.on_request_sent(),
                    ClientState::ReplyReceived => self.on_reply_received(),
                    ClientState::Done => {
                        error!("client rpc to {} ran after completion", self.dest);
                        self.wi.kill();
                        return true;
                    }
                };
                match step {
                    Step::Continue => {}
                    Step::Suspend => break,
                    Step::Fail(e) => {
                        let mut inner = self.inner.lock();
                        self.abort_locked(&mut inner, e);
                        break;
                    }
                    Step::Finish(status) => {
                        self.inner.lock().state = ClientState::Done;
                        self.rpc_done(status);
                        return true;
                    }
                }
            }
        }

        let handles = {
            let inner = self.inner.lock();
            if !inner.aborted {
                return false;
            }
            [
                inner.reqst_mdh,
                inner.reply_mdh,
                inner.bulk.as_ref().map_or(MdHandle::INVALID, |b| b.mdh),
            ]
        };
        for mdh in handles.into_iter().filter(MdHandle::is_valid) {
            self.ctx.transport().unlink(mdh);
        }
        if self.inner.lock().event_pending() {
            return false;
        }
        self.rpc_done(Err(RpcError::Interrupted));
        true
    }

    fn on_newborn(self: &Arc<Self>) -> Step {
        let transport = self.ctx.transport();

        let reply_id = self.ctx.next_id();
        let region = {
            let mut inner = self.inner.lock();
            debug_assert!(!inner.event_pending());
            inner.reply_ev.arm();
            if let MsgBody::Request { reply_id: id, .. } = &mut inner.request.body {
                *id = reply_id;
            }
            inner.reply_region.clone()
        };
        let rc = transport.post_passive(
            Portal::Rdma,
            reply_id,
            MdBuffer::single(region),
            MdOp::Put,
            Some(self.dest),
            EventTarget(Target::Client { rpc: self.clone(), kind: ClientEvent::ReplyReceived }),
        );
        match rc {
            Ok(mdh) => self.inner.lock().reply_mdh = mdh,
            Err(e) => {
                self.inner.lock().reply_ev.fired = true;
                return Step::Finish(Err(e));
            }
        }

        let bulk = {
            let inner = self.inner.lock();
            inner.bulk.as_ref().map(|b| (b.md_buffer(), b.passive_op()))
        };
        if let Some((buffer, op)) = bulk {
            let bulk_id = self.ctx.next_id();
            {
                let mut inner = self.inner.lock();
                inner.bulk_ev.arm();
                if let MsgBody::Request { bulk_id: id, .. } = &mut inner.request.body {
                    *id = bulk_id;
                }
            }
            let rc = transport.post_passive(
                Portal::Rdma,
                bulk_id,
                buffer,
                op,
                Some(self.dest),
                EventTarget(Target::Client { rpc: self.clone(), kind: ClientEvent::BulkRequestReceived }),
            );
            let mut inner = self.inner.lock();
            match rc {
                Ok(mdh) => {
                    if let Some(bulk) = inner.bulk.as_mut() {
                        bulk.mdh = mdh;
                    }
                }
                Err(e) => {
                    inner.bulk_ev.fired = true;
                    return Step::Fail(e);
                }
            }
        }

        let region = match Region::new(MSG_SIZE) {
            Ok(region) => region,
            Err(e) => return Step::Fail(e),
        };
        {
            let mut inner = self.inner.lock();
            inner.state = ClientState::RequestSubmitted;
            if let Err(e) = region.with_mut(|bytes| inner.request.encode(self.ctx.config().wire_order, bytes)) {
                return Step::Fail(e);
            }
            inner.reqst_ev.arm();
        }
        let rc = transport.post_active(
            request_portal(self.service),
            self.service as u64,
            MdBuffer::single(region),
            MdOp::Put,
            self.dest,
            EventTarget(Target::Client { rpc: self.clone(), kind: ClientEvent::RequestSent }),
        );
        let mut inner = self.inner.lock();
        match rc {
            Ok(mdh) => {
                inner.reqst_mdh = mdh;
                Step::Suspend
            }
            Err(e) => {
                inner.reqst_ev.fired = true;
                Step::Fail(e)
            }
        }
    }

    fn on_request_submitted(&self) -> Step {
        let mut inner = self.inner.lock();
        if !inner.reqst_ev.fired {
            return Step::Suspend;
        }
        if let Err(e) = inner.reqst_ev.status.clone() {
            return Step::Fail(e);
        }
        inner.state = ClientState::RequestSent;
        Step::Continue
    }

    fn on_request_sent(self: &Arc<Self>) -> Step {
        let (region, bulk_mdh) = {
            let inner = self.inner.lock();
            if !inner.reply_ev.fired {
                return Step::Suspend;
            }
            if let Err(e) = inner.reply_ev.status.clone() {
                return Step::Fail(e);
            }
            (inner.reply_region.clone(), inner.bulk.as_ref().map(|b| b.mdh))
        };

        let reply = match region.with(SrpcMsg::decode) {
            Ok(reply) if reply.msg_type == service_reply_type(self.service) => reply,
            Ok(reply) => {
                warn!(
                    "bad reply from {}: type {}, expected {}",
                    self.dest,
                    reply.msg_type,
                    service_reply_type(self.service)
                );
                return Step::Fail(RpcError::Protocol(format!("reply type {}", reply.msg_type)));
            }
            Err(e) => {
                warn!("bad reply from {}: {}", self.dest, e);
                return Step::Fail(e);
            }
        };

        let status = match &reply.body {
            MsgBody::Reply { status, .. } => *status,
            MsgBody::Request { .. } => return Step::Fail(RpcError::Protocol("request in reply buffer".into())),
        };
        if status != 0 {
            if let Some(mdh) = bulk_mdh.filter(MdHandle::is_valid) {
                // the peer may never start the bulk transfer
                warn!("remote error {} at {}, unlinking bulk buffer", status, self.dest);
                self.ctx.transport().unlink(mdh);
            }
        }

        let mut inner = self.inner.lock();
        inner.reply = Some(reply);
        inner.state = ClientState::ReplyReceived;
        Step::Continue
    }

    fn on_reply_received(&self) -> Step {
        let inner = self.inner.lock();
        if inner.bulk.is_none() {
            return Step::Finish(Ok(()));
        }
        if !inner.bulk_ev.fired {
            return Step::Suspend;
        }
        let mut rc = inner.bulk_ev.status.clone();
        // bulk unlinked above because the server failed before moving data
        if rc.is_err()
            && inner.bulk_ev.kind == Some(EventKind::Unlink)
            && inner.status.is_ok()
            && inner.reply_status().map_or(false, |s| s != 0)
        {
            rc = Ok(());
        }
        Step::Finish(rc)
    }

    fn rpc_done(self: &Arc<Self>, status: Result<()>) {
        let peer = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            if inner.status.is_ok() {
                inner.status = status;
            }
            if let Some(timer) = inner.timer.take() {
                self.ctx.timer.cancel(timer);
            }
            debug_assert!(!inner.event_pending());
            self.wi.kill();
            match &inner.status {
                Ok(()) => debug!("rpc to {} service {} done", self.dest, self.service),
                Err(e) => debug!("rpc to {} service {} failed: {}", self.dest, self.service, e),
            }
            inner.peer.clone()
        };

        let cb = self.on_done.lock().take();
        if let Some(cb) = cb {
            cb(self);
        }
        if let Some(peer) = peer {
            peer.check_sends(1, &self.ctx.scheduler);
        }
    }
}

impl Runnable for ClientRpc {
    fn workitem(&self) -> &WorkItem {
        &self.wi
    }

    fn run(self: Arc<Self>) -> bool {
        self.send_rpc()
    }
}

impl fmt::Debug for ClientRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRpc")
            .field("dest", &self.dest)
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcContext {
    /// Queues `rpc` on its peer; it is dispatched once a credit is free.
    pub fn post_rpc(self: &Arc<Self>, rpc: &Arc<ClientRpc>) -> Result<()> {
        self.check_running()?;
        if !Arc::ptr_eq(&rpc.ctx, self) {
            return Err(RpcError::InvalidArgument("rpc was built for another engine".into()));
        }
        let peer = {
            let mut inner = rpc.inner.lock();
            if inner.posted || inner.closed {
                return Err(RpcError::InvalidState("rpc already posted"));
            }
            inner.posted = true;
            if let Some(timeout) = rpc.timeout {
                let weak = Arc::downgrade(rpc);
                inner.timer = Some(self.timer.add(timeout, move || {
                    if let Some(rpc) = weak.upgrade() {
                        rpc.expired();
                    }
                }));
            }
            let peer = self.find_or_create_peer(rpc.dest.nid);
            inner.peer = Some(peer.clone());
            peer.enqueue(rpc.clone(), uses_control_queue(rpc.service));
            peer
        };
        peer.check_sends(0, &self.scheduler);
        Ok(())
    }

    pub fn abort_rpc(&self, rpc: &Arc<ClientRpc>, why: RpcError) {
        rpc.abort(why);
    }
}
