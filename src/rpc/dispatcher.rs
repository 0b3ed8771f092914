//! Single entry point for transport completions.
use crate::rpc::capsule::{decode_header, service_request_type, MSG_SIZE};
use crate::rpc::client::ClientRpc;
use crate::rpc::context::RpcContext;
use crate::rpc::rpc_common::{Result, RpcError};
use crate::rpc::server::ServerRpc;
use crate::rpc::service::{RequestBuffer, Service};
use crate::rpc::transport::{CompletionEvent, EventKind};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientEvent {
    RequestSent,
    ReplyReceived,
    BulkRequestReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerEvent {
    BulkGetReplied,
    BulkPutSent,
    ReplySent,
}

/// What an MD belongs to.
#[derive(Clone)]
pub(crate) enum Target {
    Opaque(u64),
    Request { service: Arc<Service>, buffer: Arc<RequestBuffer> },
    Client { rpc: Arc<ClientRpc>, kind: ClientEvent },
    Server { rpc: Arc<ServerRpc>, kind: ServerEvent },
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Opaque(tag) => write!(f, "Opaque({})", tag),
            Target::Request { service, .. } => write!(f, "Request(service {})", service.id()),
            Target::Client { rpc, kind } => write!(f, "Client({:?}, service {})", kind, rpc.service()),
            Target::Server { kind, .. } => write!(f, "Server({:?})", kind),
        }
    }
}

/// Completion slot of one expected sub-event.
#[derive(Debug, Clone)]
pub(crate) struct RpcEvent {
    pub(crate) fired: bool,
    pub(crate) status: Result<()>,
    pub(crate) kind: Option<EventKind>,
}

impl RpcEvent {
    /// Nothing expected.
    pub(crate) fn idle() -> Self {
        RpcEvent { fired: true, status: Ok(()), kind: None }
    }

    pub(crate) fn arm(&mut self) {
        self.fired = false;
        self.status = Ok(());
        self.kind = None;
    }

    fn fire(&mut self, ev: &CompletionEvent) {
        debug_assert!(!self.fired, "sub-event fired twice");
        self.fired = true;
        self.kind = Some(ev.kind);
        self.status = if ev.kind == EventKind::Unlink {
            Err(RpcError::Interrupted)
        } else {
            ev.status.clone()
        };
    }
}

impl RpcContext {
    pub(crate) fn dispatch_event(&self, ev: CompletionEvent) {
        trace_verbose!("completion {:?} status {:?} for {:?}", ev.kind, ev.status, ev.target);
        if ev.status.is_err() {
            self.with_counters(|c| c.errors += 1);
        }

        match &ev.target.0 {
            Target::Opaque(_) => {}
            Target::Client { rpc, kind } => {
                if *kind == ClientEvent::RequestSent && ev.status.is_ok() && ev.kind != EventKind::Unlink {
                    self.with_counters(|c| c.rpcs_sent += 1);
                }
                let mut inner = rpc.inner.lock();
                inner.event_mut(*kind).fire(&ev);
                self.scheduler.schedule(rpc.clone());
            }
            Target::Request { service, buffer } => self.request_received(service, buffer, &ev),
            Target::Server { rpc, kind } => self.server_event(rpc, *kind, &ev),
        }
    }

    fn request_received(&self, sv: &Arc<Service>, buf: &Arc<RequestBuffer>, ev: &CompletionEvent) {
        let mut guard = sv.inner.lock();
        buf.meta.lock().peer = ev.initiator;
        debug_assert!(guard.nposted > 0);
        guard.nposted -= 1;

        if guard.shutting_down {
            // finish_service frees it from the posted list
            return;
        }
        guard.posted.retain(|posted| !Arc::ptr_eq(posted, buf));

        let framing = match &ev.status {
            Err(e) => Err(e.clone()),
            Ok(()) if ev.mlength != MSG_SIZE => {
                Err(RpcError::Protocol(format!("message of {} bytes", ev.mlength)))
            }
            Ok(()) => buf.region.with(decode_header).and_then(|header| {
                if header.msg_type == service_request_type(sv.id()) {
                    Ok(())
                } else {
                    Err(RpcError::Protocol(format!("message type {}", header.msg_type)))
                }
            }),
        };
        if let Err(e) = framing {
            if ev.status.is_ok() {
                error!("dropping request from {} on service {}: {}", ev.initiator, sv.id(), e);
                self.with_counters(|c| c.errors += 1);
            }
            // hold a posted count so the service cannot drain while the lock
            // is dropped for the repost
            guard.nposted += 1;
            let mut guard = self.recycle_buffer(sv, guard, buf.clone());
            guard.nposted -= 1;
            return;
        }

        match guard.free.pop() {
            Some(rpc) => {
                rpc.init(buf.clone());
                guard.active.push(rpc.clone());
                self.scheduler.schedule(rpc);
            }
            None => {
                debug!("service {} out of slots, blocking request from {}", sv.id(), ev.initiator);
                guard.blocked.push_back(buf.clone());
            }
        }
        drop(guard);
        self.with_counters(|c| c.rpcs_rcvd += 1);
    }

    fn server_event(&self, rpc: &Arc<ServerRpc>, kind: ServerEvent, ev: &CompletionEvent) {
        if kind == ServerEvent::BulkGetReplied
            && ev.kind == EventKind::Send
            && ev.status.is_ok()
            && !ev.unlinked
        {
            // the data shows up in the following reply event
            return;
        }
        if ev.status.is_ok() && ev.kind != EventKind::Unlink {
            match kind {
                ServerEvent::BulkGetReplied => self.with_counters(|c| c.bulk_get += ev.mlength as u64),
                ServerEvent::BulkPutSent => self.with_counters(|c| c.bulk_put += ev.mlength as u64),
                ServerEvent::ReplySent => {}
            }
        }

        let Some(sv) = rpc.service() else { return };
        let _guard = sv.inner.lock();
        rpc.inner.lock().ev.fire(ev);
        self.scheduler.schedule(rpc.clone());
    }
}
