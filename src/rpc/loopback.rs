//! In-process transport: every attached node shares one fabric, so PUTs and
//! GETs are plain copies between registered buffers. Each node delivers its
//! completion events in order from its own thread.
use crate::rpc::rpc_common::{Portal, ProcessId, Result, RpcError};
use crate::rpc::transport::{
    CompletionEvent, EventHandler, EventKind, EventTarget, MdBuffer, MdHandle, MdOp, Transport,
};
use crossbeam::channel::{unbounded, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

struct PassiveMd {
    cookie: u64,
    match_bits: u64,
    buffer: MdBuffer,
    op: MdOp,
    peer: Option<ProcessId>,
    target: EventTarget,
}

impl PassiveMd {
    fn accepts(&self, match_bits: u64, op: MdOp, initiator: ProcessId) -> bool {
        self.match_bits == match_bits && self.op == op && self.peer.map_or(true, |p| p.nid == initiator.nid)
    }
}

/// A PUT that reached a lazy portal before any buffer matched it.
struct DelayedPut {
    cookie: u64,
    initiator: ProcessId,
    match_bits: u64,
    data: Vec<u8>,
}

struct NodeEntry {
    id: ProcessId,
    events: Sender<CompletionEvent>,
    portals: HashMap<Portal, Vec<PassiveMd>>,
    lazy: HashSet<Portal>,
    delayed: HashMap<Portal, VecDeque<DelayedPut>>,
    /// Active PUTs of this node waiting in someone's lazy portal.
    parked: HashMap<u64, EventTarget>,
}

impl NodeEntry {
    fn emit(
        &self,
        status: Result<()>,
        kind: EventKind,
        target: EventTarget,
        mlength: usize,
        initiator: ProcessId,
        unlinked: bool,
    ) {
        let ev = CompletionEvent { status, kind, target, mlength, initiator, unlinked };
        if self.events.send(ev).is_err() {
            error!("event queue of {} is gone", self.id);
        }
    }

    fn take_match(&mut self, portal: Portal, match_bits: u64, op: MdOp, initiator: ProcessId) -> Option<PassiveMd> {
        let list = self.portals.get_mut(&portal)?;
        let pos = list.iter().position(|md| md.accepts(match_bits, op, initiator))?;
        Some(list.remove(pos))
    }
}

#[derive(Default)]
struct Fabric {
    nodes: HashMap<u64, NodeEntry>,
}

impl Fabric {
    /// Tells the initiator of a parked PUT that it left.
    fn release_parked(&mut self, initiator: ProcessId, cookie: u64, len: usize) {
        if let Some(node) = self.nodes.get_mut(&initiator.nid) {
            if let Some(target) = node.parked.remove(&cookie) {
                node.emit(Ok(()), EventKind::Send, target, len, initiator, true);
            }
        }
    }
}

pub struct LoopbackNetwork {
    fabric: spin::Mutex<Fabric>,
    next_cookie: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            fabric: spin::Mutex::new(Fabric::default()),
            next_cookie: AtomicU64::new(1),
        })
    }

    pub fn attach(self: &Arc<Self>, nid: u64) -> Result<Arc<LoopbackTransport>> {
        let id = ProcessId::new(nid, 0);
        let (tx, rx) = unbounded::<CompletionEvent>();
        let handler: Arc<spin::RwLock<Option<EventHandler>>> = Arc::new(spin::RwLock::new(None));
        {
            let mut fabric = self.fabric.lock();
            if fabric.nodes.contains_key(&nid) {
                return Err(RpcError::InvalidArgument(format!("node {} already attached", nid)));
            }
            fabric.nodes.insert(
                nid,
                NodeEntry {
                    id,
                    events: tx,
                    portals: HashMap::new(),
                    lazy: HashSet::new(),
                    delayed: HashMap::new(),
                    parked: HashMap::new(),
                },
            );
        }

        let thread_handler = handler.clone();
        let spawned = thread::Builder::new().name(format!("lo_eq_{}", nid)).spawn(move || {
            for ev in rx.iter() {
                let handler = thread_handler.read().clone();
                match handler {
                    Some(handler) => handler(ev),
                    None => trace_verbose!("no handler for {:?} event", ev.kind),
                }
            }
        });
        if let Err(e) = spawned {
            error!("failed to spawn event thread for node {}: {}", nid, e);
            self.detach(nid);
            return Err(RpcError::ResourceExhausted("loopback event thread"));
        }
        debug!("loopback node {} attached", nid);
        Ok(Arc::new(LoopbackTransport { id, net: self.clone(), handler }))
    }

    /// Makes the node unreachable. Its buffers vanish without events.
    pub fn detach(&self, nid: u64) {
        let removed = self.fabric.lock().nodes.remove(&nid);
        if removed.is_some() {
            debug!("loopback node {} detached", nid);
        }
    }

    fn cookie(&self) -> u64 {
        self.next_cookie.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct LoopbackTransport {
    id: ProcessId,
    net: Arc<LoopbackNetwork>,
    handler: Arc<spin::RwLock<Option<EventHandler>>>,
}

impl LoopbackTransport {
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.net
    }

    fn put(
        &self,
        cookie: u64,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        peer: ProcessId,
        target: EventTarget,
    ) -> Result<()> {
        let data = buffer.gather();
        let mut fabric = self.net.fabric.lock();
        let Some(dest) = fabric.nodes.get_mut(&peer.nid) else {
            let me = fabric.nodes.get(&self.id.nid).ok_or(RpcError::Transport(libc::ENODEV))?;
            me.emit(Err(RpcError::Transport(libc::EHOSTUNREACH)), EventKind::Send, target, 0, self.id, true);
            return Ok(());
        };

        let delivered = if let Some(md) = dest.take_match(portal, match_bits, MdOp::Put, self.id) {
            let mlength = md.buffer.scatter(&data);
            dest.emit(Ok(()), EventKind::Put, md.target, mlength, self.id, true);
            true
        } else if dest.lazy.contains(&portal) {
            dest.delayed.entry(portal).or_default().push_back(DelayedPut {
                cookie,
                initiator: self.id,
                match_bits,
                data,
            });
            let me = fabric.nodes.get_mut(&self.id.nid).ok_or(RpcError::Transport(libc::ENODEV))?;
            me.parked.insert(cookie, target);
            return Ok(());
        } else {
            trace_verbose!("dropping put {:#x} on {:?} of {}", match_bits, portal, peer);
            false
        };

        let me = fabric.nodes.get(&self.id.nid).ok_or(RpcError::Transport(libc::ENODEV))?;
        let sent = if delivered { buffer.len() } else { 0 };
        me.emit(Ok(()), EventKind::Send, target, sent, self.id, true);
        Ok(())
    }

    fn get(
        &self,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        peer: ProcessId,
        target: EventTarget,
    ) -> Result<()> {
        let mut fabric = self.net.fabric.lock();
        let found = match fabric.nodes.get_mut(&peer.nid) {
            None => Err(RpcError::Transport(libc::EHOSTUNREACH)),
            Some(dest) => match dest.take_match(portal, match_bits, MdOp::Get, self.id) {
                None => Err(RpcError::Transport(libc::ENOENT)),
                Some(md) => {
                    let data = md.buffer.gather();
                    dest.emit(Ok(()), EventKind::Get, md.target, data.len(), self.id, true);
                    Ok(data)
                }
            },
        };
        let me = fabric.nodes.get(&self.id.nid).ok_or(RpcError::Transport(libc::ENODEV))?;
        match found {
            Ok(data) => {
                let mlength = buffer.scatter(&data);
                me.emit(Ok(()), EventKind::Send, target.clone(), 0, self.id, false);
                me.emit(Ok(()), EventKind::Reply, target, mlength, peer, true);
            }
            Err(e) => me.emit(Err(e), EventKind::Send, target, 0, self.id, true),
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn self_id(&self) -> ProcessId {
        self.id
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.handler.write() = handler;
    }

    fn set_lazy_portal(&self, portal: Portal, lazy: bool) {
        let mut fabric = self.net.fabric.lock();
        let Some(me) = fabric.nodes.get_mut(&self.id.nid) else { return };
        if lazy {
            me.lazy.insert(portal);
            return;
        }
        me.lazy.remove(&portal);
        let dropped: Vec<DelayedPut> = me.delayed.remove(&portal).map(Vec::from).unwrap_or_default();
        for put in dropped {
            fabric.release_parked(put.initiator, put.cookie, 0);
        }
    }

    fn post_passive(
        &self,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        op: MdOp,
        peer: Option<ProcessId>,
        target: EventTarget,
    ) -> Result<MdHandle> {
        let cookie = self.net.cookie();
        let md = PassiveMd { cookie, match_bits, buffer, op, peer, target };

        let mut fabric = self.net.fabric.lock();
        let me = fabric.nodes.get_mut(&self.id.nid).ok_or(RpcError::Transport(libc::ENODEV))?;
        let waiting = me.delayed.get_mut(&portal).and_then(|queue| {
            let pos = queue.iter().position(|put| md.accepts(put.match_bits, MdOp::Put, put.initiator))?;
            queue.remove(pos)
        });
        match waiting {
            Some(put) => {
                let mlength = md.buffer.scatter(&put.data);
                me.emit(Ok(()), EventKind::Put, md.target, mlength, put.initiator, true);
                fabric.release_parked(put.initiator, put.cookie, put.data.len());
            }
            None => me.portals.entry(portal).or_default().push(md),
        }
        Ok(MdHandle(cookie))
    }

    fn post_active(
        &self,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        op: MdOp,
        peer: ProcessId,
        target: EventTarget,
    ) -> Result<MdHandle> {
        let cookie = self.net.cookie();
        match op {
            MdOp::Put => self.put(cookie, portal, match_bits, buffer, peer, target)?,
            MdOp::Get => self.get(portal, match_bits, buffer, peer, target)?,
        }
        Ok(MdHandle(cookie))
    }

    fn unlink(&self, handle: MdHandle) {
        let mut fabric = self.net.fabric.lock();
        let Some(me) = fabric.nodes.get_mut(&self.id.nid) else { return };

        let attached = me.portals.values_mut().find_map(|list| {
            let pos = list.iter().position(|md| md.cookie == handle.0)?;
            Some(list.remove(pos))
        });
        if let Some(md) = attached {
            me.emit(Ok(()), EventKind::Unlink, md.target, 0, self.id, true);
            return;
        }

        if let Some(target) = me.parked.remove(&handle.0) {
            me.emit(Ok(()), EventKind::Unlink, target, 0, self.id, true);
            for node in fabric.nodes.values_mut() {
                for queue in node.delayed.values_mut() {
                    queue.retain(|put| put.cookie != handle.0);
                }
            }
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.net.detach(self.id.nid);
    }
}
