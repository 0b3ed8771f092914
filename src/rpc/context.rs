use crate::rpc::config::RpcConfig;
use crate::rpc::counters::RpcCounters;
use crate::rpc::peer::Peer;
use crate::rpc::rpc_common::{Portal, ProcessId, Result, RpcError, SERVICE_MAX_ID};
use crate::rpc::service::Service;
use crate::rpc::timer::Timer;
use crate::rpc::transport::{EventHandler, Transport};
use crate::rpc::workitem::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    None,
    NiInit,
    EqInit,
    WiInit,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub credits: usize,
    pub control_queued: usize,
    pub normal_queued: usize,
}

struct GlobalState {
    state: EngineState,
    services: Vec<Option<Arc<Service>>>,
    counters: RpcCounters,
    matchbits: u64,
}

/// Everything one engine instance owns. All operations go through it.
pub struct RpcContext {
    config: RpcConfig,
    transport: Arc<dyn Transport>,
    pub(crate) scheduler: Scheduler,
    pub(crate) timer: Timer,
    global: spin::Mutex<GlobalState>,
    peers: spin::RwLock<HashMap<u64, Arc<Peer>>>,
}

impl RpcContext {
    pub fn startup(config: RpcConfig, transport: Arc<dyn Transport>) -> Result<Arc<RpcContext>> {
        let scheduler = Scheduler::start(config.workers).map_err(|e| {
            error!("failed to start work item threads: {}", e);
            RpcError::ResourceExhausted("work item threads")
        })?;
        let timer = match Timer::start() {
            Ok(timer) => timer,
            Err(e) => {
                error!("failed to start timer thread: {}", e);
                scheduler.stop();
                return Err(RpcError::ResourceExhausted("timer thread"));
            }
        };

        let matchbits = config.matchbits_seed.unwrap_or_else(|| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            secs << 48
        });

        let ctx = Arc::new(RpcContext {
            config,
            transport,
            scheduler,
            timer,
            global: spin::Mutex::new(GlobalState {
                state: EngineState::NiInit,
                services: vec![None; SERVICE_MAX_ID as usize + 1],
                counters: RpcCounters::default(),
                matchbits,
            }),
            peers: spin::RwLock::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&ctx);
        let handler: EventHandler = Arc::new(move |ev| {
            if let Some(ctx) = weak.upgrade() {
                ctx.dispatch_event(ev);
            }
        });
        ctx.transport.set_event_handler(Some(handler));
        if ctx.config.lazy_framework_portal {
            ctx.transport.set_lazy_portal(Portal::FrameworkRequest, true);
        }
        ctx.set_state(EngineState::EqInit);
        ctx.set_state(EngineState::WiInit);
        ctx.set_state(EngineState::Running);
        info!("rpc engine running on {}", ctx.transport.self_id());
        Ok(ctx)
    }

    /// Stops the engine. Every service must have been removed first.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut global = self.global.lock();
            match global.state {
                EngineState::Running => {}
                EngineState::Stopping => return Ok(()),
                _ => return Err(RpcError::InvalidState("engine not running")),
            }
            if let Some(sv) = global.services.iter().flatten().next() {
                error!("service {} ({}) still registered at shutdown", sv.id(), sv.name());
                return Err(RpcError::InvalidState("services still registered"));
            }
            global.state = EngineState::Stopping;
        }

        self.timer.stop();
        self.scheduler.stop();
        if self.config.lazy_framework_portal {
            self.transport.set_lazy_portal(Portal::FrameworkRequest, false);
        }
        self.transport.set_event_handler(None);

        let peers: Vec<_> = self.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            let (credits, control, normal) = peer.stats();
            if credits != self.config.peer_credits || control + normal != 0 {
                warn!(
                    "peer {} at shutdown: {} credits, {} queued",
                    peer.nid(),
                    credits,
                    control + normal
                );
            }
        }
        info!("rpc engine stopped");
        Ok(())
    }

    fn set_state(&self, state: EngineState) {
        self.global.lock().state = state;
    }

    pub fn state(&self) -> EngineState {
        self.global.lock().state
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            _ => Err(RpcError::InvalidState("engine not running")),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn self_id(&self) -> ProcessId {
        self.transport.self_id()
    }

    /// Fresh match bits for a reply or bulk buffer.
    pub fn next_id(&self) -> u64 {
        let mut global = self.global.lock();
        let id = global.matchbits;
        global.matchbits = global.matchbits.wrapping_add(1);
        id
    }

    pub fn get_counters(&self) -> RpcCounters {
        self.global.lock().counters
    }

    pub fn set_counters(&self, counters: RpcCounters) {
        self.global.lock().counters = counters;
    }

    pub(crate) fn with_counters(&self, f: impl FnOnce(&mut RpcCounters)) {
        f(&mut self.global.lock().counters);
    }

    pub(crate) fn insert_service(&self, service: Arc<Service>) -> Result<()> {
        let mut global = self.global.lock();
        let slot = &mut global.services[service.id() as usize];
        if slot.is_some() {
            return Err(RpcError::AlreadyRegistered(service.id()));
        }
        *slot = Some(service);
        Ok(())
    }

    pub fn service(&self, id: u32) -> Option<Arc<Service>> {
        self.global.lock().services.get(id as usize).cloned().flatten()
    }

    /// Drops the registry entry. The service itself is drained separately
    /// with `shutdown_service` and `finish_service`.
    pub fn remove_service(&self, service: &Arc<Service>) -> Result<()> {
        let mut global = self.global.lock();
        match global.services.get_mut(service.id() as usize) {
            Some(slot) if slot.as_ref().map_or(false, |sv| Arc::ptr_eq(sv, service)) => {
                *slot = None;
                info!("removed service {} ({})", service.id(), service.name());
                Ok(())
            }
            _ => Err(RpcError::NoSuchService(service.id())),
        }
    }

    pub(crate) fn find_or_create_peer(&self, nid: u64) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().get(&nid) {
            return peer.clone();
        }
        let fresh = Arc::new(Peer::new(nid, self.config.peer_credits));
        // another thread may have won the race while we were unlocked
        self.peers.write().entry(nid).or_insert(fresh).clone()
    }

    pub fn peer_stats(&self, nid: u64) -> Option<PeerStats> {
        self.peers.read().get(&nid).map(|peer| {
            let (credits, control_queued, normal_queued) = peer.stats();
            PeerStats { credits, control_queued, normal_queued }
        })
    }
}
