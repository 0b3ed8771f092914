#![allow(dead_code)]

use crossbeam::channel::{unbounded, Receiver, Sender};
use selftest_rpc::{
    ClientRpc, ClientRpcBuilder, CompletionEvent, EventKind, LoopbackNetwork, LoopbackTransport, ProcessId, RpcConfig,
    RpcContext, Service, Transport,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const CLIENT_NID: u64 = 1;
pub const SERVER_NID: u64 = 2;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Two engines on one loopback fabric.
pub struct Pair {
    pub net: Arc<LoopbackNetwork>,
    pub client: Arc<RpcContext>,
    pub server: Arc<RpcContext>,
}

impl Pair {
    pub fn new() -> Self {
        Pair::with_configs(RpcConfig::default(), RpcConfig::default())
    }

    pub fn with_configs(client: RpcConfig, server: RpcConfig) -> Self {
        init_tracing();
        let net = LoopbackNetwork::new();
        let server = RpcContext::startup(server, net.attach(SERVER_NID).unwrap()).unwrap();
        let client = RpcContext::startup(client, net.attach(CLIENT_NID).unwrap()).unwrap();
        Pair { net, client, server }
    }

    pub fn server_id(&self) -> ProcessId {
        self.server.self_id()
    }

    /// Drains and removes `services`, then stops both engines.
    pub fn teardown(self, services: &[Arc<Service>]) {
        for service in services {
            stop_service(&self.server, service);
        }
        self.client.shutdown().unwrap();
        self.server.shutdown().unwrap();
    }
}

/// A node that accepts traffic but never answers it.
pub fn silent_node(net: &Arc<LoopbackNetwork>, nid: u64) -> Arc<LoopbackTransport> {
    net.attach(nid).unwrap()
}

pub fn silent_id(lo: &LoopbackTransport) -> ProcessId {
    lo.self_id()
}

/// A bare transport endpoint for hand-built traffic, with its events on a
/// channel.
pub fn raw_node(net: &Arc<LoopbackNetwork>, nid: u64) -> (Arc<LoopbackTransport>, Receiver<CompletionEvent>) {
    let lo = net.attach(nid).unwrap();
    let (tx, rx) = unbounded();
    lo.set_event_handler(Some(Arc::new(move |ev| {
        let _ = tx.send(ev);
    })));
    (lo, rx)
}

/// Skips events until one of `kind` shows up.
pub fn next_event(events: &Receiver<CompletionEvent>, kind: EventKind) -> CompletionEvent {
    loop {
        let ev = events.recv_timeout(Duration::from_secs(10)).expect("event never arrived");
        if ev.kind == kind {
            return ev;
        }
    }
}

pub fn stop_service(ctx: &RpcContext, service: &Arc<Service>) {
    ctx.shutdown_service(service);
    wait_until(|| ctx.finish_service(service));
    ctx.remove_service(service).unwrap();
}

pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Completion sink for client RPCs.
pub struct Completions {
    tx: Sender<Arc<ClientRpc>>,
    rx: Receiver<Arc<ClientRpc>>,
}

impl Completions {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Completions { tx, rx }
    }

    pub fn attach(&self, builder: ClientRpcBuilder) -> ClientRpcBuilder {
        let tx = self.tx.clone();
        builder.on_done(move |rpc| {
            let _ = tx.send(rpc.clone());
        })
    }

    pub fn next(&self) -> Arc<ClientRpc> {
        self.rx.recv_timeout(Duration::from_secs(10)).expect("rpc never completed")
    }

    pub fn assert_idle(&self, wait: Duration) {
        assert!(self.rx.recv_timeout(wait).is_err(), "unexpected completion");
    }
}

/// Builds and posts one RPC, returning it.
pub fn post(ctx: &Arc<RpcContext>, builder: ClientRpcBuilder) -> Arc<ClientRpc> {
    let rpc = builder.build(ctx).unwrap();
    ctx.post_rpc(&rpc).unwrap();
    rpc
}
