use crate::rpc::capsule::WireOrder;
use crate::rpc::rpc_common::PEER_CREDITS;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Maximum RPCs dispatched to one peer at a time.
    pub peer_credits: usize,
    /// Threads on the concurrent work-item lane.
    pub workers: usize,
    /// Byte order of outgoing messages.
    pub wire_order: WireOrder,
    /// Hold control requests that arrive before a buffer is posted.
    pub lazy_framework_portal: bool,
    /// Initial match-bits value; seeded from the wall clock when unset.
    pub matchbits_seed: Option<u64>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            peer_credits: PEER_CREDITS,
            workers: 4,
            wire_order: WireOrder::Native,
            lazy_framework_portal: true,
            matchbits_seed: None,
        }
    }
}

impl RpcConfig {
    pub fn with_peer_credits(mut self, credits: usize) -> Self {
        self.peer_credits = credits;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_wire_order(mut self, order: WireOrder) -> Self {
        self.wire_order = order;
        self
    }

    pub fn with_lazy_framework_portal(mut self, lazy: bool) -> Self {
        self.lazy_framework_portal = lazy;
        self
    }

    pub fn with_matchbits_seed(mut self, seed: u64) -> Self {
        self.matchbits_seed = Some(seed);
        self
    }
}
