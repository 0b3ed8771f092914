//! Self-test RPC engine.
//!
//! Request/reply/bulk RPCs between nodes over a connectionless, RDMA-capable
//! transport. Sender-side flow control is credit based per peer, server
//! concurrency is bounded by a per-service slot pool, and every RPC is driven
//! by a resumable state machine run on a shared work-item scheduler.

#[macro_use]
pub mod rpc;
pub mod ping;

pub use ping::{PingClient, PingServer, PING_TEST_MAGIC};
pub use rpc::bulk::{BulkDescriptor, MAX_IOV, PAGE_SIZE};
pub use rpc::capsule::{MsgBody, Payload, SrpcMsg, WireOrder, MSG_SIZE, MSG_VERSION};
pub use rpc::client::{ClientRpc, ClientRpcBuilder, ClientState};
pub use rpc::config::RpcConfig;
pub use rpc::context::{EngineState, PeerStats, RpcContext};
pub use rpc::counters::RpcCounters;
pub use rpc::loopback::{LoopbackNetwork, LoopbackTransport};
pub use rpc::rpc_common::*;
pub use rpc::server::{ServerCall, ServerState, ServiceHandler};
pub use rpc::service::Service;
pub use rpc::transport::{
    CompletionEvent, EventHandler, EventKind, EventTarget, MdBuffer, MdHandle, MdOp, Region, Transport,
};
