//! Ping test: the smallest service that exercises a full request/reply
//! round trip.
use crate::rpc::capsule::{MsgBody, Payload};
use crate::rpc::client::{ClientRpc, ClientRpcBuilder};
use crate::rpc::rpc_common::{ProcessId, Result, RpcError, SERVICE_PING};
use crate::rpc::server::{ServerCall, ServiceHandler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, trace};

pub const PING_TEST_MAGIC: u32 = 0xbabeface;

/// Echoes the sequence number of every well-formed ping.
#[derive(Debug, Default)]
pub struct PingServer;

impl ServiceHandler for PingServer {
    fn handle(&self, call: &mut ServerCall) -> Result<()> {
        let Payload::PingRequest { magic, seq, .. } = *call.request_payload() else {
            error!("non-ping request from {}", call.peer());
            return Err(RpcError::InvalidArgument("not a ping request".into()));
        };
        if magic != PING_TEST_MAGIC {
            error!("unexpected ping magic {:#x} from {}", magic, call.peer());
            return Err(RpcError::InvalidArgument(format!("ping magic {:#x}", magic)));
        }
        trace!("ping {} from {}{}", seq, call.peer(), if call.is_swapped() { " (swapped)" } else { "" });
        call.reply(0, Payload::PingReply { magic: PING_TEST_MAGIC, seq });
        Ok(())
    }
}

/// Client half of the ping test. Hands out sequence numbers and checks
/// replies.
#[derive(Debug, Default)]
pub struct PingClient {
    seq: spin::Mutex<u32>,
    errors: AtomicU64,
}

impl PingClient {
    pub fn new() -> Self {
        PingClient::default()
    }

    /// Builder for the next ping. The caller adds a completion callback,
    /// builds and posts it.
    pub fn prep_rpc(&self, dest: ProcessId) -> ClientRpcBuilder {
        let seq = {
            let mut next = self.seq.lock();
            let seq = *next;
            *next = next.wrapping_add(1);
            seq
        };
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        ClientRpc::builder(dest, SERVICE_PING).payload(Payload::PingRequest {
            magic: PING_TEST_MAGIC,
            seq,
            time_sec: now.as_secs(),
            time_usec: now.subsec_micros() as u64,
        })
    }

    /// Validates a finished ping and returns its round-trip time.
    pub fn done_rpc(&self, rpc: &ClientRpc) -> Result<Duration> {
        let rc = self.check(rpc);
        if let Err(e) = &rc {
            self.errors.fetch_add(1, Ordering::Relaxed);
            error!("ping to {} failed: {}", rpc.dest(), e);
        }
        rc
    }

    fn check(&self, rpc: &ClientRpc) -> Result<Duration> {
        rpc.remote_result()?;
        let Payload::PingRequest { seq, time_sec, time_usec, .. } = *rpc.request().payload() else {
            return Err(RpcError::InvalidArgument("not a ping rpc".into()));
        };
        let reply = rpc.reply().ok_or_else(|| RpcError::Protocol("ping without reply".into()))?;
        let (magic, reply_seq) = match reply.body {
            MsgBody::Reply { payload: Payload::PingReply { magic, seq }, .. } => (magic, seq),
            _ => return Err(RpcError::Protocol("malformed ping reply".into())),
        };
        if magic != PING_TEST_MAGIC {
            return Err(RpcError::Protocol(format!("ping reply magic {:#x}", magic)));
        }
        if reply_seq != seq {
            return Err(RpcError::Protocol(format!("ping reply seq {}, expected {}", reply_seq, seq)));
        }
        let sent = UNIX_EPOCH + Duration::from_secs(time_sec) + Duration::from_micros(time_usec);
        Ok(SystemTime::now().duration_since(sent).unwrap_or_default())
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
