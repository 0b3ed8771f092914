use std::fmt;
use thiserror::Error;

/// Default number of RPCs that may be in flight to one peer.
pub const PEER_CREDITS: usize = 16;

pub const SERVICE_SHUTDOWN: u32 = 0;
pub const SERVICE_MAKE_SESSION: u32 = 1;
pub const SERVICE_REMOVE_SESSION: u32 = 2;
pub const SERVICE_BATCH: u32 = 3;
pub const SERVICE_TEST: u32 = 4;
pub const SERVICE_QUERY_STAT: u32 = 5;
pub const SERVICE_JOIN: u32 = 6;
pub const SERVICE_DEBUG: u32 = 7;
/// Ids up to and including this one form the control range.
pub const FRAMEWORK_SERVICE_MAX_ID: u32 = 10;
pub const SERVICE_BRW: u32 = 11;
pub const SERVICE_PING: u32 = 12;
pub const SERVICE_MAX_ID: u32 = 12;

/// Logical endpoints on a node. Request buffers of control services sit on
/// their own portal so test traffic can never starve them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Portal {
    Request,
    FrameworkRequest,
    Rdma,
}

#[inline]
pub fn is_framework_service(id: u32) -> bool {
    id <= FRAMEWORK_SERVICE_MAX_ID
}

/// Portal that request buffers of service `id` are posted on.
#[inline]
pub fn request_portal(id: u32) -> Portal {
    if is_framework_service(id) {
        Portal::FrameworkRequest
    } else {
        Portal::Request
    }
}

/// Control-range RPCs jump the peer queue, except the two query services.
#[inline]
pub fn uses_control_queue(id: u32) -> bool {
    is_framework_service(id) && id != SERVICE_DEBUG && id != SERVICE_QUERY_STAT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub nid: u64,
    pub pid: u32,
}

impl ProcessId {
    pub const ANY: ProcessId = ProcessId { nid: u64::MAX, pid: u32::MAX };

    pub fn new(nid: u64, pid: u32) -> Self {
        ProcessId { nid, pid }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@lo", self.pid, self.nid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("service {0} is already registered")]
    AlreadyRegistered(u32),
    #[error("no such service {0}")]
    NoSuchService(u32),
    #[error("out of resources: {0}")]
    ResourceExhausted(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("rpc timed out")]
    Timeout,
    #[error("service is shutting down")]
    Shutdown,
    #[error("rpc interrupted")]
    Interrupted,
    #[error("remote status {0}")]
    Remote(u32),
    #[error("transport error {0}")]
    Transport(i32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, RpcError>;
