/// Engine-wide statistics, read and written as a snapshot under the global
/// lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcCounters {
    /// Completions with a failure status and malformed inbound requests.
    pub errors: u64,
    pub rpcs_sent: u64,
    pub rpcs_rcvd: u64,
    pub rpcs_dropped: u64,
    pub rpcs_expired: u64,
    /// Bytes pulled by server-side bulk GETs.
    pub bulk_get: u64,
    /// Bytes pushed by server-side bulk PUTs.
    pub bulk_put: u64,
}
