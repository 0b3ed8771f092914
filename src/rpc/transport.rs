//! Contract with the connectionless transport underneath the engine.
//!
//! Memory descriptors (MDs) are either passive (posted on a portal, matched
//! by a 64-bit tag, consumed by exactly one remote operation) or active
//! (the local side of a PUT or GET). Every MD carries an [`EventTarget`] that
//! comes back untouched in each completion event it produces.
use crate::rpc::dispatcher::Target;
use crate::rpc::rpc_common::{Portal, ProcessId, Result, RpcError};
use std::fmt;
use std::sync::Arc;

/// A shareable byte buffer the transport reads from or writes into.
#[derive(Clone)]
pub struct Region(Arc<spin::Mutex<Vec<u8>>>);

impl Region {
    pub fn new(len: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| RpcError::ResourceExhausted("region memory"))?;
        buf.resize(len, 0);
        Ok(Region(Arc::new(spin::Mutex::new(buf))))
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Region(Arc::new(spin::Mutex::new(buf)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({} bytes)", self.len())
    }
}

/// Scatter/gather list handed to the transport.
#[derive(Clone, Debug)]
pub struct MdBuffer {
    pub iov: Vec<Region>,
}

impl MdBuffer {
    pub fn new(iov: Vec<Region>) -> Self {
        MdBuffer { iov }
    }

    pub fn single(region: Region) -> Self {
        MdBuffer { iov: vec![region] }
    }

    pub fn len(&self) -> usize {
        self.iov.iter().map(Region::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for region in &self.iov {
            region.with(|bytes| out.extend_from_slice(bytes));
        }
        out
    }

    /// Copies `data` across the iov in order and returns the bytes written.
    pub fn scatter(&self, data: &[u8]) -> usize {
        let mut offset = 0;
        for region in &self.iov {
            if offset == data.len() {
                break;
            }
            offset += region.with_mut(|bytes| {
                let n = bytes.len().min(data.len() - offset);
                bytes[..n].copy_from_slice(&data[offset..offset + n]);
                n
            });
        }
        offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MdHandle(pub u64);

impl MdHandle {
    pub const INVALID: MdHandle = MdHandle(0);

    pub fn is_valid(&self) -> bool {
        *self != MdHandle::INVALID
    }
}

impl Default for MdHandle {
    fn default() -> Self {
        MdHandle::INVALID
    }
}

/// Remote operation a passive MD accepts, or the one an active MD performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdOp {
    Put,
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Local side of an outbound PUT or GET request has left.
    Send,
    /// A remote PUT landed in a passive MD.
    Put,
    /// A remote GET read from a passive MD.
    Get,
    /// Data of an outbound GET arrived.
    Reply,
    /// The MD was unlinked before it completed.
    Unlink,
}

/// Opaque per-MD cookie routed back to the engine.
#[derive(Clone)]
pub struct EventTarget(pub(crate) Target);

impl EventTarget {
    /// A target the engine ignores; lets other transport users tag MDs.
    pub fn opaque(tag: u64) -> Self {
        EventTarget(Target::Opaque(tag))
    }

    pub fn tag(&self) -> Option<u64> {
        match self.0 {
            Target::Opaque(tag) => Some(tag),
            _ => None,
        }
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub status: Result<()>,
    pub kind: EventKind,
    pub target: EventTarget,
    /// Bytes actually moved.
    pub mlength: usize,
    pub initiator: ProcessId,
    /// The MD is gone after this event.
    pub unlinked: bool,
}

pub type EventHandler = Arc<dyn Fn(CompletionEvent) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn self_id(&self) -> ProcessId;

    /// Installs the single completion callback. Events may be delivered on
    /// any thread, possibly before the posting call has returned.
    fn set_event_handler(&self, handler: Option<EventHandler>);

    /// A lazy portal holds PUTs that find no matching MD until one is posted.
    fn set_lazy_portal(&self, portal: Portal, lazy: bool);

    /// Posts a one-shot buffer matched by `match_bits` and, if given, the
    /// initiator's node.
    fn post_passive(
        &self,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        op: MdOp,
        peer: Option<ProcessId>,
        target: EventTarget,
    ) -> Result<MdHandle>;

    /// Starts a PUT from `buffer` or a GET into it against a remote passive MD.
    fn post_active(
        &self,
        portal: Portal,
        match_bits: u64,
        buffer: MdBuffer,
        op: MdOp,
        peer: ProcessId,
        target: EventTarget,
    ) -> Result<MdHandle>;

    /// Best effort. An MD that has not completed yet produces an
    /// [`EventKind::Unlink`] event.
    fn unlink(&self, handle: MdHandle);
}
