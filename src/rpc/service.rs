use crate::rpc::capsule::MSG_SIZE;
use crate::rpc::context::RpcContext;
use crate::rpc::dispatcher::Target;
use crate::rpc::rpc_common::{is_framework_service, request_portal, ProcessId, Result, RpcError, SERVICE_MAX_ID};
use crate::rpc::server::{ServerRpc, ServiceHandler};
use crate::rpc::transport::{EventTarget, MdBuffer, MdHandle, MdOp, Region};
use crate::rpc::workitem::Lane;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub(crate) struct BufferMeta {
    pub(crate) mdh: MdHandle,
    pub(crate) peer: ProcessId,
    post_seq: u64,
}

/// Receive buffer for one inbound request.
pub(crate) struct RequestBuffer {
    pub(crate) region: Region,
    pub(crate) meta: spin::Mutex<BufferMeta>,
}

impl RequestBuffer {
    fn new() -> Result<Self> {
        Ok(RequestBuffer {
            region: Region::new(MSG_SIZE)?,
            meta: spin::Mutex::new(BufferMeta {
                mdh: MdHandle::INVALID,
                peer: ProcessId::ANY,
                post_seq: 0,
            }),
        })
    }

    pub(crate) fn peer(&self) -> ProcessId {
        self.meta.lock().peer
    }
}

impl fmt::Debug for RequestBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestBuffer({:?})", self.meta.lock())
    }
}

pub(crate) struct ServiceInner {
    pub(crate) shutting_down: bool,
    /// Buffers to drop instead of reposting.
    pub(crate) nprune: usize,
    pub(crate) nposted: usize,
    pub(crate) free: Vec<Arc<ServerRpc>>,
    pub(crate) active: Vec<Arc<ServerRpc>>,
    pub(crate) posted: Vec<Arc<RequestBuffer>>,
    /// Requests that arrived while every slot was busy.
    pub(crate) blocked: VecDeque<Arc<RequestBuffer>>,
}

/// A registered request handler with its buffer pool and server RPC slots.
pub struct Service {
    id: u32,
    name: String,
    concurrency: usize,
    pub(crate) handler: Box<dyn ServiceHandler>,
    pub(crate) inner: spin::Mutex<ServiceInner>,
}

pub(crate) type ServiceGuard<'a> = spin::MutexGuard<'a, ServiceInner>;

impl Service {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub(crate) fn lane(&self) -> Lane {
        service_lane(self.id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    pub fn posted_buffers(&self) -> usize {
        self.inner.lock().nposted
    }

    pub fn active_rpcs(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn blocked_requests(&self) -> usize {
        self.inner.lock().blocked.len()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

pub(crate) fn service_lane(id: u32) -> Lane {
    if is_framework_service(id) {
        Lane::Serial
    } else {
        Lane::Concurrent
    }
}

impl RpcContext {
    pub fn register_service(
        self: &Arc<Self>,
        id: u32,
        name: &str,
        concurrency: usize,
        handler: impl ServiceHandler,
    ) -> Result<Arc<Service>> {
        self.check_running()?;
        if id > SERVICE_MAX_ID {
            return Err(RpcError::InvalidArgument(format!("service id {} out of range", id)));
        }
        if concurrency == 0 {
            return Err(RpcError::InvalidArgument("service concurrency must be positive".into()));
        }
        let mut free = Vec::new();
        free.try_reserve_exact(concurrency)
            .map_err(|_| RpcError::ResourceExhausted("server rpc slots"))?;

        let ctx = Arc::downgrade(self);
        let service = Arc::new_cyclic(|weak| {
            for _ in 0..concurrency {
                free.push(Arc::new(ServerRpc::new(weak.clone(), ctx.clone(), service_lane(id))));
            }
            Service {
                id,
                name: name.to_string(),
                concurrency,
                handler: Box::new(handler),
                inner: spin::Mutex::new(ServiceInner {
                    shutting_down: false,
                    nprune: 0,
                    nposted: 0,
                    free,
                    active: Vec::new(),
                    posted: Vec::new(),
                    blocked: VecDeque::new(),
                }),
            }
        });

        self.insert_service(service.clone())?;
        info!("registered service {} ({}) with {} slots", id, name, concurrency);
        Ok(service)
    }

    /// Posts `n` request buffers. Returns how many were posted, failing only
    /// if none were.
    pub fn add_buffers(&self, service: &Arc<Service>, n: usize) -> Result<usize> {
        let mut posted = 0;
        let mut failure = None;
        for _ in 0..n {
            let buf = match RequestBuffer::new() {
                Ok(buf) => Arc::new(buf),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let guard = service.inner.lock();
            if guard.shutting_down {
                failure = Some(RpcError::Shutdown);
                break;
            }
            let (_guard, rc) = self.post_buffer(service, guard, buf);
            if let Err(e) = rc {
                failure = Some(e);
                break;
            }
            posted += 1;
        }
        debug!("posted {} of {} buffers on service {}", posted, n, service.id());
        match failure {
            Some(e) if posted == 0 => Err(e),
            _ => Ok(posted),
        }
    }

    /// Marks `n` buffers to be dropped the next time they would be reposted.
    pub fn remove_buffers(&self, service: &Service, n: usize) {
        let mut inner = service.inner.lock();
        inner.nprune += n;
        debug!("service {} will prune {} buffers", service.id(), inner.nprune);
    }

    pub fn shutdown_service(&self, service: &Arc<Service>) {
        let handles: Vec<MdHandle> = {
            let mut inner = service.inner.lock();
            info!(
                "shutting down service {} ({}): {} active, {} posted",
                service.id(),
                service.name(),
                inner.active.len(),
                inner.nposted
            );
            inner.shutting_down = true;
            for rpc in &inner.active {
                self.scheduler.schedule(rpc.clone());
            }
            inner.posted.iter().map(|buf| buf.meta.lock().mdh).collect()
        };
        // buffers stay on the posted list until their unlink events arrive
        for mdh in handles.into_iter().filter(MdHandle::is_valid) {
            self.transport().unlink(mdh);
        }
    }

    /// Returns true once the service has fully drained, releasing every
    /// buffer and slot it still owns.
    pub fn finish_service(&self, service: &Service) -> bool {
        let mut inner = service.inner.lock();
        assert!(inner.shutting_down, "finish_service before shutdown_service");
        if inner.nposted != 0 || !inner.active.is_empty() {
            debug!(
                "service {} not drained: {} posted, {} active",
                service.id(),
                inner.nposted,
                inner.active.len()
            );
            return false;
        }
        inner.posted.clear();
        inner.blocked.clear();
        inner.free.clear();
        true
    }

    /// Posts `buf` with the service lock dropped around the transport call.
    /// The buffer is linked on the posted list first so its own completion
    /// finds it there.
    pub(crate) fn post_buffer<'a>(
        &self,
        service: &'a Arc<Service>,
        mut guard: ServiceGuard<'a>,
        buf: Arc<RequestBuffer>,
    ) -> (ServiceGuard<'a>, Result<()>) {
        let seq = {
            let mut meta = buf.meta.lock();
            meta.post_seq += 1;
            meta.mdh = MdHandle::INVALID;
            meta.post_seq
        };
        guard.posted.push(buf.clone());
        guard.nposted += 1;
        drop(guard);

        let rc = self.transport().post_passive(
            request_portal(service.id()),
            service.id() as u64,
            MdBuffer::single(buf.region.clone()),
            MdOp::Put,
            None,
            EventTarget(Target::Request { service: service.clone(), buffer: buf.clone() }),
        );

        let mut guard = service.inner.lock();
        match rc {
            Ok(mdh) => {
                {
                    let mut meta = buf.meta.lock();
                    if meta.post_seq == seq {
                        meta.mdh = mdh;
                    }
                }
                if guard.shutting_down {
                    // shutdown may have missed this handle
                    drop(guard);
                    self.transport().unlink(mdh);
                    guard = service.inner.lock();
                }
                (guard, Ok(()))
            }
            Err(e) => {
                error!("failed to post buffer on service {}: {}", service.id(), e);
                guard.nposted -= 1;
                if !guard.shutting_down {
                    guard.posted.retain(|posted| !Arc::ptr_eq(posted, &buf));
                }
                (guard, Err(e))
            }
        }
    }

    /// Reposts a consumed buffer unless the service is going away or pruning.
    pub(crate) fn recycle_buffer<'a>(
        &self,
        service: &'a Arc<Service>,
        mut guard: ServiceGuard<'a>,
        buf: Arc<RequestBuffer>,
    ) -> ServiceGuard<'a> {
        if guard.shutting_down {
            return guard;
        }
        if guard.nprune > 0 {
            guard.nprune -= 1;
            return guard;
        }
        let (guard, rc) = self.post_buffer(service, guard, buf);
        if let Err(e) = rc {
            warn!(
                "failed to repost buffer on service {}: {}, {} still posted",
                service.id(),
                e,
                guard.nposted
            );
        }
        guard
    }
}
