use crate::rpc::client::ClientRpc;
use crate::rpc::workitem::Scheduler;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Credit-limited dispatch queue. Control entries always leave before normal
/// ones, each queue is FIFO, and nothing leaves without taking a credit.
#[derive(Debug)]
pub(crate) struct CreditQueue<T> {
    credits: usize,
    control: VecDeque<T>,
    normal: VecDeque<T>,
}

impl<T> CreditQueue<T> {
    pub(crate) fn new(credits: usize) -> Self {
        CreditQueue { credits, control: VecDeque::new(), normal: VecDeque::new() }
    }

    pub(crate) fn push(&mut self, item: T, control: bool) {
        if control {
            self.control.push_back(item);
        } else {
            self.normal.push_back(item);
        }
    }

    /// Returns `returned` credits, then dispatches as many entries as the
    /// credits allow.
    pub(crate) fn release(&mut self, returned: usize) -> Vec<T> {
        self.credits += returned;
        let mut ready = Vec::new();
        while self.credits > 0 {
            let Some(item) = self.control.pop_front().or_else(|| self.normal.pop_front()) else {
                break;
            };
            self.credits -= 1;
            ready.push(item);
        }
        ready
    }

    /// Takes an entry back out without spending a credit.
    pub(crate) fn remove(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        for queue in [&mut self.control, &mut self.normal] {
            if let Some(pos) = queue.iter().position(&pred) {
                return queue.remove(pos);
            }
        }
        None
    }

    pub(crate) fn credits(&self) -> usize {
        self.credits
    }

    pub(crate) fn queued(&self) -> (usize, usize) {
        (self.control.len(), self.normal.len())
    }
}

/// Remote node an RPC client talks to. Peers are created on first use and
/// live until engine shutdown.
pub struct Peer {
    nid: u64,
    queue: spin::Mutex<CreditQueue<Arc<ClientRpc>>>,
}

impl Peer {
    pub(crate) fn new(nid: u64, credits: usize) -> Self {
        Peer { nid, queue: spin::Mutex::new(CreditQueue::new(credits)) }
    }

    pub fn nid(&self) -> u64 {
        self.nid
    }

    /// The queue keeps the RPC alive until it is dispatched or aborted.
    pub(crate) fn enqueue(&self, rpc: Arc<ClientRpc>, control: bool) {
        self.queue.lock().push(rpc, control);
    }

    pub(crate) fn dequeue(&self, rpc: &Arc<ClientRpc>) -> bool {
        self.queue.lock().remove(|queued| Arc::ptr_eq(queued, rpc)).is_some()
    }

    pub(crate) fn check_sends(&self, returned: usize, scheduler: &Scheduler) {
        let mut queue = self.queue.lock();
        for rpc in queue.release(returned) {
            debug!("dispatching rpc to peer {}: service {}", self.nid, rpc.service());
            scheduler.schedule(rpc);
        }
    }

    /// (credits, control queued, normal queued)
    pub fn stats(&self) -> (usize, usize, usize) {
        let queue = self.queue.lock();
        let (control, normal) = queue.queued();
        (queue.credits(), control, normal)
    }
}
