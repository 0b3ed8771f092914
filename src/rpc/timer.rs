use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type TimerId = u64;
type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerTable {
    next_id: TimerId,
    armed: BTreeMap<(Instant, TimerId), Callback>,
    deadlines: HashMap<TimerId, Instant>,
}

/// One-shot timers fired from a dedicated thread. Callbacks run without any
/// timer lock held.
pub struct Timer {
    table: Arc<spin::Mutex<TimerTable>>,
    wake_tx: spin::Mutex<Option<Sender<()>>>,
    thread: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn start() -> std::io::Result<Self> {
        let table = Arc::new(spin::Mutex::new(TimerTable::default()));
        let (wake_tx, wake_rx) = unbounded::<()>();
        let thread_table = table.clone();
        let handle = thread::Builder::new().name("rpc_timer".into()).spawn(move || loop {
            let (expired, wait) = {
                let mut table = thread_table.lock();
                let now = Instant::now();
                let mut expired = Vec::new();
                while let Some(entry) = table.armed.first_entry() {
                    if entry.key().0 > now {
                        break;
                    }
                    let ((_, id), cb) = entry.remove_entry();
                    table.deadlines.remove(&id);
                    expired.push(cb);
                }
                let wait = table
                    .armed
                    .keys()
                    .next()
                    .map(|(deadline, _)| deadline.saturating_duration_since(now))
                    .unwrap_or(Duration::from_secs(3600));
                (expired, wait)
            };
            for cb in expired {
                cb();
            }
            match wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(Timer {
            table,
            wake_tx: spin::Mutex::new(Some(wake_tx)),
            thread: spin::Mutex::new(Some(handle)),
        })
    }

    pub fn add(&self, after: Duration, cb: impl FnOnce() + Send + 'static) -> TimerId {
        let id = {
            let mut table = self.table.lock();
            table.next_id += 1;
            let id = table.next_id;
            let deadline = Instant::now() + after;
            table.armed.insert((deadline, id), Box::new(cb));
            table.deadlines.insert(id, deadline);
            id
        };
        if let Some(tx) = self.wake_tx.lock().as_ref() {
            let _ = tx.send(());
        }
        id
    }

    /// Returns true if the timer was defused before it fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut table = self.table.lock();
        match table.deadlines.remove(&id) {
            Some(deadline) => table.armed.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.table.lock().armed.len()
    }

    pub fn stop(&self) {
        self.wake_tx.lock().take();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        let dropped = std::mem::take(&mut self.table.lock().armed).len();
        if dropped != 0 {
            debug!("timer stopped with {} armed timers", dropped);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.wake_tx.lock().take();
    }
}
