//! Run-to-completion work items on two lanes of worker threads.
//!
//! A work item is executed by at most one thread at a time. Scheduling an
//! item that is running defers a re-run until the current run returns.
//! Killing an item drops every queued run of it. Resetting a killed item
//! starts a new generation, so stale queue entries are skipped.
use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Concurrent,
    /// Items on this lane never run in parallel with each other.
    Serial,
}

pub(crate) trait Runnable: Send + Sync {
    fn workitem(&self) -> &WorkItem;

    /// Runs one step. Returns true once the item is finished, after which it
    /// must already be killed.
    fn run(self: Arc<Self>) -> bool;
}

#[derive(Debug, Default)]
struct WorkItemState {
    generation: u64,
    scheduled: bool,
    running: bool,
    killed: bool,
}

#[derive(Debug)]
pub(crate) struct WorkItem {
    lane: Lane,
    state: spin::Mutex<WorkItemState>,
}

type Job = (Arc<dyn Runnable>, u64);

impl WorkItem {
    pub(crate) fn new(lane: Lane) -> Self {
        WorkItem { lane, state: spin::Mutex::new(WorkItemState::default()) }
    }

    pub(crate) fn kill(&self) {
        let mut state = self.state.lock();
        state.killed = true;
        state.scheduled = false;
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    /// Revives a killed item for a new incarnation.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.killed = false;
        state.scheduled = false;
    }
}

pub struct Scheduler {
    concurrent_tx: Sender<Job>,
    serial_tx: Sender<Job>,
    stop_tx: spin::Mutex<Option<Sender<()>>>,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(workers: usize) -> std::io::Result<Self> {
        let (concurrent_tx, concurrent_rx) = unbounded::<Job>();
        let (serial_tx, serial_rx) = unbounded::<Job>();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let scheduler = Scheduler {
            concurrent_tx: concurrent_tx.clone(),
            serial_tx: serial_tx.clone(),
            stop_tx: spin::Mutex::new(Some(stop_tx)),
            threads: spin::Mutex::new(Vec::new()),
        };

        let mut lanes = vec![("swi_serial".to_string(), serial_tx, serial_rx)];
        for i in 0..workers.max(1) {
            lanes.push((format!("swi_worker_{}", i), concurrent_tx.clone(), concurrent_rx.clone()));
        }
        for (name, requeue, jobs) in lanes {
            let stop = stop_rx.clone();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(jobs, requeue, stop));
            match handle {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(e) => {
                    scheduler.stop();
                    return Err(e);
                }
            }
        }
        debug!("work item scheduler started with {} concurrent workers", workers.max(1));
        Ok(scheduler)
    }

    pub(crate) fn schedule(&self, item: Arc<dyn Runnable>) {
        let generation = {
            let mut state = item.workitem().state.lock();
            if state.killed || state.scheduled {
                return;
            }
            state.scheduled = true;
            if state.running {
                // the running worker re-queues it
                return;
            }
            state.generation
        };
        let lane = item.workitem().lane;
        let tx = match lane {
            Lane::Concurrent => &self.concurrent_tx,
            Lane::Serial => &self.serial_tx,
        };
        if tx.send((item, generation)).is_err() {
            warn!("work item scheduled after scheduler shutdown");
        }
    }

    /// Stops every worker and waits for them. Queued items are dropped.
    pub fn stop(&self) {
        self.stop_tx.lock().take();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!("work item worker panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // detach rather than join: the last owner may be a worker itself
        self.stop_tx.lock().take();
    }
}

fn worker_loop(jobs: Receiver<Job>, requeue: Sender<Job>, stop: Receiver<()>) {
    loop {
        select! {
            recv(jobs) -> job => {
                let Ok((item, generation)) = job else { break };
                run_one(item, generation, &requeue);
            }
            recv(stop) -> _ => break,
        }
    }
}

fn run_one(item: Arc<dyn Runnable>, generation: u64, requeue: &Sender<Job>) {
    {
        let mut state = item.workitem().state.lock();
        if state.killed || state.generation != generation || !state.scheduled {
            return;
        }
        debug_assert!(!state.running);
        state.scheduled = false;
        state.running = true;
    }

    let finished = item.clone().run();

    let again = {
        let mut state = item.workitem().state.lock();
        state.running = false;
        debug_assert!(!finished || state.killed || state.generation != generation);
        if state.scheduled && !state.killed {
            Some(state.generation)
        } else {
            None
        }
    };
    if let Some(generation) = again {
        let _ = requeue.send((item, generation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct Counter {
        wi: WorkItem,
        runs: AtomicUsize,
        active: AtomicUsize,
        overlap: AtomicUsize,
        finish_after: usize,
        sched: Arc<Scheduler>,
    }

    impl Runnable for Counter {
        fn workitem(&self) -> &WorkItem {
            &self.wi
        }

        fn run(self: Arc<Self>) -> bool {
            if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlap.fetch_add(1, Ordering::SeqCst);
            }
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            // a schedule while running must not start a second runner
            self.sched.schedule(self.clone());
            thread::sleep(Duration::from_millis(1));
            self.active.fetch_sub(1, Ordering::SeqCst);
            if n >= self.finish_after {
                self.wi.kill();
                return true;
            }
            false
        }
    }

    fn counter(sched: &Arc<Scheduler>, lane: Lane, finish_after: usize) -> Arc<Counter> {
        Arc::new(Counter {
            wi: WorkItem::new(lane),
            runs: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            overlap: AtomicUsize::new(0),
            finish_after,
            sched: sched.clone(),
        })
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn reschedule_while_running_reruns_without_overlap() {
        let sched = Arc::new(Scheduler::start(4).unwrap());
        let item = counter(&sched, Lane::Concurrent, 5);
        for _ in 0..8 {
            sched.schedule(item.clone());
        }
        wait_until(|| item.wi.is_killed());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(item.runs.load(Ordering::SeqCst), 5);
        assert_eq!(item.overlap.load(Ordering::SeqCst), 0);
        sched.stop();
    }

    #[test]
    fn killed_item_never_runs() {
        let sched = Arc::new(Scheduler::start(1).unwrap());
        let item = counter(&sched, Lane::Serial, 1);
        item.wi.kill();
        sched.schedule(item.clone());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(item.runs.load(Ordering::SeqCst), 0);

        item.wi.reset();
        sched.schedule(item.clone());
        wait_until(|| item.runs.load(Ordering::SeqCst) == 1);
        sched.stop();
    }
}
