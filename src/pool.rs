//! Dynamically sized thread pool for blocking disk and hashing jobs.
//!
//! Worker threads are spun up on demand, up to the concurrency limit, and
//! a worker that sits idle for 60 seconds tears itself down. Idle workers
//! form a stack: the scheduler always wakes the most recently idle worker,
//! so a shrinking workload starves the workers at the bottom of the stack
//! into retirement while the recently active ones keep their caches warm.
//!
//! A job that panics kills only its worker; the pool spawns a replacement
//! the next time demand requires one.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::constants::WORKER_IDLE_TIMEOUT;

/// A blocking job. Jobs must be self-contained: they may not assume
/// anything about which worker runs them or in what order relative to
/// jobs of other pieces.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Workers execute the remaining queue, then exit.
    Drain,
    /// Pending jobs are discarded; workers exit after their current job.
    Discard,
}

struct JobQueue {
    jobs: VecDeque<Job>,
    stop: Option<StopMode>,
}

struct WorkerHandle {
    /// Wakes this specific worker. Waits are made against the job queue
    /// mutex.
    job_available: Condvar,
    /// Set when the worker should exit: idle timeout, shrunken
    /// concurrency, or a panicked job.
    is_dead: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Workers {
    /// One list, two conceptual regions: indices `0..=last_idle_pos` form
    /// the idle stack (top at `last_idle_pos`), everything after is
    /// active.
    list: VecDeque<Arc<WorkerHandle>>,
    /// -1 when no worker is idle.
    last_idle_pos: isize,
    /// Exited workers whose threads still need joining.
    dead: Vec<Arc<WorkerHandle>>,
}

impl Workers {
    fn active_count(&self) -> usize {
        self.list.len() - (self.last_idle_pos + 1) as usize
    }

    fn index_of(&self, handle: &Arc<WorkerHandle>) -> Option<usize> {
        self.list.iter().position(|w| Arc::ptr_eq(w, handle))
    }

    fn remove(&mut self, handle: &Arc<WorkerHandle>) {
        if let Some(index) = self.index_of(handle) {
            self.list.remove(index);
            if (index as isize) <= self.last_idle_pos {
                self.last_idle_pos -= 1;
            }
        }
    }
}

struct Shared {
    queue: Mutex<JobQueue>,
    workers: Mutex<Workers>,
}

/// Thread pool executing arbitrary blocking jobs.
pub struct WorkerPool {
    shared: Arc<Shared>,
    concurrency: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool whose concurrency is derived from the CPU count.
    pub fn new() -> Self {
        Self::with_concurrency(auto_concurrency())
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(JobQueue {
                    jobs: VecDeque::new(),
                    stop: None,
                }),
                workers: Mutex::new(Workers {
                    list: VecDeque::new(),
                    last_idle_pos: -1,
                    dead: Vec::new(),
                }),
            }),
            concurrency: AtomicUsize::new(concurrency.max(1)),
        }
    }

    /// Posts a job. An idle worker is woken if one exists (most recently
    /// idle first); otherwise a new worker is spawned if the concurrency
    /// limit allows; otherwise the job waits for the next free worker.
    pub fn post(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        if queue.stop.is_some() {
            tracing::debug!("job posted to a stopping worker pool, dropping");
            return;
        }
        queue.jobs.push_back(job);

        let mut workers = self.shared.workers.lock();
        if workers.last_idle_pos >= 0 {
            let worker = Arc::clone(&workers.list[workers.last_idle_pos as usize]);
            workers.last_idle_pos -= 1;
            drop(workers);
            drop(queue);
            worker.job_available.notify_one();
        } else if workers.active_count() < self.concurrency.load(Ordering::Relaxed) {
            self.spawn_worker(&mut workers);
        }
        // Otherwise the queue holds the job until a worker frees up.
    }

    /// Adjusts the concurrency limit. Shrinking signals the surplus
    /// workers, bottom of the idle stack first; each exits when it next
    /// returns to idle (or immediately if already waiting).
    pub fn change_concurrency(&self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        self.concurrency.store(concurrency, Ordering::Relaxed);
        let workers = self.shared.workers.lock();
        let running = workers.list.len();
        if running > concurrency {
            let doomed: Vec<_> = (0..running - concurrency)
                .map(|i| Arc::clone(&workers.list[i]))
                .collect();
            drop(workers);
            for worker in doomed {
                worker.is_dead.store(true, Ordering::Release);
                worker.job_available.notify_one();
            }
        }
    }

    /// Removes all queued jobs. Jobs already executing are unaffected.
    pub fn clear_pending_jobs(&self) {
        self.shared.queue.lock().jobs.clear();
    }

    /// Lets the workers drain the pending queue, then stops and joins all
    /// of them.
    pub fn join_all(&self) {
        self.stop(StopMode::Drain);
    }

    /// Discards pending jobs, then stops and joins all workers. Jobs in
    /// flight still run to completion; they cannot be interrupted.
    pub fn abort_all(&self) {
        self.stop(StopMode::Discard);
    }

    pub fn num_threads(&self) -> usize {
        self.shared.workers.lock().list.len()
    }

    pub fn num_idle_threads(&self) -> usize {
        (self.shared.workers.lock().last_idle_pos + 1) as usize
    }

    pub fn num_pending_jobs(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    fn stop(&self, mode: StopMode) {
        {
            let mut queue = self.shared.queue.lock();
            if mode == StopMode::Discard {
                queue.jobs.clear();
            }
            queue.stop = Some(mode);
        }
        let handles: Vec<_> = {
            let mut workers = self.shared.workers.lock();
            let mut all: Vec<_> = workers.list.iter().cloned().collect();
            all.extend(workers.dead.drain(..));
            all
        };
        for worker in &handles {
            worker.job_available.notify_one();
        }
        for worker in handles {
            let handle = worker.thread.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
        let mut workers = self.shared.workers.lock();
        workers.list.clear();
        workers.last_idle_pos = -1;
        // The pool is reusable after a stop.
        self.shared.queue.lock().stop = None;
    }

    /// Spawns a new worker. New workers enter at the bottom of the idle
    /// stack; they pull their first job straight off the queue.
    fn spawn_worker(&self, workers: &mut Workers) {
        let handle = Arc::new(WorkerHandle {
            job_available: Condvar::new(),
            is_dead: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        workers.list.push_front(Arc::clone(&handle));
        workers.last_idle_pos += 1;

        let shared = Arc::clone(&self.shared);
        let worker = Arc::clone(&handle);
        let thread = thread::Builder::new()
            .name("rdisk-worker".into())
            .spawn(move || run_worker(shared, worker))
            .expect("failed to spawn disk worker");
        *handle.thread.lock() = Some(thread);
        tracing::trace!(num_threads = workers.list.len(), "spawned disk worker");
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

/// Main loop of one worker thread.
fn run_worker(shared: Arc<Shared>, me: Arc<WorkerHandle>) {
    let mut queue = shared.queue.lock();
    loop {
        // Wait for work, dying after 60 idle seconds.
        let idle_since = Instant::now();
        while queue.jobs.is_empty() {
            if me.is_dead.load(Ordering::Acquire) || queue.stop.is_some() {
                drop(queue);
                retire(&shared, &me);
                return;
            }
            let remaining = WORKER_IDLE_TIMEOUT.saturating_sub(idle_since.elapsed());
            if remaining.is_zero() {
                me.is_dead.store(true, Ordering::Release);
                drop(queue);
                retire(&shared, &me);
                tracing::trace!("idle disk worker retired");
                return;
            }
            // The scheduler may have counted this worker as active when it
            // handed off a job that another worker then stole; make sure
            // the idle stack knows about us before sleeping again.
            move_to_idle(&shared, &me);
            me.job_available.wait_for(&mut queue, remaining);
        }

        if queue.stop == Some(StopMode::Discard) {
            drop(queue);
            retire(&shared, &me);
            return;
        }

        move_to_active(&shared, &me);

        // Before taking jobs, join any workers that died.
        drop(queue);
        reap_dead_workers(&shared);
        queue = shared.queue.lock();

        while let Some(job) = queue.jobs.pop_front() {
            drop(queue);
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            if result.is_err() {
                // The job poisoned this worker; terminate it. Replacements
                // are spawned on the next demand spike.
                tracing::warn!("disk job panicked, terminating worker");
                me.is_dead.store(true, Ordering::Release);
                retire(&shared, &me);
                return;
            }
            queue = shared.queue.lock();
            if me.is_dead.load(Ordering::Acquire) {
                drop(queue);
                retire(&shared, &me);
                return;
            }
            if queue.stop == Some(StopMode::Discard) {
                drop(queue);
                retire(&shared, &me);
                return;
            }
        }

        if queue.stop.is_some() {
            drop(queue);
            retire(&shared, &me);
            return;
        }
        // The wait loop above re-registers this worker as idle.
    }
}

/// Moves the worker out of the idle stack (it is about to execute jobs).
/// The scheduler may already have popped it when it handed off the job,
/// in which case there is nothing to do.
fn move_to_active(shared: &Arc<Shared>, me: &Arc<WorkerHandle>) {
    let mut workers = shared.workers.lock();
    if let Some(index) = workers.index_of(me) {
        if (index as isize) <= workers.last_idle_pos {
            let top = workers.last_idle_pos as usize;
            workers.list.swap(index, top);
            workers.last_idle_pos -= 1;
        }
    }
}

/// Places the worker back on top of the idle stack.
fn move_to_idle(shared: &Arc<Shared>, me: &Arc<WorkerHandle>) {
    let mut workers = shared.workers.lock();
    if let Some(index) = workers.index_of(me) {
        let new_top = (workers.last_idle_pos + 1) as usize;
        if index >= new_top {
            workers.list.swap(index, new_top);
            workers.last_idle_pos += 1;
        }
    }
}

/// Removes the worker from the pool's bookkeeping, leaving its join
/// handle for a reaper (or `join_all`).
fn retire(shared: &Arc<Shared>, me: &Arc<WorkerHandle>) {
    let mut workers = shared.workers.lock();
    workers.remove(me);
    workers.dead.push(Arc::clone(me));
}

/// Joins workers that marked themselves dead. Any worker may reap.
fn reap_dead_workers(shared: &Arc<Shared>) {
    let dead = {
        let mut workers = shared.workers.lock();
        std::mem::take(&mut workers.dead)
    };
    for worker in dead {
        let handle = worker.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn auto_concurrency() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
}
