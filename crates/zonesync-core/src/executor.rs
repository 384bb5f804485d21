//! Bounded background task pool
//!
//! A fixed set of worker threads drains one bounded FIFO. Submission is
//! best effort: writes are refused when the queue is nearly full, and a read
//! that finds the queue full evicts a few queued writes and tries once more.
//! Reads therefore never starve behind a backlog of writes.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_WORKERS: usize = 2;
/// Writes are refused once fewer than this many slots remain
pub const NEAR_FULL_MARGIN: usize = 5;
/// Writes evicted by a read that finds the queue full
pub const EVICTION_BATCH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// Must not starve; may evict writes
    Read,
    /// Best effort; dropped under pressure
    Write,
}

/// What happened to a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    QueuedAfterEviction { evicted: usize },
    DroppedNearFull,
    DroppedFull,
    Closed,
}

impl Admission {
    pub fn is_queued(self) -> bool {
        matches!(self, Admission::Queued | Admission::QueuedAfterEviction { .. })
    }
}

/// Bounded FIFO with priority-aware admission
#[derive(Debug)]
pub struct TaskQueue<T> {
    items: VecDeque<(TaskPriority, T)>,
    capacity: usize,
    margin: usize,
    eviction_batch: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_limits(capacity, NEAR_FULL_MARGIN, EVICTION_BATCH)
    }

    pub fn with_limits(capacity: usize, margin: usize, eviction_batch: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            margin,
            eviction_batch,
        }
    }

    /// Admit or drop `item`; dropped and evicted items are dropped here
    pub fn offer(&mut self, priority: TaskPriority, item: T) -> Admission {
        match priority {
            TaskPriority::Write => {
                if self.items.len() >= self.capacity.saturating_sub(self.margin) {
                    return Admission::DroppedNearFull;
                }
                match self.try_push(priority, item) {
                    Ok(()) => Admission::Queued,
                    Err(_) => Admission::DroppedFull,
                }
            }
            TaskPriority::Read => {
                let item = match self.try_push(priority, item) {
                    Ok(()) => return Admission::Queued,
                    Err(item) => item,
                };
                let evicted = self.evict_writes();
                match self.try_push(priority, item) {
                    Ok(()) => Admission::QueuedAfterEviction { evicted },
                    Err(_) => Admission::DroppedFull,
                }
            }
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything queued; returns how many items were abandoned
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    fn try_push(&mut self, priority: TaskPriority, item: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back((priority, item));
        Ok(())
    }

    /// Remove up to one batch of writes, oldest first
    fn evict_writes(&mut self) -> usize {
        let batch = self.eviction_batch;
        let mut evicted = 0;
        self.items.retain(|(priority, _)| {
            if *priority == TaskPriority::Write && evicted < batch {
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }
}

/// Result of a queued task
///
/// Resolves to `None` when the task was evicted, abandoned at shutdown or
/// panicked.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block the current thread until the task finishes
    ///
    /// Must not be called from inside an async runtime; use [`join`](Self::join).
    pub fn wait(self) -> Option<T> {
        self.rx.blocking_recv().ok()
    }

    pub async fn join(self) -> Option<T> {
        self.rx.await.ok()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: TaskQueue<Job>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Worker pool draining a [`TaskQueue`]
pub struct TaskExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("queued", &self.queued())
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: TaskQueue::new(capacity),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let handles = (0..workers.max(1))
            .filter_map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("zonesync-task-{index}"))
                    .spawn(move || worker_loop(&shared))
                    .map_err(|e| error!("Failed to spawn task worker {}: {}", index, e))
                    .ok()
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_CAPACITY)
    }

    /// Queue a task; returns the admission outcome when it was not queued
    pub fn try_submit<F, T>(&self, priority: TaskPriority, task: F) -> Result<TaskHandle<T>, Admission>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });

        let admission = {
            let mut state = self.shared.lock();
            if state.closed {
                Admission::Closed
            } else {
                state.queue.offer(priority, job)
            }
        };

        match admission {
            Admission::Queued => {}
            Admission::QueuedAfterEviction { evicted } => {
                warn!("Task queue full; evicted {} queued writes", evicted);
            }
            dropped => {
                debug!("Dropped {:?} task: {:?}", priority, dropped);
                return Err(dropped);
            }
        }
        self.shared.available.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Queue a task; `None` when it was dropped
    pub fn submit<F, T>(&self, priority: TaskPriority, task: F) -> Option<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.try_submit(priority, task).ok()
    }

    /// Tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Refuse new tasks, abandon queued ones and wait for running ones
    pub fn shutdown(&self) {
        let abandoned = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear()
        };
        self.shared.available.notify_all();
        if abandoned > 0 {
            debug!("Abandoned {} queued tasks at shutdown", abandoned);
        }

        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.closed {
                    return;
                }
                if let Some(job) = state.queue.pop() {
                    break job;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Background task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_write_dropped_when_nearly_full() {
        let mut queue = TaskQueue::new(50);
        for i in 0..48 {
            assert!(queue.offer(TaskPriority::Read, i).is_queued());
        }
        assert_eq!(queue.offer(TaskPriority::Write, 48), Admission::DroppedNearFull);
        assert_eq!(queue.len(), 48);
        assert_eq!(queue.offer(TaskPriority::Read, 48), Admission::Queued);
    }

    #[test]
    fn test_read_evicts_oldest_writes() {
        let mut queue = TaskQueue::with_limits(10, 0, 5);
        for i in 0..4 {
            queue.offer(TaskPriority::Read, i);
        }
        for i in 4..10 {
            queue.offer(TaskPriority::Write, i);
        }
        assert_eq!(queue.len(), 10);

        assert_eq!(
            queue.offer(TaskPriority::Read, 10),
            Admission::QueuedAfterEviction { evicted: 5 }
        );
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 9, 10]);
    }

    #[test]
    fn test_read_dropped_when_no_writes_to_evict() {
        let mut queue = TaskQueue::new(6);
        for i in 0..6 {
            queue.offer(TaskPriority::Read, i);
        }
        assert_eq!(queue.offer(TaskPriority::Read, 6), Admission::DroppedFull);
        assert_eq!(queue.offer(TaskPriority::Write, 6), Admission::DroppedNearFull);
    }

    #[test]
    fn test_runs_tasks_and_returns_results() {
        let executor = TaskExecutor::new(2, 10);
        let handles: Vec<_> = (0..4)
            .map(|i| executor.submit(TaskPriority::Write, move || i * 2).unwrap())
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_backpressure_with_busy_worker() {
        let executor = TaskExecutor::new(1, 10);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = executor
            .submit(TaskPriority::Read, move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let writes: Vec<_> = (0..5)
            .map(|i| executor.submit(TaskPriority::Write, move || i).unwrap())
            .collect();
        assert_eq!(
            executor.try_submit(TaskPriority::Write, || 99).unwrap_err(),
            Admission::DroppedNearFull
        );

        let reads: Vec<_> = (0..6)
            .map(|i| executor.submit(TaskPriority::Read, move || 100 + i).unwrap())
            .collect();
        assert_eq!(executor.queued(), 6);

        release_tx.send(()).unwrap();
        blocker.wait().unwrap();
        for write in writes {
            assert_eq!(write.wait(), None);
        }
        let results: Vec<_> = reads.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![100, 101, 102, 103, 104, 105]);
    }

    #[test]
    fn test_shutdown_refuses_new_tasks() {
        let executor = TaskExecutor::new(1, 10);
        executor.shutdown();
        assert!(executor.is_closed());
        assert_eq!(
            executor.try_submit(TaskPriority::Read, || 1).unwrap_err(),
            Admission::Closed
        );
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let executor = TaskExecutor::new(1, 10);
        let failed = executor
            .submit(TaskPriority::Write, || -> i32 { panic!("boom") })
            .unwrap();
        assert_eq!(failed.wait(), None);
        let ok = executor.submit(TaskPriority::Write, || 7).unwrap();
        assert_eq!(ok.wait(), Some(7));
    }
}
