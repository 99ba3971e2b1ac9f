//! Timed jobs run by the scheduler, and the worker pool for heavy ones.
//!
//! Inline jobs run on the scheduler task itself and must be short. Pooled
//! jobs are handed to [`WorkerPool`], which runs them on tokio's blocking
//! threads with bounded concurrency. A panicking job is caught and logged
//! either way; it never takes the scheduler down.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::Semaphore;
use tokio::time::Instant;

pub type JobFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Runs on the scheduler loop.
    Inline,
    /// Runs on the worker pool.
    Pooled,
}

pub struct TimedJob {
    pub name: String,
    pub kind: JobKind,
    pub run: JobFn,
}

impl TimedJob {
    pub fn new(name: impl Into<String>, kind: JobKind, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            kind,
            run: Box::new(run),
        }
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    job: TimedJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Deadline-ordered jobs; ties run in insertion order.
#[derive(Default)]
pub struct JobQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn schedule(&mut self, at: Instant, job: TimedJob) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { at, seq, job }));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Remove and return every job due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimedJob> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(e)| e.at <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.job);
            }
        }
        due
    }
}

/// Run `job` here, containing any panic. Returns false if it panicked.
pub fn run_inline(name: &str, job: JobFn) -> bool {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(job = name, "inline job panicked");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    completed: Arc<AtomicU64>,
    panicked: Arc<AtomicU64>,
}

impl WorkerPool {
    /// A pool running at most `workers` jobs at a time.
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            completed: Arc::new(AtomicU64::new(0)),
            panicked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `job` for execution. Must be called from within a tokio runtime.
    pub fn execute(&self, job: JobFn, name: impl Into<String>) {
        let name = name.into();
        let permits = Arc::clone(&self.permits);
        let completed = Arc::clone(&self.completed);
        let panicked = Arc::clone(&self.panicked);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(job = %name, "worker pool closed, dropping job");
                return;
            };
            let result = tokio::task::spawn_blocking(move || {
                catch_unwind(AssertUnwindSafe(job)).is_ok()
            })
            .await;
            match result {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    tracing::error!(job = %name, "pooled job panicked");
                    panicked.fetch_add(1, AtomicOrdering::Relaxed);
                }
            }
            completed.fetch_add(1, AtomicOrdering::Relaxed);
        });
    }

    /// Jobs finished so far, panicked ones included.
    pub fn completed(&self) -> u64 {
        self.completed.load(AtomicOrdering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(AtomicOrdering::Relaxed)
    }

    /// Refuse new work; queued jobs that have not started are dropped.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[test]
    fn due_jobs_come_out_in_deadline_order() {
        let now = Instant::now();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = JobQueue::new();
        for (name, secs) in [("c", 3), ("a", 1), ("b", 2), ("a2", 1)] {
            let log = Arc::clone(&log);
            queue.schedule(
                now + Duration::from_secs(secs),
                TimedJob::new(name, JobKind::Inline, move || log.lock().unwrap().push(name)),
            );
        }
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));

        for job in queue.take_due(now + Duration::from_secs(2)) {
            assert!(run_inline(&job.name, job.run));
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "a2", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn inline_panic_is_contained() {
        assert!(!run_inline("boom", Box::new(|| panic!("job failure"))));
    }

    #[tokio::test]
    async fn pool_runs_jobs_and_survives_panics() {
        let pool = WorkerPool::new(2);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap()), format!("job-{i}"));
        }
        pool.execute(Box::new(|| panic!("pooled failure")), "bad");

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        while pool.completed() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.panicked(), 1);
    }
}
