//! Cluster-aware executor.
//!
//! A fixed pool of tokio workers draining one unbounded queue. Before running
//! a task a worker takes the named lock of the task's cluster, so two tasks
//! for the same cluster never overlap no matter where they were submitted
//! from. A task whose cluster is busy is parked instead of holding a worker:
//! the worker finishing the running task hands the lock straight to the next
//! parked one. The lock is released on every exit path, panics included.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, error};

use crate::controller::named_locks::{NamedLockGuard, NamedLocks};
use crate::crd::ClusterKey;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 4;

type Task = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Job {
    key: ClusterKey,
    task: Task,
    done: oneshot::Sender<TaskOutcome>,
}

/// Jobs waiting for their cluster's lock, in submission order.
type Parked = Arc<Mutex<HashMap<ClusterKey, VecDeque<Job>>>>;

/// How a submitted task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The task panicked; the worker survived.
    Panicked,
    /// The executor shut down before the task ran.
    Abandoned,
}

/// Completion handle returned by [`ClusterAwareExecutor::submit`].
pub struct TaskHandle {
    done: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn wait(self) -> TaskOutcome {
        self.done.await.unwrap_or(TaskOutcome::Abandoned)
    }
}

/// Runs tasks on `W` workers, serialized per cluster key.
pub struct ClusterAwareExecutor {
    queue: mpsc::UnboundedSender<Job>,
    locks: NamedLocks,
    parked: Parked,
    workers: usize,
}

impl ClusterAwareExecutor {
    /// Spawn `workers` workers on the current runtime.
    pub fn new(workers: usize, locks: NamedLocks) -> Self {
        let workers = workers.max(1);
        let (queue, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let parked = Parked::default();

        for id in 0..workers {
            tokio::spawn(worker_loop(
                id,
                receiver.clone(),
                locks.clone(),
                parked.clone(),
            ));
        }

        Self {
            queue,
            locks,
            parked,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.locks
    }

    /// Number of tasks waiting for a busy cluster.
    pub fn parked(&self) -> usize {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    /// Queue `task` for `key`. Never blocks.
    pub fn submit<F, Fut>(&self, key: ClusterKey, task: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done, receiver) = oneshot::channel();
        let job = Job {
            key,
            task: Box::new(move || task().boxed()),
            done,
        };
        if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            debug!(cluster = %job.key, "Executor stopped, task abandoned");
        }
        TaskHandle { done: receiver }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>,
    locks: NamedLocks,
    parked: Parked,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker = id, "Executor queue closed, worker exiting");
            return;
        };

        let Some((mut job, mut guard)) = claim(&locks, &parked, job) else {
            continue;
        };
        loop {
            let outcome = run(id, &job.key, job.task).await;
            // The submitter may have dropped its handle
            let _ = job.done.send(outcome);

            match hand_off(&parked, &job.key, guard) {
                Some((next, held)) => {
                    job = next;
                    guard = held;
                }
                None => break,
            }
        }
    }
}

/// Take the cluster lock for `job`, or park the job behind the running one.
fn claim(locks: &NamedLocks, parked: &Parked, job: Job) -> Option<(Job, NamedLockGuard)> {
    // Parking and hand-off both happen under this mutex, so a job is never
    // parked after the holder looked for waiters.
    let mut waiting = parked.lock().unwrap_or_else(PoisonError::into_inner);
    match locks.try_acquire(&job.key.to_string()) {
        Some(guard) => Some((job, guard)),
        None => {
            debug!(cluster = %job.key, "Cluster busy, parking task");
            waiting.entry(job.key.clone()).or_default().push_back(job);
            None
        }
    }
}

/// Pass the held lock to the next parked job of `key`, or release it.
fn hand_off(parked: &Parked, key: &ClusterKey, guard: NamedLockGuard) -> Option<(Job, NamedLockGuard)> {
    let mut waiting = parked.lock().unwrap_or_else(PoisonError::into_inner);
    let next = waiting.get_mut(key).and_then(VecDeque::pop_front);
    if waiting.get(key).is_some_and(VecDeque::is_empty) {
        waiting.remove(key);
    }
    match next {
        Some(job) => Some((job, guard)),
        None => {
            guard.release();
            None
        }
    }
}

async fn run(id: usize, key: &ClusterKey, task: Task) -> TaskOutcome {
    match AssertUnwindSafe(async move { task().await })
        .catch_unwind()
        .await
    {
        Ok(()) => TaskOutcome::Completed,
        Err(_) => {
            error!(worker = id, cluster = %key, "Task panicked");
            TaskOutcome::Panicked
        }
    }
}
