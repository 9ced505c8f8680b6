//! Bounded retrieval worker pool with per-locator deduplication.
//!
//! The service owns a registry of tasks keyed by locator. At most one task
//! exists per locator while it is pending or running; later submissions for
//! the same locator attach their completion callback to the existing task and
//! may raise its queued priority. Workers pull the highest-priority task,
//! run it through the configured [`Retriever`] and invoke every attached
//! callback exactly once with the shared result.
//!
//! Transport failures are reported to callbacks; the service never retries.

use super::queue::{PriorityQueue, QueuedTask};
use super::result::{FetchRequest, RetrievalOutcome, RetrievalResult};
use super::retriever::Retriever;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Default pending-queue length at which the service reports saturation.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Callback run on the worker task when a retrieval finishes.
pub type CompletionCallback = Box<dyn FnOnce(&RetrievalResult) + Send + 'static>;

/// Identifier of a retrieval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a retrieval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn from_outcome(outcome: &RetrievalOutcome) -> Self {
        match outcome {
            RetrievalOutcome::Fetched(_) | RetrievalOutcome::NotModified => TaskState::Succeeded,
            RetrievalOutcome::Failed(_) => TaskState::Failed,
            RetrievalOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// Shared, observable state of one task.
#[derive(Debug)]
struct SharedState(Mutex<TaskState>);

impl SharedState {
    fn get(&self) -> TaskState {
        *self.0.lock()
    }

    fn set_running(&self) {
        let mut state = self.0.lock();
        if *state == TaskState::Pending {
            *state = TaskState::Running;
        }
    }

    /// Sets a terminal state once; later calls are ignored.
    fn finish(&self, terminal: TaskState) {
        let mut state = self.0.lock();
        if !state.is_terminal() {
            *state = terminal;
        }
    }
}

/// Caller-side view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    locator: Arc<str>,
    state: Arc<SharedState>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }
}

/// Registry entry for a pending or running task.
struct TaskEntry {
    request: FetchRequest,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    callbacks: Vec<CompletionCallback>,
}

#[derive(Default)]
struct Registry {
    queue: PriorityQueue,
    tasks: HashMap<TaskId, TaskEntry>,
    by_locator: HashMap<String, TaskId>,
    running: usize,
    closed: bool,
}

impl Registry {
    /// Removes a task from every index, returning its entry.
    fn take(&mut self, id: TaskId) -> Option<TaskEntry> {
        let entry = self.tasks.remove(&id)?;
        if self.by_locator.get(&entry.request.locator) == Some(&id) {
            self.by_locator.remove(&entry.request.locator);
        }
        Some(entry)
    }
}

/// Counters exposed by [`RetrievalService::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub submitted: u64,
    pub deduplicated: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pending: usize,
    pub running: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, state: TaskState) {
        let counter = match state {
            TaskState::Succeeded => &self.succeeded,
            TaskState::Failed => &self.failed,
            TaskState::Cancelled => &self.cancelled,
            TaskState::Pending | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    config: RetrievalConfig,
    retriever: Arc<dyn Retriever>,
    registry: Mutex<Registry>,
    work_available: Notify,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    next_sequence: AtomicU64,
    busy: AtomicUsize,
    counters: Counters,
}

/// Bounded pool of retrieval workers.
///
/// Dropping the service stops its workers; pending tasks are cancelled.
pub struct RetrievalService {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RetrievalService {
    /// Starts `config.workers` worker tasks on the current tokio runtime.
    pub fn start(config: RetrievalConfig, retriever: Arc<dyn Retriever>) -> Self {
        let workers = config.workers.max(1);
        let inner = Arc::new(Inner {
            config,
            retriever,
            registry: Mutex::new(Registry::default()),
            work_available: Notify::new(),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(0),
            busy: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let handles = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(inner.clone(), worker)))
            .collect();

        info!(
            workers,
            queue_capacity = inner.config.queue_capacity,
            retriever = inner.retriever.name(),
            "Retrieval service started"
        );

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.inner.config
    }

    /// Submits a request, deduplicating by locator.
    ///
    /// If a task for the same locator is pending or running, `on_complete`
    /// is attached to it and its handle returned; a pending task's priority
    /// is raised when `priority` is higher.
    pub fn submit(
        &self,
        request: FetchRequest,
        priority: f32,
        on_complete: CompletionCallback,
    ) -> TaskHandle {
        self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.lock();

        if registry.closed {
            drop(registry);
            let result = RetrievalResult::cancelled(request.locator.clone());
            let state = Arc::new(SharedState(Mutex::new(TaskState::Cancelled)));
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            on_complete(&result);
            return TaskHandle {
                id: TaskId(0),
                locator: Arc::from(request.locator),
                state,
            };
        }

        if let Some(&id) = registry.by_locator.get(&request.locator) {
            // A cancelled running task is still finishing; start a fresh one.
            let live = registry
                .tasks
                .get(&id)
                .is_some_and(|entry| !entry.cancel.is_cancelled());
            let raised = live && registry.queue.raise(id, priority);
            if let Some(entry) = registry.tasks.get_mut(&id).filter(|_| live) {
                entry.callbacks.push(on_complete);
                self.inner
                    .counters
                    .deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                trace!(task = %id, locator = %request.locator, raised, "Joined in-flight retrieval");
                return TaskHandle {
                    id,
                    locator: Arc::from(request.locator.as_str()),
                    state: entry.state.clone(),
                };
            }
        }

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SharedState(Mutex::new(TaskState::Pending)));
        let handle = TaskHandle {
            id,
            locator: Arc::from(request.locator.as_str()),
            state: state.clone(),
        };

        registry.by_locator.insert(request.locator.clone(), id);
        registry.tasks.insert(
            id,
            TaskEntry {
                request,
                state,
                cancel: self.inner.shutdown.child_token(),
                callbacks: vec![on_complete],
            },
        );
        registry.queue.push(QueuedTask::new(id, priority, sequence));
        drop(registry);

        trace!(task = %id, locator = %handle.locator, priority, "Retrieval queued");
        self.inner.work_available.notify_one();
        handle
    }

    /// Cancels a task.
    ///
    /// A pending task leaves the queue at once and its callbacks receive a
    /// `Cancelled` result. A running task has its cancellation token tripped;
    /// the worker discards whatever the retriever produced and reports
    /// `Cancelled`. Returns `false` if the task already finished.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let mut registry = self.inner.registry.lock();
        let Some(entry) = registry.tasks.get(&handle.id) else {
            return false;
        };

        if entry.state.get() == TaskState::Running {
            entry.cancel.cancel();
            debug!(task = %handle.id, locator = %handle.locator, "Cancelling running retrieval");
            return true;
        }

        registry.queue.remove(handle.id);
        let Some(entry) = registry.take(handle.id) else {
            return false;
        };
        drop(registry);

        debug!(task = %handle.id, locator = %handle.locator, "Cancelled pending retrieval");
        complete(
            &self.inner,
            entry,
            RetrievalResult::cancelled(handle.locator.to_string()),
        );
        true
    }

    /// Whether every worker is busy and the pending queue is at capacity.
    pub fn is_saturated(&self) -> bool {
        let pending = self.inner.registry.lock().queue.len();
        self.inner.busy.load(Ordering::Acquire) >= self.inner.config.workers.max(1)
            && pending >= self.inner.config.queue_capacity
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner.registry.lock().queue.len()
    }

    pub fn stats(&self) -> ServiceStats {
        let registry = self.inner.registry.lock();
        let c = &self.inner.counters;
        ServiceStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            pending: registry.queue.len(),
            running: registry.running,
        }
    }

    /// Stops the workers and cancels every pending and running task.
    pub fn shutdown(&self) {
        let pending: Vec<TaskEntry> = {
            let mut registry = self.inner.registry.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            let mut pending = Vec::new();
            while let Some(queued) = registry.queue.pop() {
                if let Some(entry) = registry.take(queued.id) {
                    pending.push(entry);
                }
            }
            pending
        };

        // Trips every child token, which aborts running retrievals too.
        self.inner.shutdown.cancel();

        for entry in pending {
            let locator = entry.request.locator.clone();
            complete(&self.inner, entry, RetrievalResult::cancelled(locator));
        }

        // Workers observe the closed registry and exit on their own after
        // delivering any in-flight result.
        self.workers.lock().clear();
        info!("Retrieval service stopped");
    }
}

impl Drop for RetrievalService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Marks the task terminal and runs its callbacks.
fn complete(inner: &Inner, entry: TaskEntry, result: RetrievalResult) {
    let terminal = TaskState::from_outcome(&result.outcome);
    entry.state.finish(terminal);
    inner.counters.record(terminal);
    for callback in entry.callbacks {
        callback(&result);
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    trace!(worker, "Retrieval worker started");
    loop {
        let next = {
            let mut registry = inner.registry.lock();
            if registry.closed {
                break;
            }
            match registry.queue.pop() {
                Some(queued) => {
                    let job = registry.tasks.get(&queued.id).map(|entry| {
                        entry.state.set_running();
                        (queued.id, entry.request.clone(), entry.cancel.clone())
                    });
                    if job.is_some() {
                        registry.running += 1;
                        inner.busy.fetch_add(1, Ordering::AcqRel);
                    }
                    job
                }
                None => None,
            }
        };

        let Some((id, request, cancel)) = next else {
            tokio::select! {
                _ = inner.work_available.notified() => continue,
                _ = inner.shutdown.cancelled() => break,
            }
        };

        let result = if cancel.is_cancelled() {
            RetrievalResult::cancelled(request.locator.clone())
        } else {
            let result = inner.retriever.fetch(&request, &cancel).await;
            if cancel.is_cancelled() {
                RetrievalResult::cancelled(request.locator.clone())
            } else {
                result
            }
        };

        let entry = {
            let mut registry = inner.registry.lock();
            registry.running -= 1;
            registry.take(id)
        };
        inner.busy.fetch_sub(1, Ordering::AcqRel);

        if let Some(entry) = entry {
            trace!(worker, task = %id, locator = %request.locator, "Retrieval finished");
            complete(&inner, entry, result);
        }
    }
    trace!(worker, "Retrieval worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::retrieval::result::FetchedBytes;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Retriever that blocks on a semaphore so tests control completion.
    struct GatedRetriever {
        gate: Arc<Semaphore>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl GatedRetriever {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    impl Retriever for GatedRetriever {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn fetch<'a>(
            &'a self,
            request: &'a FetchRequest,
            cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, RetrievalResult> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    permit = self.gate.acquire() => { permit.unwrap().forget(); }
                    _ = cancel.cancelled() => {
                        return RetrievalResult::failed(
                            request.locator.clone(),
                            TransportError::Aborted(request.locator.clone()),
                        );
                    }
                }
                if self.fail {
                    RetrievalResult::failed(
                        request.locator.clone(),
                        TransportError::Timeout(request.locator.clone()),
                    )
                } else {
                    RetrievalResult::fetched(
                        request.locator.clone(),
                        FetchedBytes::plain(request.locator.clone().into_bytes()),
                    )
                }
            })
        }
    }

    fn channel_callback(tx: &mpsc::UnboundedSender<RetrievalResult>) -> CompletionCallback {
        let tx = tx.clone();
        Box::new(move |result| {
            let _ = tx.send(result.clone());
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<RetrievalResult>) -> RetrievalResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("channel closed")
    }

    async fn wait_for_state(handle: &TaskHandle, state: TaskState) {
        for _ in 0..500 {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("task never reached {:?}, is {:?}", state, handle.state());
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let retriever = GatedRetriever::new(false);
        let service = RetrievalService::start(RetrievalConfig::default(), retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = service.submit(FetchRequest::new("http://a/1"), 1.0, channel_callback(&tx));
        retriever.release(1);

        let result = recv(&mut rx).await;
        assert!(matches!(result.outcome, RetrievalOutcome::Fetched(_)));
        wait_for_state(&handle, TaskState::Succeeded).await;
        assert_eq!(service.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submissions_share_one_task() {
        let retriever = GatedRetriever::new(false);
        let service = RetrievalService::start(RetrievalConfig::default(), retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = (0..5)
            .map(|_| service.submit(FetchRequest::new("http://a/dup"), 1.0, channel_callback(&tx)))
            .collect();
        assert!(handles.iter().all(|h| h.id() == handles[0].id()));

        retriever.release(1);
        for _ in 0..5 {
            assert!(recv(&mut rx).await.is_success());
        }
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().deduplicated, 4);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_retried() {
        let retriever = GatedRetriever::new(true);
        let service = RetrievalService::start(RetrievalConfig::default(), retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = service.submit(FetchRequest::new("http://a/f"), 1.0, channel_callback(&tx));
        retriever.release(1);

        let result = recv(&mut rx).await;
        assert!(matches!(
            result.outcome,
            RetrievalOutcome::Failed(TransportError::Timeout(_))
        ));
        wait_for_state(&handle, TaskState::Failed).await;
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let retriever = GatedRetriever::new(false);
        let config = RetrievalConfig {
            workers: 1,
            queue_capacity: 10,
        };
        let service = RetrievalService::start(config, retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Occupy the worker, then queue behind it.
        let first = service.submit(FetchRequest::new("busy"), 0.0, channel_callback(&tx));
        wait_for_state(&first, TaskState::Running).await;
        service.submit(FetchRequest::new("low"), 1.0, channel_callback(&tx));
        service.submit(FetchRequest::new("high"), 5.0, channel_callback(&tx));
        service.submit(FetchRequest::new("mid"), 3.0, channel_callback(&tx));

        retriever.release(4);
        let order: Vec<String> = vec![
            recv(&mut rx).await.locator,
            recv(&mut rx).await.locator,
            recv(&mut rx).await.locator,
            recv(&mut rx).await.locator,
        ];
        assert_eq!(order, vec!["busy", "high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let retriever = GatedRetriever::new(false);
        let config = RetrievalConfig {
            workers: 1,
            queue_capacity: 10,
        };
        let service = RetrievalService::start(config, retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let busy = service.submit(FetchRequest::new("busy"), 0.0, channel_callback(&tx));
        wait_for_state(&busy, TaskState::Running).await;
        let pending = service.submit(FetchRequest::new("queued"), 0.0, channel_callback(&tx));

        assert!(service.cancel(&pending));
        let result = recv(&mut rx).await;
        assert_eq!(result.locator, "queued");
        assert!(matches!(result.outcome, RetrievalOutcome::Cancelled));
        assert_eq!(pending.state(), TaskState::Cancelled);
        assert_eq!(service.pending(), 0);
        assert!(!service.cancel(&pending));

        retriever.release(1);
        assert_eq!(recv(&mut rx).await.locator, "busy");
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let retriever = GatedRetriever::new(false);
        let service = RetrievalService::start(RetrievalConfig::default(), retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = service.submit(FetchRequest::new("slow"), 0.0, channel_callback(&tx));
        wait_for_state(&handle, TaskState::Running).await;
        assert!(service.cancel(&handle));

        let result = recv(&mut rx).await;
        assert!(matches!(result.outcome, RetrievalOutcome::Cancelled));
        wait_for_state(&handle, TaskState::Cancelled).await;
    }

    #[tokio::test]
    async fn test_saturation() {
        let retriever = GatedRetriever::new(false);
        let config = RetrievalConfig {
            workers: 1,
            queue_capacity: 2,
        };
        let service = RetrievalService::start(config, retriever.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let busy = service.submit(FetchRequest::new("busy"), 0.0, channel_callback(&tx));
        wait_for_state(&busy, TaskState::Running).await;
        assert!(!service.is_saturated());

        service.submit(FetchRequest::new("q1"), 0.0, channel_callback(&tx));
        assert!(!service.is_saturated());
        service.submit(FetchRequest::new("q2"), 0.0, channel_callback(&tx));
        assert!(service.is_saturated());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let retriever = GatedRetriever::new(false);
        let config = RetrievalConfig {
            workers: 1,
            queue_capacity: 10,
        };
        let service = RetrievalService::start(config, retriever.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let busy = service.submit(FetchRequest::new("busy"), 0.0, channel_callback(&tx));
        wait_for_state(&busy, TaskState::Running).await;
        service.submit(FetchRequest::new("queued"), 0.0, channel_callback(&tx));

        service.shutdown();
        let mut outcomes = vec![recv(&mut rx).await, recv(&mut rx).await];
        outcomes.sort_by(|a, b| a.locator.cmp(&b.locator));
        assert!(outcomes
            .iter()
            .all(|r| matches!(r.outcome, RetrievalOutcome::Cancelled)));

        // Submissions after shutdown complete immediately as cancelled.
        let late = service.submit(FetchRequest::new("late"), 0.0, channel_callback(&tx));
        assert_eq!(late.state(), TaskState::Cancelled);
        assert!(matches!(recv(&mut rx).await.outcome, RetrievalOutcome::Cancelled));
    }
}
