//! Thread-safe task manager: a priority queue drained by a fixed pool of
//! worker threads, with per-state task maps and running counters.
//!
//! Lock order is `state` before `stats` whenever both are held.

mod model;
mod queue;

pub use model::{
    NewTask, PROGRESS_FAILED, Task, TaskContext, TaskFn, TaskMetadata, TaskPriority,
    TaskSnapshot, TaskStatistics, TaskStatus,
};

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult, TaskError};
use queue::PendingQueue;

/// How long an idle worker blocks before re-checking the stop flag
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll step used while waiting for the queue to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called on the worker thread after a task lands in DONE or FAILED
pub type CompletionHook = Arc<dyn Fn(&Task) + Send + Sync>;

#[derive(Default)]
struct TaskState {
    pending: PendingQueue,
    in_progress: HashMap<String, Task>,
    done: HashMap<String, Task>,
    failed: HashMap<String, Task>,
    /// work_id -> id of the most recent task for that upload
    by_work_id: HashMap<String, String>,
}

impl TaskState {
    fn find(&self, task_id: &str) -> Option<&Task> {
        self.in_progress
            .get(task_id)
            .or_else(|| self.done.get(task_id))
            .or_else(|| self.failed.get(task_id))
            .or_else(|| self.pending.get(task_id))
    }

    fn forget_work_ids<'a>(&mut self, removed: impl Iterator<Item = &'a Task>) {
        for task in removed {
            if let Some(work_id) = &task.work_id
                && self.by_work_id.get(work_id) == Some(&task.id)
            {
                self.by_work_id.remove(work_id);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    total_added: u64,
    total_completed: u64,
    total_failed: u64,
}

struct Shared {
    state: Mutex<TaskState>,
    task_available: Condvar,
    stats: Mutex<Counters>,
    /// Set once shutdown begins; new submissions are rejected
    closed: AtomicBool,
    /// Set once workers should exit their loops
    stop: AtomicBool,
    next_sequence: AtomicU64,
    active_workers: AtomicUsize,
    on_finished: Option<CompletionHook>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Priority task queue with a fixed worker pool
pub struct TaskManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
}

impl TaskManager {
    /// Start a manager with `max_workers` worker threads
    pub fn new(max_workers: usize) -> ServiceResult<Self> {
        Self::start(max_workers, None)
    }

    /// Start a manager that invokes `hook` after every finished task
    pub fn with_completion_hook(max_workers: usize, hook: CompletionHook) -> ServiceResult<Self> {
        Self::start(max_workers, Some(hook))
    }

    fn start(max_workers: usize, on_finished: Option<CompletionHook>) -> ServiceResult<Self> {
        let max_workers = if max_workers == 0 {
            warn!("max_workers of 0 requested, starting a single worker");
            1
        } else {
            max_workers
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(TaskState::default()),
            task_available: Condvar::new(),
            stats: Mutex::new(Counters::default()),
            closed: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            on_finished,
        });

        let manager = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(max_workers)),
            max_workers,
        };

        for index in 1..=max_workers {
            let worker_id = format!("task-worker-{}", index);
            let shared = manager.shared.clone();
            let id = worker_id.clone();
            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker_loop(shared, id))
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to spawn {}: {}", worker_id, e),
                })?;
            lock(&manager.workers).push(handle);
        }

        info!(workers = max_workers, "Task manager started");
        Ok(manager)
    }

    /// Enqueue a task and return its id
    pub fn add_task(&self, new_task: NewTask, job: TaskFn) -> ServiceResult<String> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::ShutDown);
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let task = Task::from_new(task_id.clone(), new_task);
        let priority = task.priority;

        {
            let mut state = lock(&self.shared.state);

            if let Some(work_id) = &task.work_id {
                if let Some(existing) = state
                    .by_work_id
                    .get(work_id)
                    .and_then(|id| state.find(id))
                    && !existing.status.is_terminal()
                {
                    return Err(ServiceError::InvalidRequest {
                        message: format!("Upload {} already has an active task", work_id),
                    });
                }
                state.by_work_id.insert(work_id.clone(), task_id.clone());
            }

            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
            state.pending.push(task, job, sequence);
        }
        self.shared.task_available.notify_one();

        lock(&self.shared.stats).total_added += 1;

        debug!(task_id = %task_id, priority = priority.as_str(), "Task queued");
        Ok(task_id)
    }

    /// Look up a task in any state
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        lock(&self.shared.state).find(task_id).cloned()
    }

    /// Look up the most recent task for an upload
    pub fn get_task_by_work_id(&self, work_id: &str) -> Option<Task> {
        let state = lock(&self.shared.state);
        state
            .by_work_id
            .get(work_id)
            .and_then(|task_id| state.find(task_id))
            .cloned()
    }

    /// Record progress for an in-progress task. Returns whether anything changed.
    pub fn update_task_progress(&self, task_id: &str, percentage: i32) -> bool {
        let mut state = lock(&self.shared.state);
        match state.in_progress.get_mut(task_id) {
            Some(task) => task.apply_progress(percentage),
            None => false,
        }
    }

    /// Merge metadata into an in-progress task. Returns whether the task was found.
    pub fn update_task_metadata(&self, task_id: &str, update: TaskMetadata) -> bool {
        let mut state = lock(&self.shared.state);
        match state.in_progress.get_mut(task_id) {
            Some(task) => {
                task.metadata.merge(update);
                true
            }
            None => false,
        }
    }

    /// Pending tasks in dequeue order
    pub fn get_pending_tasks(&self) -> Vec<Task> {
        lock(&self.shared.state).pending.tasks_in_order()
    }

    pub fn get_in_progress_tasks(&self) -> Vec<Task> {
        in_progress_in_order(&lock(&self.shared.state))
    }

    pub fn get_done_tasks(&self) -> Vec<Task> {
        finished_in_order(&lock(&self.shared.state).done)
    }

    pub fn get_failed_tasks(&self) -> Vec<Task> {
        finished_in_order(&lock(&self.shared.state).failed)
    }

    /// All tasks and counters as of one instant
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = lock(&self.shared.state);
        TaskSnapshot {
            pending: state.pending.tasks_in_order(),
            in_progress: in_progress_in_order(&state),
            done: finished_in_order(&state.done),
            failed: finished_in_order(&state.failed),
            statistics: self.statistics(&state),
        }
    }

    /// File paths referenced by pending or in-progress tasks, from one snapshot
    pub fn active_file_paths(&self) -> HashSet<PathBuf> {
        let state = lock(&self.shared.state);
        state
            .pending
            .tasks()
            .chain(state.in_progress.values())
            .filter_map(|task| task.file_path.clone())
            .collect()
    }

    pub fn get_statistics(&self) -> TaskStatistics {
        self.statistics(&lock(&self.shared.state))
    }

    fn statistics(&self, state: &TaskState) -> TaskStatistics {
        let stats = lock(&self.shared.stats);
        TaskStatistics {
            pending: state.pending.len(),
            in_progress: state.in_progress.len(),
            done: state.done.len(),
            failed: state.failed.len(),
            total_added: stats.total_added,
            total_completed: stats.total_completed,
            total_failed: stats.total_failed,
            workers: self.max_workers,
            active_workers: self.shared.active_workers.load(Ordering::SeqCst),
        }
    }

    /// Block until nothing is pending or in progress. Returns false on timeout.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let state = lock(&self.shared.state);
                if state.pending.is_empty() && state.in_progress.is_empty() {
                    return true;
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Drop all finished tasks from memory
    pub fn clear_completed_tasks(&self) {
        let mut state = lock(&self.shared.state);
        let done = std::mem::take(&mut state.done);
        let failed = std::mem::take(&mut state.failed);
        state.forget_work_ids(done.values().chain(failed.values()));
        debug!(cleared = done.len() + failed.len(), "Cleared finished tasks");
    }

    /// Drop finished tasks that completed before `cutoff`. Returns how many were removed.
    pub fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = lock(&self.shared.state);
        let state = &mut *guard;
        let mut removed = Vec::new();
        for map in [&mut state.done, &mut state.failed] {
            let expired: Vec<String> = map
                .values()
                .filter(|t| t.completed_at.is_some_and(|c| c < cutoff))
                .map(|t| t.id.clone())
                .collect();
            removed.extend(expired.iter().filter_map(|id| map.remove(id)));
        }
        state.forget_work_ids(removed.iter());
        removed.len()
    }

    /// Stop the worker pool.
    ///
    /// With `wait`, first blocks until the queue drains (bounded by `timeout`).
    /// Workers finish the task they hold; joins are bounded by the same
    /// deadline and stragglers are left detached. Returns true when every
    /// worker was joined.
    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.shared.closed.store(true, Ordering::SeqCst);

        if wait && !self.wait_for_completion(timeout) {
            warn!("Timed out waiting for queued tasks before shutdown");
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.task_available.notify_all();

        let handles = std::mem::take(&mut *lock(&self.workers));
        let mut all_joined = true;
        for handle in handles {
            while !handle.is_finished() && deadline.is_none_or(|d| Instant::now() < d) {
                thread::sleep(DRAIN_POLL_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Task worker exited with a panic");
                }
            } else {
                all_joined = false;
            }
        }

        if all_joined {
            info!("Task manager shut down");
        } else {
            warn!("Task manager shut down with workers still running");
        }
        all_joined
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.task_available.notify_all();
    }
}

/// Decrements the active worker count when a worker exits, including by panic
struct ActiveWorker<'a>(&'a AtomicUsize);

impl<'a> ActiveWorker<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveWorker<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn in_progress_in_order(state: &TaskState) -> Vec<Task> {
    let mut tasks: Vec<Task> = state.in_progress.values().cloned().collect();
    tasks.sort_by_key(|t| t.started_at);
    tasks
}

fn finished_in_order(tasks: &HashMap<String, Task>) -> Vec<Task> {
    let mut tasks: Vec<Task> = tasks.values().cloned().collect();
    tasks.sort_by_key(|t| t.completed_at);
    tasks
}

fn worker_loop(shared: Arc<Shared>, worker_id: String) {
    let _active = ActiveWorker::enter(&shared.active_workers);
    debug!(worker_id = %worker_id, "Task worker started");

    while !shared.stop.load(Ordering::SeqCst) {
        let Some((context, job)) = shared.claim_next(&worker_id) else {
            continue;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&context)));
        let outcome = outcome.unwrap_or_else(|payload| {
            Err(TaskError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        });

        if let Some(task) = shared.finish(&context, outcome)
            && let Some(hook) = &shared.on_finished
            && panic::catch_unwind(AssertUnwindSafe(|| hook(&task))).is_err()
        {
            error!(task_id = %task.id, worker_id = %worker_id, "Task completion hook panicked");
        }
    }

    debug!(worker_id = %worker_id, "Task worker stopped");
}

impl Shared {
    /// Block up to `DEQUEUE_TIMEOUT` for the next task and move it to in-progress
    fn claim_next(&self, worker_id: &str) -> Option<(TaskContext, TaskFn)> {
        let mut state = lock(&self.state);
        if state.pending.is_empty() {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            state = self
                .task_available
                .wait_timeout(state, DEQUEUE_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let (mut task, job) = state.pending.pop()?;
        task.mark_started(worker_id);
        let context = TaskContext {
            task_id: task.id.clone(),
            work_id: task.work_id.clone(),
            worker_id: worker_id.to_string(),
        };
        info!(
            task_id = %task.id,
            worker_id = %worker_id,
            description = %task.description,
            "Task started"
        );
        state.in_progress.insert(task.id.clone(), task);
        Some((context, job))
    }

    /// Move a task out of in-progress into its terminal map
    fn finish(&self, context: &TaskContext, outcome: Result<(), TaskError>) -> Option<Task> {
        let succeeded = outcome.is_ok();
        let finished = {
            let mut state = lock(&self.state);
            let Some(mut task) = state.in_progress.remove(&context.task_id) else {
                error!(task_id = %context.task_id, "Finished task missing from in-progress map");
                return None;
            };

            match outcome {
                Ok(()) => {
                    task.mark_done();
                    info!(
                        task_id = %task.id,
                        worker_id = %context.worker_id,
                        duration_secs = task.duration_secs().unwrap_or_default(),
                        "Task completed"
                    );
                    state.done.insert(task.id.clone(), task.clone());
                }
                Err(e) => {
                    let mut message = e.to_string();
                    if message.trim().is_empty() {
                        message = "Task failed without an error message".to_string();
                    }
                    error!(
                        task_id = %task.id,
                        worker_id = %context.worker_id,
                        error = %message,
                        "Task failed"
                    );
                    task.mark_failed(message);
                    state.failed.insert(task.id.clone(), task.clone());
                }
            }
            task
        };

        let mut stats = lock(&self.stats);
        if succeeded {
            stats.total_completed += 1;
        } else {
            stats.total_failed += 1;
        }
        Some(finished)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    fn noop() -> TaskFn {
        Box::new(|_| Ok(()))
    }

    /// A job that blocks until the returned sender fires (or is dropped)
    fn gated() -> (TaskFn, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel::<()>();
        let job: TaskFn = Box::new(move |_| {
            let _ = rx.recv();
            Ok(())
        });
        (job, tx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_snapshot_counts_each_task_once() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        let held = manager.add_task(NewTask::new("gate"), gate).unwrap();
        let waiting = manager.add_task(NewTask::new("waiting"), noop()).unwrap();
        wait_until(|| manager.get_in_progress_tasks().len() == 1);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.in_progress[0].id, held);
        assert_eq!(snapshot.pending[0].id, waiting);
        assert!(snapshot.done.is_empty() && snapshot.failed.is_empty());
        assert_eq!(snapshot.statistics.pending, 1);
        assert_eq!(snapshot.statistics.in_progress, 1);

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.done.len(), 2);
        assert_eq!(snapshot.statistics.total_completed, 2);
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_same_priority_runs_in_submission_order() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        manager.add_task(NewTask::new("gate"), gate).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            manager
                .add_task(
                    NewTask::new(format!("task {}", i)),
                    Box::new(move |_| {
                        order.lock().unwrap().push(i);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_higher_priority_dequeues_first() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        manager.add_task(NewTask::new("gate"), gate).unwrap();
        wait_until(|| manager.get_statistics().in_progress == 1);

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [
            ("low", TaskPriority::Low),
            ("normal", TaskPriority::Normal),
            ("critical", TaskPriority::Critical),
            ("high", TaskPriority::High),
        ] {
            let order = order.clone();
            manager
                .add_task(
                    NewTask::new(name).priority(priority),
                    Box::new(move |_| {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }),
                )
                .unwrap();
        }

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["critical", "high", "normal", "low"]
        );
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_failure_is_recorded_and_pool_survives() {
        let manager = TaskManager::new(1).unwrap();
        let failing = manager
            .add_task(
                NewTask::new("fails"),
                Box::new(|_| Err(TaskError::failed("indexer rejected the file"))),
            )
            .unwrap();
        let panicking = manager
            .add_task(NewTask::new("panics"), Box::new(|_| panic!("boom")))
            .unwrap();
        let ok = manager.add_task(NewTask::new("works"), noop()).unwrap();

        assert!(manager.wait_for_completion(WAIT));

        let failed = manager.get_task(&failing).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("indexer rejected the file"));
        assert!(failed.completed_at.is_some());

        let panicked = manager.get_task(&panicking).unwrap();
        assert_eq!(panicked.status, TaskStatus::Failed);
        assert_eq!(panicked.error.as_deref(), Some("Task panicked: boom"));

        assert_eq!(manager.get_task(&ok).unwrap().status, TaskStatus::Done);

        let stats = manager.get_statistics();
        assert_eq!(stats.total_failed, 2);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.active_workers, 1);
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_counts_balance_when_quiescent() {
        let manager = TaskManager::new(3).unwrap();
        for i in 0..20 {
            let job: TaskFn = if i % 4 == 0 {
                Box::new(|_| Err(TaskError::failed("nope")))
            } else {
                noop()
            };
            manager.add_task(NewTask::new("t"), job).unwrap();
        }

        assert!(manager.wait_for_completion(WAIT));
        let stats = manager.get_statistics();
        assert_eq!(
            (stats.pending + stats.in_progress + stats.done + stats.failed) as u64,
            stats.total_added
        );
        assert_eq!(stats.total_added, 20);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.workers, 3);
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_lookup_in_every_state() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        let running = manager
            .add_task(NewTask::new("gate").upload("w-1", "a.pdf", "/tmp/a.pdf", 10), gate)
            .unwrap();
        wait_until(|| manager.get_statistics().in_progress == 1);

        let queued = manager
            .add_task(NewTask::new("queued").upload("w-2", "b.pdf", "/tmp/b.pdf", 20), noop())
            .unwrap();

        let task = manager.get_task_by_work_id("w-2").unwrap();
        assert_eq!(task.id, queued);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            manager.get_task(&running).unwrap().status,
            TaskStatus::InProgress
        );
        assert_eq!(
            manager.get_task(&running).unwrap().worker_id.as_deref(),
            Some("task-worker-1")
        );

        let paths = manager.active_file_paths();
        assert!(paths.contains(&PathBuf::from("/tmp/a.pdf")));
        assert!(paths.contains(&PathBuf::from("/tmp/b.pdf")));

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        assert_eq!(
            manager.get_task_by_work_id("w-1").unwrap().status,
            TaskStatus::Done
        );
        assert!(manager.active_file_paths().is_empty());
        assert!(manager.get_task_by_work_id("missing").is_none());
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_work_id_has_one_active_task() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        manager
            .add_task(NewTask::new("first").upload("w-1", "a.pdf", "/tmp/a", 1), gate)
            .unwrap();

        let duplicate =
            manager.add_task(NewTask::new("second").upload("w-1", "a.pdf", "/tmp/a", 1), noop());
        assert!(matches!(duplicate, Err(ServiceError::InvalidRequest { .. })));

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));

        let retry = manager
            .add_task(NewTask::new("retry").upload("w-1", "a.pdf", "/tmp/a", 1), noop())
            .unwrap();
        assert_eq!(manager.get_task_by_work_id("w-1").unwrap().id, retry);
        manager.shutdown(true, WAIT);
    }

    #[test]
    fn test_progress_and_metadata_only_for_in_progress() {
        let manager = TaskManager::new(1).unwrap();
        let (gate, release) = gated();
        let id = manager.add_task(NewTask::new("gate"), gate).unwrap();
        let queued = manager.add_task(NewTask::new("queued"), noop()).unwrap();
        wait_until(|| manager.get_statistics().in_progress == 1);

        assert!(manager.update_task_progress(&id, 40));
        assert!(!manager.update_task_progress(&id, 30));
        assert!(manager.update_task_metadata(&id, TaskMetadata::with_message("halfway")));
        assert!(!manager.update_task_progress(&queued, 50));
        assert!(!manager.update_task_metadata(&queued, TaskMetadata::with_message("x")));

        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.progress_percentage, 40);
        assert_eq!(task.metadata.current_message.as_deref(), Some("halfway"));

        release.send(()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        assert!(!manager.update_task_progress(&id, 100));
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_completion_hook_sees_terminal_task() {
        let (tx, rx) = mpsc::channel();
        let hook: CompletionHook = Arc::new(move |task: &Task| {
            let _ = tx.send((task.id.clone(), task.status));
        });
        let manager = TaskManager::with_completion_hook(2, hook).unwrap();

        let ok = manager.add_task(NewTask::new("ok"), noop()).unwrap();
        let bad = manager
            .add_task(NewTask::new("bad"), Box::new(|_| Err(TaskError::failed("x"))))
            .unwrap();

        let mut seen: HashMap<String, TaskStatus> = HashMap::new();
        for _ in 0..2 {
            let (id, status) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            seen.insert(id, status);
        }
        assert_eq!(seen[&ok], TaskStatus::Done);
        assert_eq!(seen[&bad], TaskStatus::Failed);
        manager.shutdown(false, WAIT);
    }

    #[test]
    fn test_shutdown_rejects_new_tasks_and_stops_workers() {
        let manager = TaskManager::new(2).unwrap();
        manager.add_task(NewTask::new("last"), noop()).unwrap();

        assert!(manager.shutdown(true, WAIT));
        assert!(manager.is_shut_down());
        assert_eq!(manager.get_statistics().active_workers, 0);
        assert_eq!(manager.get_statistics().done, 1);
        assert!(matches!(
            manager.add_task(NewTask::new("late"), noop()),
            Err(ServiceError::ShutDown)
        ));
    }

    #[test]
    fn test_prune_and_clear_finished() {
        let manager = TaskManager::new(1).unwrap();
        manager
            .add_task(NewTask::new("a").upload("w-a", "a", "/tmp/a", 1), noop())
            .unwrap();
        manager
            .add_task(NewTask::new("b"), Box::new(|_| Err(TaskError::failed("x"))))
            .unwrap();
        assert!(manager.wait_for_completion(WAIT));

        assert_eq!(
            manager.prune_finished_before(Utc::now() - chrono::Duration::days(1)),
            0
        );
        assert_eq!(
            manager.prune_finished_before(Utc::now() + chrono::Duration::seconds(1)),
            2
        );
        assert!(manager.get_task_by_work_id("w-a").is_none());

        manager.add_task(NewTask::new("c"), noop()).unwrap();
        assert!(manager.wait_for_completion(WAIT));
        manager.clear_completed_tasks();
        assert!(manager.get_done_tasks().is_empty());
        manager.shutdown(false, WAIT);
    }
}
