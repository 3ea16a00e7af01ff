//! FIFO of pending durable-store mutations with an append-only JSONL log.
//!
//! Every accepted group of tasks is written to the log as one `group` record
//! before it becomes visible to the drain worker. A task is acked only after the durable
//! store confirmed it. Replaying the log at startup reconstructs every task
//! that was never acked.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tabwatch_core::config::{QueueConfig, SaturationPolicy};
use tabwatch_core::ids::{TabId, TaskId, UserId};
use tabwatch_core::session::{Session, TelemetryLogEntry};

use crate::error::StoreError;
use crate::record_store::RecordStore;
use crate::reliable::RetryingExecutor;

/// The mutation a task applies to the durable store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistAction {
    Upsert { session: Session },
    Delete { user_id: UserId, tab_id: TabId },
    Log { entry: TelemetryLogEntry },
}

impl PersistAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::Delete { .. } => "delete",
            Self::Log { .. } => "log",
        }
    }

    pub fn tab_id(&self) -> &TabId {
        match self {
            Self::Upsert { session } => &session.tab_id,
            Self::Delete { tab_id, .. } => tab_id,
            Self::Log { entry } => &entry.tab_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistTask {
    pub id: TaskId,
    pub action: PersistAction,
}

/// One line of the on-disk log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogLine {
    Enqueue {
        id: TaskId,
        task: PersistTask,
    },
    Ack {
        id: TaskId,
    },
    /// An accepted group together with the tasks it displaced. A torn group
    /// line fails to parse and is skipped whole on replay.
    Group {
        tasks: Vec<PersistTask>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dropped: Vec<TaskId>,
    },
}

struct LogFile {
    path: PathBuf,
    file: File,
    /// Set after a failed write; the next line starts on a fresh line.
    torn: bool,
}

impl LogFile {
    fn open_append(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            torn: false,
        })
    }

    /// Write one line with a single `write_all`. Nothing is buffered across
    /// calls, so a failed write is never retried implicitly later.
    fn append(&mut self, line: &LogLine) -> Result<(), StoreError> {
        let mut buf = String::new();
        if self.torn {
            buf.push('\n');
        }
        buf.push_str(&serde_json::to_string(line)?);
        buf.push('\n');
        match self.file.write_all(buf.as_bytes()).and_then(|()| self.file.flush()) {
            Ok(()) => {
                self.torn = false;
                Ok(())
            }
            Err(e) => {
                self.torn = true;
                Err(e.into())
            }
        }
    }

    /// Rewrite the log so it holds exactly one `enqueue` line per pending task.
    fn compact(&mut self, pending: &VecDeque<PersistTask>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for task in pending {
                let line = LogLine::Enqueue {
                    id: task.id.clone(),
                    task: task.clone(),
                };
                serde_json::to_writer(&mut out, &line)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *self = Self::open_append(&self.path)?;
        Ok(())
    }
}

/// Reconstruct unacked tasks, in enqueue order. Unreadable lines are skipped.
fn replay(path: &Path) -> Result<VecDeque<PersistTask>, StoreError> {
    if !path.exists() {
        return Ok(VecDeque::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut enqueued = Vec::new();
    let mut acked = HashSet::new();
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogLine>(&line) {
            Ok(LogLine::Enqueue { task, .. }) => enqueued.push(task),
            Ok(LogLine::Ack { id }) => {
                acked.insert(id);
            }
            Ok(LogLine::Group { tasks, dropped }) => {
                acked.extend(dropped);
                enqueued.extend(tasks);
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped unreadable queue log lines");
    }

    let mut seen = HashSet::new();
    Ok(enqueued
        .into_iter()
        .filter(|t| !acked.contains(&t.id) && seen.insert(t.id.clone()))
        .collect())
}

struct QueueState {
    tasks: VecDeque<PersistTask>,
    log: Option<LogFile>,
    acks_since_compact: u64,
}

pub struct DurableWriteQueue {
    capacity: usize,
    compact_every: u64,
    retry_pause: std::time::Duration,
    policy: SaturationPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
    recovered: usize,
    dropped: AtomicU64,
    applied: AtomicU64,
}

impl DurableWriteQueue {
    /// Open the queue backed by its on-disk log, replaying unacked tasks.
    pub fn open(config: &QueueConfig, policy: SaturationPolicy) -> Result<Self, StoreError> {
        if let Some(parent) = config.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tasks = replay(&config.log_path)?;
        let mut log = LogFile::open_append(&config.log_path)?;
        log.compact(&tasks)?;

        let recovered = tasks.len();
        if recovered > 0 {
            info!(recovered, path = %config.log_path.display(), "recovered pending write tasks");
        }
        Ok(Self::build(config, policy, tasks, Some(log), recovered))
    }

    /// Queue without a log. Nothing survives a restart.
    pub fn in_memory(config: &QueueConfig, policy: SaturationPolicy) -> Self {
        Self::build(config, policy, VecDeque::new(), None, 0)
    }

    fn build(
        config: &QueueConfig,
        policy: SaturationPolicy,
        tasks: VecDeque<PersistTask>,
        log: Option<LogFile>,
        recovered: usize,
    ) -> Self {
        Self {
            capacity: config.capacity.max(1),
            compact_every: config.compact_every.max(1),
            retry_pause: config.retry_pause,
            policy,
            state: Mutex::new(QueueState {
                tasks,
                log,
                acks_since_compact: 0,
            }),
            notify: Notify::new(),
            recovered,
            dropped: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Append a group of tasks atomically: either all are queued or none.
    /// The group and any displaced tasks go to the log as one line, and
    /// memory changes only after that line is written.
    pub fn enqueue_all(&self, actions: Vec<PersistAction>) -> Result<Vec<TaskId>, StoreError> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let needed = actions.len();

        let overflow = (state.tasks.len() + needed).saturating_sub(self.capacity);
        if overflow > 0 && self.policy == SaturationPolicy::Reject {
            warn!(
                queued = state.tasks.len(),
                capacity = self.capacity,
                "write queue saturated, rejecting"
            );
            return Err(StoreError::Unavailable("write queue saturated".into()));
        }
        let victims = overflow.min(state.tasks.len());

        let tasks: Vec<PersistTask> = actions
            .into_iter()
            .map(|action| PersistTask {
                id: TaskId::new(),
                action,
            })
            .collect();
        if state.log.is_some() {
            let line = LogLine::Group {
                tasks: tasks.clone(),
                dropped: state.tasks.iter().take(victims).map(|t| t.id.clone()).collect(),
            };
            if let Some(log) = state.log.as_mut() {
                log.append(&line)?;
            }
        }

        for oldest in state.tasks.drain(..victims) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %oldest.id,
                kind = oldest.action.kind(),
                tab_id = %oldest.action.tab_id(),
                "write queue full, dropped oldest task"
            );
        }
        let ids = tasks.iter().map(|t| t.id.clone()).collect();
        state.tasks.extend(tasks);
        drop(state);

        self.notify.notify_one();
        Ok(ids)
    }

    pub fn enqueue(&self, action: PersistAction) -> Result<TaskId, StoreError> {
        let mut ids = self.enqueue_all(vec![action])?;
        ids.pop()
            .ok_or_else(|| StoreError::Unavailable("enqueue produced no task".into()))
    }

    pub fn front(&self) -> Option<PersistTask> {
        self.state.lock().tasks.front().cloned()
    }

    /// Remove a task after its effect was confirmed. Unknown ids (already
    /// dropped by the saturation policy) are ignored.
    pub fn ack(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let Some(pos) = state.tasks.iter().position(|t| &t.id == id) else {
            return Ok(());
        };
        state.tasks.remove(pos);
        self.applied.fetch_add(1, Ordering::Relaxed);

        let QueueState {
            tasks,
            log,
            acks_since_compact,
        } = &mut *state;
        if let Some(log) = log.as_mut() {
            log.append(&LogLine::Ack { id: id.clone() })?;
            *acks_since_compact += 1;
            if *acks_since_compact >= self.compact_every {
                log.compact(tasks)?;
                *acks_since_compact = 0;
                debug!(pending = tasks.len(), "compacted write queue log");
            }
        }
        Ok(())
    }

    /// Snapshot of pending tasks in FIFO order.
    pub fn pending(&self) -> Vec<PersistTask> {
        self.state.lock().tasks.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_durable(&self) -> bool {
        self.state.lock().log.is_some()
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Tasks reconstructed from the log when the queue was opened.
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Apply queued tasks in order until the queue is empty or a task fails.
    /// Returns the number applied.
    pub async fn drain_pending(&self, applier: &TaskApplier) -> usize {
        let mut applied = 0;
        while let Some(task) = self.front() {
            if let Err(e) = applier.apply(&task).await {
                warn!(task_id = %task.id, kind = task.action.kind(), error = %e, "write task failed");
                break;
            }
            if let Err(e) = self.ack(&task.id) {
                error!(task_id = %task.id, error = %e, "failed to ack write task");
                break;
            }
            applied += 1;
        }
        applied
    }

    /// Single sequential drain worker. A failed task stays at the head and is
    /// retried after `retry_pause`.
    pub async fn run_drain(self: Arc<Self>, applier: TaskApplier, cancel: CancellationToken) {
        info!(pending = self.len(), durable = self.is_durable(), "write queue drain started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let task = match self.front() {
                Some(task) => task,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.notify.notified() => {}
                    }
                    continue;
                }
            };

            match applier.apply(&task).await {
                Ok(()) => {
                    if let Err(e) = self.ack(&task.id) {
                        error!(task_id = %task.id, error = %e, "failed to ack write task");
                    }
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        kind = task.action.kind(),
                        tab_id = %task.action.tab_id(),
                        error_kind = e.error_kind(),
                        error = %e,
                        "write task failed, will retry"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_pause) => {}
                    }
                }
            }
        }
        info!(pending = self.len(), "write queue drain stopped");
    }
}

/// Applies tasks to the durable store through the retrying executor.
#[derive(Clone)]
pub struct TaskApplier {
    store: Arc<dyn RecordStore>,
    executor: Arc<RetryingExecutor>,
}

impl TaskApplier {
    pub fn new(store: Arc<dyn RecordStore>, executor: Arc<RetryingExecutor>) -> Self {
        Self { store, executor }
    }

    /// Upserts resolve the create/update race locally; deleting a missing
    /// session counts as applied.
    pub async fn apply(&self, task: &PersistTask) -> Result<(), StoreError> {
        let store = &self.store;
        let exec = &self.executor;
        match &task.action {
            PersistAction::Upsert { session } => {
                match exec.execute("update_session", || store.update_session(session)).await {
                    Err(e) if e.is_not_found() => {
                        match exec.execute("create_session", || store.create_session(session)).await {
                            Err(e) if e.is_duplicate() => {
                                exec.execute("update_session", || store.update_session(session)).await
                            }
                            other => other,
                        }
                    }
                    other => other,
                }
            }
            PersistAction::Delete { tab_id, .. } => {
                match exec.execute("delete_session", || store.delete_session(tab_id)).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
            PersistAction::Log { entry } => {
                exec.execute("append_log", || store.append_log(entry)).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryRecordStore;
    use chrono::Utc;
    use std::time::Duration;
    use tabwatch_core::session::{EventKind, SessionState};

    fn temp_log() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tabwatch-queue-{}", uuid::Uuid::now_v7()))
            .join("hotpath-queue.log")
    }

    fn config(path: PathBuf, capacity: usize) -> QueueConfig {
        QueueConfig {
            capacity,
            compact_every: 3,
            retry_pause: Duration::from_millis(10),
            ..QueueConfig::with_log_path(path)
        }
    }

    fn session(tab: &str, version: u64) -> Session {
        let now = Utc::now();
        Session {
            tab_id: TabId::from_raw(tab),
            user_id: UserId::from_raw("u1"),
            username: "alice".into(),
            source_ip: None,
            state: Some(SessionState::Focused),
            last_seen: now,
            updated_at: now,
            version,
            last_operation_id: None,
        }
    }

    fn upsert(tab: &str, version: u64) -> PersistAction {
        PersistAction::Upsert {
            session: session(tab, version),
        }
    }

    fn applier(store: &Arc<MemoryRecordStore>) -> TaskApplier {
        TaskApplier::new(store.clone(), Arc::new(RetryingExecutor::disabled()))
    }

    #[tokio::test]
    async fn recovers_unacked_tasks_after_crash() {
        let path = temp_log();
        let cfg = config(path.clone(), 100);
        {
            let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
            for i in 0..5 {
                queue.enqueue(upsert(&format!("t{i}"), 1)).unwrap();
            }
            let first = queue.front().unwrap();
            queue.ack(&first.id).unwrap();
            // Dropped without draining: simulated crash.
        }

        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        assert_eq!(queue.recovered(), 4);
        let tabs: Vec<String> = queue
            .pending()
            .iter()
            .map(|t| t.action.tab_id().to_string())
            .collect();
        assert_eq!(tabs, vec!["t1", "t2", "t3", "t4"]);

        let store = Arc::new(MemoryRecordStore::new());
        assert_eq!(queue.drain_pending(&applier(&store)).await, 4);
        assert!(queue.is_empty());
        assert_eq!(store.session_count(), 4);

        let reopened = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        assert_eq!(reopened.recovered(), 0);
    }

    #[tokio::test]
    async fn torn_tail_line_is_skipped() {
        let path = temp_log();
        let cfg = config(path.clone(), 100);
        {
            let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
            queue.enqueue(upsert("t1", 1)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"enqueue\",\"id\":\"task_x\",\"ta").unwrap();
        drop(file);

        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn torn_group_line_applies_no_part_of_the_group() {
        let path = temp_log();
        let cfg = config(path.clone(), 100);
        {
            let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
            queue.enqueue(upsert("t1", 1)).unwrap();
            queue
                .enqueue_all(vec![upsert("t2", 1), upsert("t3", 1)])
                .unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        // Cut the group line short, keeping its first task intact on disk.
        let cut = contents.find("\"t3\"").unwrap();
        fs::write(&path, &contents[..cut]).unwrap();

        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        let tabs: Vec<String> = queue
            .pending()
            .iter()
            .map(|t| t.action.tab_id().to_string())
            .collect();
        assert_eq!(tabs, vec!["t1"]);
    }

    #[tokio::test]
    async fn write_after_failed_append_starts_a_fresh_line() {
        let path = temp_log();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{\"op\":\"group\",\"tasks\":[{\"id\"").unwrap();

        let mut log = LogFile::open_append(&path).unwrap();
        log.torn = true;
        let task = PersistTask {
            id: TaskId::new(),
            action: upsert("t1", 1),
        };
        log.append(&LogLine::Enqueue {
            id: task.id.clone(),
            task: task.clone(),
        })
        .unwrap();
        assert!(!log.torn);

        let replayed = replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], task);
    }

    #[tokio::test]
    async fn durable_drop_oldest_logs_victims_with_the_group() {
        let path = temp_log();
        let cfg = config(path.clone(), 2);
        {
            let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::DropOldest).unwrap();
            queue.enqueue(upsert("t1", 1)).unwrap();
            queue.enqueue(upsert("t2", 1)).unwrap();
            queue.enqueue(upsert("t3", 1)).unwrap();
            assert_eq!(queue.dropped(), 1);
        }
        // One line per accepted group, no separate ack for the dropped task.
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::DropOldest).unwrap();
        let tabs: Vec<String> = queue
            .pending()
            .iter()
            .map(|t| t.action.tab_id().to_string())
            .collect();
        assert_eq!(tabs, vec!["t2", "t3"]);
    }

    #[tokio::test]
    async fn compaction_keeps_only_pending() {
        let path = temp_log();
        let cfg = config(path.clone(), 100);
        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        for i in 0..4 {
            queue.enqueue(upsert(&format!("t{i}"), 1)).unwrap();
        }
        for _ in 0..3 {
            let t = queue.front().unwrap();
            queue.ack(&t.id).unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"t3\""));
    }

    #[tokio::test]
    async fn durable_policy_rejects_when_full() {
        let cfg = config(temp_log(), 2);
        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        queue.enqueue(upsert("t1", 1)).unwrap();
        queue.enqueue(upsert("t2", 1)).unwrap();
        let err = queue.enqueue(upsert("t3", 1)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(queue.len(), 2);

        // Groups are all-or-nothing.
        let cfg = config(temp_log(), 3);
        let queue = DurableWriteQueue::open(&cfg, SaturationPolicy::Reject).unwrap();
        queue.enqueue(upsert("t1", 1)).unwrap();
        queue.enqueue(upsert("t2", 1)).unwrap();
        assert!(queue.enqueue_all(vec![upsert("t3", 1), upsert("t4", 1)]).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn best_effort_drops_oldest() {
        let cfg = config(temp_log(), 2);
        let queue = DurableWriteQueue::in_memory(&cfg, SaturationPolicy::DropOldest);
        for i in 0..3 {
            queue.enqueue(upsert(&format!("t{i}"), 1)).unwrap();
        }
        assert_eq!(queue.dropped(), 1);
        let tabs: Vec<String> = queue
            .pending()
            .iter()
            .map(|t| t.action.tab_id().to_string())
            .collect();
        assert_eq!(tabs, vec!["t1", "t2"]);
        assert!(!queue.is_durable());
    }

    #[tokio::test]
    async fn upsert_resolves_create_update_race() {
        let store = Arc::new(MemoryRecordStore::new());
        let applier = applier(&store);

        // Missing record: update fails NotFound, falls back to create.
        let task = PersistTask {
            id: TaskId::new(),
            action: upsert("t1", 1),
        };
        applier.apply(&task).await.unwrap();
        assert_eq!(store.session(&TabId::from_raw("t1")).unwrap().version, 1);

        // Re-applying is idempotent by tab id.
        applier.apply(&task).await.unwrap();
        assert_eq!(store.session_count(), 1);

        let delete = PersistTask {
            id: TaskId::new(),
            action: PersistAction::Delete {
                user_id: UserId::from_raw("u1"),
                tab_id: TabId::from_raw("t1"),
            },
        };
        applier.apply(&delete).await.unwrap();
        applier.apply(&delete).await.unwrap();
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn drain_worker_retries_failed_head() {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = Arc::new(DurableWriteQueue::in_memory(
            &config(temp_log(), 100),
            SaturationPolicy::DropOldest,
        ));
        store.fail_next(2, StoreError::Unavailable("blip".into()));

        queue.enqueue(upsert("t1", 1)).unwrap();
        queue
            .enqueue(PersistAction::Log {
                entry: TelemetryLogEntry {
                    user_id: UserId::from_raw("u1"),
                    tab_id: TabId::from_raw("t1"),
                    state: Some(SessionState::Focused),
                    event_type: EventKind::StateChange,
                    operation_id: None,
                    request_id: None,
                    timestamp: Utc::now(),
                },
            })
            .unwrap();

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(queue.clone().run_drain(applier(&store), cancel.clone()));

        for _ in 0..200 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        worker.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.applied(), 2);
        assert_eq!(store.session_count(), 1);
        assert_eq!(store.logs().len(), 1);
    }
}
