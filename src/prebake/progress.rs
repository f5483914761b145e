use crate::prebake::config::MonitorConfig;
use crate::prebake::util::now_epoch_millis;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

const REPORT_EVENTS_PER_STAGE: usize = 3;
/// Rough characters-per-token figure used for throughput metrics.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn label(self) -> &'static str {
        match self {
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn label(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    OperationStarted,
    StageStarted,
    StageProgress,
    StageCompleted,
    StageFailed,
    Warning,
    OperationCompleted,
    OperationFailed,
    OperationCancelled,
    MetricsUpdate,
}

impl ProgressEventKind {
    pub fn label(self) -> &'static str {
        match self {
            ProgressEventKind::OperationStarted => "operation_started",
            ProgressEventKind::StageStarted => "stage_started",
            ProgressEventKind::StageProgress => "stage_progress",
            ProgressEventKind::StageCompleted => "stage_completed",
            ProgressEventKind::StageFailed => "stage_failed",
            ProgressEventKind::Warning => "warning",
            ProgressEventKind::OperationCompleted => "operation_completed",
            ProgressEventKind::OperationFailed => "operation_failed",
            ProgressEventKind::OperationCancelled => "operation_cancelled",
            ProgressEventKind::MetricsUpdate => "metrics_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub operation_id: String,
    pub kind: ProgressEventKind,
    pub stage: Option<String>,
    pub message: String,
    pub at_epoch_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    pub name: String,
    pub status: StageStatus,
    pub current: usize,
    pub total: Option<usize>,
    pub percentage: f64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl StageProgress {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            current: 0,
            total: None,
            percentage: 0.0,
            started_at_ms: None,
            finished_at_ms: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn set_progress(&mut self, current: usize, total: Option<usize>) {
        self.current = current;
        if total.is_some() {
            self.total = total;
        }
        self.percentage = match self.total {
            Some(0) => 100.0,
            Some(total) => (current as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        };
    }

    pub fn duration_ms(&self, now_ms: u64) -> u64 {
        match self.started_at_ms {
            Some(start) => self.finished_at_ms.unwrap_or(now_ms).saturating_sub(start),
            None => 0,
        }
    }
}

/// Counters the background sampler and the stages both write to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveMetrics {
    pub entries_processed: usize,
    pub tokens_processed: usize,
    pub memory_bytes: u64,
    pub samples: usize,
    pub last_sample_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationProgress {
    pub id: String,
    pub description: String,
    pub status: OperationStatus,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub stages: Vec<StageProgress>,
    pub events: VecDeque<ProgressEvent>,
    pub metrics: LiveMetrics,
    pub error: Option<String>,
    pub error_count: usize,
    pub warning_count: usize,
}

impl OperationProgress {
    fn stage_mut(&mut self, name: &str) -> &mut StageProgress {
        let index = match self.stages.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.stages.push(StageProgress::pending(name));
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }

    pub fn stage(&self, name: &str) -> Option<&StageProgress> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn completed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
            .count()
    }

    pub fn duration_ms(&self, now_ms: u64) -> u64 {
        self.finished_at_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.started_at_ms)
    }
}

fn current_process_memory_bytes(system: &mut System) -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    cfg: MonitorConfig,
    operations: Mutex<HashMap<String, OperationProgress>>,
    subscribers: Mutex<HashMap<String, Vec<Sender<ProgressEvent>>>>,
}

impl Shared {
    /// Applies `update` to a known operation and records the event it returns.
    /// The event is broadcast after the operations lock is released.
    fn update<F>(&self, operation_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut OperationProgress) -> Option<(ProgressEventKind, Option<String>, String)>,
    {
        let event = {
            let mut operations = lock(&self.operations);
            let Some(op) = operations.get_mut(operation_id) else {
                debug!(operation = operation_id, "progress update for unknown operation");
                return false;
            };
            let Some((kind, stage, message)) = update(op) else {
                return true;
            };
            let event = ProgressEvent {
                operation_id: operation_id.to_string(),
                kind,
                stage,
                message,
                at_epoch_ms: now_epoch_millis(),
            };
            op.events.push_back(event.clone());
            while op.events.len() > self.cfg.max_event_history {
                op.events.pop_front();
            }
            event
        };
        self.broadcast(event);
        true
    }

    fn broadcast(&self, event: ProgressEvent) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&event.operation_id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn sample(&self, system: &mut System) {
        let memory = current_process_memory_bytes(system);
        let running: Vec<String> = {
            let operations = lock(&self.operations);
            operations
                .values()
                .filter(|op| op.status == OperationStatus::Running)
                .map(|op| op.id.clone())
                .collect()
        };
        for id in running {
            self.update(&id, |op| {
                op.metrics.memory_bytes = memory;
                op.metrics.samples += 1;
                op.metrics.last_sample_ms = Some(now_epoch_millis());
                Some((
                    ProgressEventKind::MetricsUpdate,
                    None,
                    format!(
                        "entries={} tokens={} memory_mb={:.1}",
                        op.metrics.entries_processed,
                        op.metrics.tokens_processed,
                        memory as f64 / (1024.0 * 1024.0)
                    ),
                ))
            });
        }
    }
}

struct Sampler {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Observer of pipeline lifecycle events. Cheap to share behind an `Arc`;
/// every method takes `&self`.
pub struct ProgressMonitor {
    shared: Arc<Shared>,
    sampler: Mutex<Option<Sampler>>,
}

impl ProgressMonitor {
    pub fn new(cfg: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                operations: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
            }),
            sampler: Mutex::new(None),
        }
    }

    /// Starts the periodic memory sampler if it is not already running.
    pub fn start_sampler(&self) -> Result<()> {
        let mut slot = lock(&self.sampler);
        if slot.is_some() {
            return Ok(());
        }
        let (stop, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_millis(self.shared.cfg.update_interval_ms);
        let handle = thread::Builder::new()
            .name("prebake-progress".to_string())
            .spawn(move || {
                let mut system = System::new();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => shared.sample(&mut system),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("failed to spawn progress sampler")?;
        *slot = Some(Sampler { stop, handle });
        Ok(())
    }

    pub fn sampler_running(&self) -> bool {
        lock(&self.sampler).is_some()
    }

    /// Runs one sampler tick on the calling thread.
    pub fn sample_now(&self) {
        let mut system = System::new();
        self.shared.sample(&mut system);
    }

    pub fn start_operation(&self, operation_id: &str, description: &str, stages: &[&str]) {
        let now = now_epoch_millis();
        {
            let mut operations = lock(&self.shared.operations);
            operations.insert(
                operation_id.to_string(),
                OperationProgress {
                    id: operation_id.to_string(),
                    description: description.to_string(),
                    status: OperationStatus::Running,
                    started_at_ms: now,
                    finished_at_ms: None,
                    stages: stages.iter().map(|s| StageProgress::pending(s)).collect(),
                    events: VecDeque::new(),
                    metrics: LiveMetrics::default(),
                    error: None,
                    error_count: 0,
                    warning_count: 0,
                },
            );
        }
        info!(operation = operation_id, description, "operation started");
        self.shared.update(operation_id, |_| {
            Some((
                ProgressEventKind::OperationStarted,
                None,
                format!("started: {description}"),
            ))
        });
    }

    pub fn start_stage(&self, operation_id: &str, stage: &str, total: Option<usize>) {
        self.shared.update(operation_id, |op| {
            let s = op.stage_mut(stage);
            s.status = StageStatus::Running;
            s.started_at_ms = Some(now_epoch_millis());
            s.finished_at_ms = None;
            s.error = None;
            s.set_progress(0, total);
            Some((
                ProgressEventKind::StageStarted,
                Some(stage.to_string()),
                format!("{stage} started"),
            ))
        });
    }

    pub fn update_stage_progress(
        &self,
        operation_id: &str,
        stage: &str,
        current: usize,
        total: Option<usize>,
    ) {
        self.shared.update(operation_id, |op| {
            let s = op.stage_mut(stage);
            s.set_progress(current, total);
            let message = match s.total {
                Some(total) => format!("{current}/{total} ({:.1}%)", s.percentage),
                None => format!("{current} processed"),
            };
            Some((
                ProgressEventKind::StageProgress,
                Some(stage.to_string()),
                message,
            ))
        });
    }

    /// Adds processed entries and their character volume to the live metrics.
    pub fn record_throughput(&self, operation_id: &str, entries: usize, chars: usize) {
        self.shared.update(operation_id, |op| {
            op.metrics.entries_processed += entries;
            op.metrics.tokens_processed += chars.div_ceil(CHARS_PER_TOKEN);
            None
        });
    }

    pub fn complete_stage(&self, operation_id: &str, stage: &str, message: &str) {
        self.shared.update(operation_id, |op| {
            let s = op.stage_mut(stage);
            s.status = StageStatus::Completed;
            s.finished_at_ms = Some(now_epoch_millis());
            if s.total.is_none() {
                s.total = Some(s.current);
            }
            s.percentage = 100.0;
            Some((
                ProgressEventKind::StageCompleted,
                Some(stage.to_string()),
                message.to_string(),
            ))
        });
    }

    pub fn fail_stage(&self, operation_id: &str, stage: &str, error: &str) {
        self.shared.update(operation_id, |op| {
            op.error_count += 1;
            let s = op.stage_mut(stage);
            s.status = StageStatus::Failed;
            s.finished_at_ms = Some(now_epoch_millis());
            s.error = Some(error.to_string());
            Some((
                ProgressEventKind::StageFailed,
                Some(stage.to_string()),
                error.to_string(),
            ))
        });
    }

    pub fn add_stage_warning(&self, operation_id: &str, stage: &str, warning: &str) {
        self.shared.update(operation_id, |op| {
            op.warning_count += 1;
            op.stage_mut(stage).warnings.push(warning.to_string());
            Some((
                ProgressEventKind::Warning,
                Some(stage.to_string()),
                warning.to_string(),
            ))
        });
    }

    pub fn complete_operation(&self, operation_id: &str) {
        self.shared.update(operation_id, |op| {
            op.status = OperationStatus::Completed;
            op.finished_at_ms = Some(now_epoch_millis());
            Some((
                ProgressEventKind::OperationCompleted,
                None,
                format!("{} of {} stages completed", op.completed_stages(), op.stages.len()),
            ))
        });
    }

    pub fn fail_operation(&self, operation_id: &str, error: &str) {
        self.shared.update(operation_id, |op| {
            op.status = OperationStatus::Failed;
            op.finished_at_ms = Some(now_epoch_millis());
            op.error = Some(error.to_string());
            op.error_count += 1;
            Some((
                ProgressEventKind::OperationFailed,
                None,
                error.to_string(),
            ))
        });
    }

    /// Marks the operation cancelled and any running stage failed.
    pub fn cancel_operation(&self, operation_id: &str, reason: &str) {
        self.shared.update(operation_id, |op| {
            if op.status != OperationStatus::Running {
                return None;
            }
            let now = now_epoch_millis();
            for stage in op
                .stages
                .iter_mut()
                .filter(|s| s.status == StageStatus::Running)
            {
                stage.status = StageStatus::Failed;
                stage.finished_at_ms = Some(now);
                stage.error = Some(format!("cancelled: {reason}"));
            }
            op.status = OperationStatus::Cancelled;
            op.finished_at_ms = Some(now);
            op.error = Some(reason.to_string());
            Some((
                ProgressEventKind::OperationCancelled,
                None,
                reason.to_string(),
            ))
        });
    }

    pub fn status(&self, operation_id: &str) -> Option<OperationProgress> {
        lock(&self.shared.operations).get(operation_id).cloned()
    }

    pub fn operation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.operations).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Channel receiving every later event of one operation.
    pub fn subscribe(&self, operation_id: &str) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers)
            .entry(operation_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn report(&self, operation_id: &str) -> Option<String> {
        let op = self.status(operation_id)?;
        let now = now_epoch_millis();
        let total_stages = op.stages.len();
        let done = op.completed_stages();
        let pct = if total_stages == 0 {
            0.0
        } else {
            done as f64 / total_stages as f64 * 100.0
        };

        let mut out = String::new();
        let _ = writeln!(out, "=== PROGRESS MONITORING REPORT ===");
        let _ = writeln!(out, "Operation: {}", op.id);
        if !op.description.is_empty() {
            let _ = writeln!(out, "Description: {}", op.description);
        }
        let _ = writeln!(out, "Status: {}", op.status.label());
        let _ = writeln!(out, "Duration: {:.1}s", op.duration_ms(now) as f64 / 1000.0);
        let _ = writeln!(out, "Overall progress: {done}/{total_stages} stages ({pct:.1}%)");
        if op.error_count > 0 || op.warning_count > 0 {
            let _ = writeln!(
                out,
                "Issues: {} errors, {} warnings",
                op.error_count, op.warning_count
            );
        }
        if let Some(err) = &op.error {
            let _ = writeln!(out, "Error: {err}");
        }

        let _ = writeln!(out, "\nStage progress:");
        for stage in &op.stages {
            let counts = match stage.total {
                Some(total) => format!("{}/{}", stage.current, total),
                None => stage.current.to_string(),
            };
            let _ = writeln!(
                out,
                "  [{}] {}: {} ({:.1}%) - {:.1}s",
                stage.status.label(),
                stage.name,
                counts,
                stage.percentage,
                stage.duration_ms(now) as f64 / 1000.0
            );
            let recent: Vec<&ProgressEvent> = op
                .events
                .iter()
                .filter(|e| e.stage.as_deref() == Some(stage.name.as_str()))
                .collect();
            let skip = recent.len().saturating_sub(REPORT_EVENTS_PER_STAGE);
            for event in recent.into_iter().skip(skip) {
                let _ = writeln!(out, "    - {}: {}", event.kind.label(), event.message);
            }
        }

        let _ = writeln!(out, "\nReal-time metrics:");
        let _ = writeln!(out, "  Entries processed: {}", op.metrics.entries_processed);
        let _ = writeln!(out, "  Tokens processed: {}", op.metrics.tokens_processed);
        let _ = writeln!(
            out,
            "  Memory usage: {:.1} MB",
            op.metrics.memory_bytes as f64 / (1024.0 * 1024.0)
        );
        let _ = writeln!(out, "=== END PROGRESS REPORT ===");
        Some(out)
    }

    /// Drops finished operations older than `max_age`. Returns how many went.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = now_epoch_millis();
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let removed: Vec<String> = {
            let mut operations = lock(&self.shared.operations);
            let stale: Vec<String> = operations
                .values()
                .filter(|op| op.status != OperationStatus::Running)
                .filter(|op| now.saturating_sub(op.finished_at_ms.unwrap_or(op.started_at_ms)) >= max_age_ms)
                .map(|op| op.id.clone())
                .collect();
            for id in &stale {
                operations.remove(id);
            }
            stale
        };
        if !removed.is_empty() {
            let mut subscribers = lock(&self.shared.subscribers);
            for id in &removed {
                subscribers.remove(id);
            }
            debug!(removed = removed.len(), "cleaned up finished operations");
        }
        removed.len()
    }

    /// Drops finished operations older than the configured retention.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup(Duration::from_secs(self.shared.cfg.retention_secs))
    }

    /// Stops the sampler and cancels anything still running.
    pub fn shutdown(&self) {
        if let Some(sampler) = lock(&self.sampler).take() {
            drop(sampler.stop);
            if sampler.handle.join().is_err() {
                warn!("progress sampler thread panicked");
            }
        }
        let running: Vec<String> = lock(&self.shared.operations)
            .values()
            .filter(|op| op.status == OperationStatus::Running)
            .map(|op| op.id.clone())
            .collect();
        for id in running {
            self.cancel_operation(&id, "monitor shut down");
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
