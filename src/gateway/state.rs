//! # Gateway State
//!
//! Shared state of the loopback gateway: configuration, counters and the table of tasks
//! created by input connections and consumed by output connections.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: every actix worker and every socket actor holds a reference
//! - **RwLock**: health checks read concurrently, socket actors write briefly
//! - **Poisoning**: a panicked writer leaves the data usable, so locks recover the guard
//!   with `into_inner` instead of propagating the panic
//!
//! ## Task Lifecycle:
//! uploading → ready (reply stored on `upload_complete`) → removed once an output socket
//! takes it. An output socket that connects while the upload is still running registers
//! its `Recipient` and gets the reply pushed by `complete_upload`. A stop request removes
//! the task and tells the waiting socket, if any.
//!
//! Finished ids go to a short, bounded history so a late output connection or stop
//! request still gets a meaningful answer; the task table itself only holds live turns.

use crate::config::AppConfig;
use actix::{Message, Recipient};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info};

/// How many finished task ids are remembered.
const FINISHED_HISTORY: usize = 256;

/// What the gateway answers for a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub content: String,
    pub audio: Option<Vec<u8>>,
}

/// Where a live task is.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPhase {
    /// Input connection still receiving chunks
    Uploading,
    /// Upload complete, reply waiting for the output connection
    Ready(Reply),
}

/// How a task left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Delivered,
    Stopped,
}

/// Pushed to the output socket waiting on a task.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum ReplyEvent {
    Ready(Reply),
    Stopped,
    /// The input connection went away before `upload_complete`
    Abandoned,
}

/// One live task.
pub struct TaskRecord {
    pub phase: TaskPhase,
    pub created_at: DateTime<Utc>,
    /// Output socket waiting for the reply
    output: Option<Recipient<ReplyEvent>>,
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("phase", &self.phase)
            .field("created_at", &self.created_at)
            .field("output_waiting", &self.output.is_some())
            .finish()
    }
}

/// Result of an output connection attaching to its task.
#[derive(Debug, PartialEq)]
pub enum OutputAttach {
    /// The reply was waiting; the task is now finished
    Ready(Reply),
    /// Upload still running; the reply arrives as a `ReplyEvent`
    Waiting,
    /// Another output connection already waits on this task
    Busy,
    Finished(TaskOutcome),
    Unknown,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The task was live and is now stopped
    Stopping,
    /// The task had already been delivered or stopped
    AlreadyFinished,
    Unknown,
}

/// Counters reported by `/health`.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u32,
    pub uploads_completed: u64,
    pub replies_delivered: u64,
    pub stop_requests: u64,
}

/// State shared by every handler and socket actor.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<GatewayMetrics>>,
    pub tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    finished: Arc<RwLock<VecDeque<(String, TaskOutcome)>>>,
    pub start_time: Instant,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(RwLock::new(VecDeque::new())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Create a task for a new input connection.
    pub fn register_task(&self, task_id: &str) {
        write(&self.tasks).insert(
            task_id.to_string(),
            TaskRecord {
                phase: TaskPhase::Uploading,
                created_at: Utc::now(),
                output: None,
            },
        );
        debug!(task_id, "Task registered");
    }

    /// Store the reply for a finished upload, or push it straight to a waiting output
    /// socket. Returns `false` when the task is gone (stopped) or already complete.
    pub fn complete_upload(&self, task_id: &str, reply: Reply) -> bool {
        let mut tasks = write(&self.tasks);
        let waiting = match tasks.get_mut(task_id) {
            Some(record) if record.phase == TaskPhase::Uploading => record.output.take(),
            _ => return false,
        };

        match waiting {
            Some(output) => {
                tasks.remove(task_id);
                drop(tasks);
                write(&self.metrics).uploads_completed += 1;
                self.finish_task(task_id, TaskOutcome::Delivered);
                debug!(task_id, "Reply pushed to waiting output socket");
                output.do_send(ReplyEvent::Ready(reply));
            }
            None => {
                if let Some(record) = tasks.get_mut(task_id) {
                    record.phase = TaskPhase::Ready(reply);
                }
                drop(tasks);
                write(&self.metrics).uploads_completed += 1;
            }
        }
        true
    }

    /// Attach an output socket to its task.
    ///
    /// A waiting reply is handed over at once and the task leaves the table. While the
    /// upload is still running the socket's `Recipient` is kept and the reply is pushed
    /// to it later.
    pub fn attach_output(&self, task_id: &str, output: Recipient<ReplyEvent>) -> OutputAttach {
        let mut tasks = write(&self.tasks);
        let record = match tasks.remove(task_id) {
            Some(record) => record,
            None => {
                drop(tasks);
                return match self.finished_outcome(task_id) {
                    Some(outcome) => OutputAttach::Finished(outcome),
                    None => OutputAttach::Unknown,
                };
            }
        };

        match record.phase {
            TaskPhase::Ready(reply) => {
                drop(tasks);
                self.finish_task(task_id, TaskOutcome::Delivered);
                OutputAttach::Ready(reply)
            }
            TaskPhase::Uploading if record.output.is_some() => {
                tasks.insert(task_id.to_string(), record);
                OutputAttach::Busy
            }
            TaskPhase::Uploading => {
                tasks.insert(
                    task_id.to_string(),
                    TaskRecord {
                        output: Some(output),
                        ..record
                    },
                );
                OutputAttach::Waiting
            }
        }
    }

    /// Forget the output socket waiting on `task_id` (it disconnected).
    pub fn detach_output(&self, task_id: &str) {
        if let Some(record) = write(&self.tasks).get_mut(task_id) {
            record.output = None;
        }
    }

    /// Whether a live task with this id exists.
    pub fn has_task(&self, task_id: &str) -> bool {
        read(&self.tasks).contains_key(task_id)
    }

    pub fn task_phase(&self, task_id: &str) -> Option<TaskPhase> {
        read(&self.tasks).get(task_id).map(|record| record.phase.clone())
    }

    /// How `task_id` finished, if it finished recently.
    pub fn finished_outcome(&self, task_id: &str) -> Option<TaskOutcome> {
        read(&self.finished)
            .iter()
            .rev()
            .find(|(id, _)| id == task_id)
            .map(|(_, outcome)| *outcome)
    }

    fn finish_task(&self, task_id: &str, outcome: TaskOutcome) {
        let mut finished = write(&self.finished);
        finished.push_back((task_id.to_string(), outcome));
        if finished.len() > FINISHED_HISTORY {
            finished.pop_front();
        }
        drop(finished);

        if outcome == TaskOutcome::Delivered {
            write(&self.metrics).replies_delivered += 1;
        }
    }

    /// Stop a task. A live task is removed and its waiting output socket told.
    pub fn request_stop(&self, task_id: &str) -> StopOutcome {
        let removed = write(&self.tasks).remove(task_id);
        let outcome = match removed {
            Some(record) => {
                self.finish_task(task_id, TaskOutcome::Stopped);
                if let Some(output) = record.output {
                    output.do_send(ReplyEvent::Stopped);
                }
                StopOutcome::Stopping
            }
            None if self.finished_outcome(task_id).is_some() => StopOutcome::AlreadyFinished,
            None => return StopOutcome::Unknown,
        };

        info!(task_id, outcome = ?outcome, "Stop requested");
        write(&self.metrics).stop_requests += 1;
        outcome
    }

    /// Drop a task whose input connection went away before `upload_complete`.
    pub fn abandon_task(&self, task_id: &str) {
        let mut tasks = write(&self.tasks);
        if matches!(
            tasks.get(task_id).map(|record| &record.phase),
            Some(TaskPhase::Uploading)
        ) {
            let record = tasks.remove(task_id);
            drop(tasks);
            debug!(task_id, "Unfinished task removed");
            if let Some(output) = record.and_then(|record| record.output) {
                output.do_send(ReplyEvent::Abandoned);
            }
        }
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    pub fn connection_opened(&self) {
        write(&self.metrics).active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = write(&self.metrics);
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> GatewayMetrics {
        read(&self.metrics).clone()
    }

    pub fn task_count(&self) -> usize {
        read(&self.tasks).len()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
