//! Job progress events
//!
//! The engine reports progress through a [`ProgressObserver`] so it can be
//! wired to a terminal, a channel feeding some other task, or nothing at all,
//! without the engine knowing which.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    // Round to 6 decimal places for consistent formatting
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// Status event emitted while a job runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StepStarted {
        timestamp: f64,
        job_id: Uuid,
        step: usize,
        kind: String,
    },
    StepCompleted {
        timestamp: f64,
        job_id: Uuid,
        step: usize,
        commands: usize,
    },
    /// A command failed transiently and is about to be retried
    StepRetrying {
        timestamp: f64,
        job_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<usize>,
        attempt: u32,
        error: String,
    },
    JobCompleted {
        timestamp: f64,
        job_id: Uuid,
        steps_completed: usize,
        elapsed_ms: u64,
    },
    JobFailed {
        timestamp: f64,
        job_id: Uuid,
        reason: String,
        /// Last step that finished successfully
        last_step: Option<usize>,
    },
}

impl JobEvent {
    pub fn step_started(job_id: Uuid, step: usize, kind: &str) -> Self {
        JobEvent::StepStarted {
            timestamp: current_timestamp(),
            job_id,
            step,
            kind: kind.to_string(),
        }
    }

    pub fn step_completed(job_id: Uuid, step: usize, commands: usize) -> Self {
        JobEvent::StepCompleted {
            timestamp: current_timestamp(),
            job_id,
            step,
            commands,
        }
    }

    pub fn step_retrying(job_id: Uuid, step: Option<usize>, attempt: u32, error: &str) -> Self {
        JobEvent::StepRetrying {
            timestamp: current_timestamp(),
            job_id,
            step,
            attempt,
            error: error.to_string(),
        }
    }

    pub fn job_completed(job_id: Uuid, steps_completed: usize, elapsed_ms: u64) -> Self {
        JobEvent::JobCompleted {
            timestamp: current_timestamp(),
            job_id,
            steps_completed,
            elapsed_ms,
        }
    }

    pub fn job_failed(job_id: Uuid, reason: &str, last_step: Option<usize>) -> Self {
        JobEvent::JobFailed {
            timestamp: current_timestamp(),
            job_id,
            reason: reason.to_string(),
            last_step,
        }
    }

    /// Short label for console output
    pub fn label(&self) -> &'static str {
        match self {
            JobEvent::StepStarted { .. } => "STEP",
            JobEvent::StepCompleted { .. } => "DONE",
            JobEvent::StepRetrying { .. } => "RETRY",
            JobEvent::JobCompleted { .. } => "JOB",
            JobEvent::JobFailed { .. } => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. })
    }
}

/// Receiver of job progress events
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> anyhow::Result<()>;
}

/// Discards every event
#[derive(Debug, Clone)]
pub struct NoOpObserver;

#[async_trait]
impl ProgressObserver for NoOpObserver {
    async fn publish(&self, _event: &JobEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prints every event to stdout as JSON
#[derive(Debug, Clone)]
pub struct ConsoleObserver {
    pub pretty_print: bool,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }
}

impl Default for ConsoleObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressObserver for ConsoleObserver {
    async fn publish(&self, event: &JobEvent) -> anyhow::Result<()> {
        if self.pretty_print {
            println!("[{}] {}", event.label(), serde_json::to_string_pretty(event)?);
        } else {
            println!("{}", serde_json::to_string(event)?);
        }
        Ok(())
    }
}

/// Forwards events into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::Sender<JobEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::Sender<JobEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end of a channel holding up to `capacity` events
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl ProgressObserver for ChannelObserver {
    /// Never waits for the consumer; a full channel drops the event
    async fn publish(&self, event: &JobEvent) -> anyhow::Result<()> {
        self.sender.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(dropped) => {
                anyhow::anyhow!("event channel full, dropped {}", dropped.label())
            }
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("event receiver dropped"),
        })
    }
}
