//! Job Execution Engine
//!
//! Drives a planned job through a [`Session`] one command at a time. Every
//! command is retried on transient failures with bounded exponential
//! backoff; a faulted session is reset before each retry. The laser is armed
//! before the first planned command and disarmed after the last.

use crate::codec::Command;
use crate::config::{Config, RetryConfig};
use crate::events::{JobEvent, NoOpObserver, ProgressObserver};
use crate::job::Job;
use crate::planner::{Plan, PlanError, PlannedCommand, Planner};
use crate::session::{Session, SessionError, SessionState};
use crate::units::StagePosition;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job rejected: {0}")]
    Rejected(#[from] PlanError),

    #[error("Session not ready: {0}")]
    NotReady(#[source] SessionError),

    #[error("Job aborted (last completed step {}): {reason}", describe_step(.last_step))]
    Aborted {
        last_step: Option<usize>,
        reason: String,
    },

    #[error("Job cancelled (last completed step {})", describe_step(.last_step))]
    Cancelled { last_step: Option<usize> },
}

impl JobError {
    /// Last step that finished before the job stopped
    pub fn last_step(&self) -> Option<usize> {
        match self {
            JobError::Aborted { last_step, .. } | JobError::Cancelled { last_step } => *last_step,
            JobError::Rejected(_) | JobError::NotReady(_) => None,
        }
    }
}

fn describe_step(step: &Option<usize>) -> String {
    step.map_or_else(|| "none".to_string(), |s| s.to_string())
}

/// Shared flag for cooperative cancellation. The engine checks it between
/// commands; a command already on the wire always runs to its outcome.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub job_name: String,
    pub first_step: usize,
    pub steps_completed: usize,
    /// Commands acknowledged, arm and disarm included
    pub commands_executed: usize,
    pub retries: u32,
    pub elapsed: Duration,
    pub final_position: Option<StagePosition>,
}

/// Per-job bookkeeping, dropped when the job reaches an outcome
#[derive(Debug)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub current_step: Option<usize>,
    pub last_completed_step: Option<usize>,
    /// Retries keyed by step; `None` counts arm and disarm
    pub retries_per_step: HashMap<Option<usize>, u32>,
    pub commands_executed: usize,
    pub started: Instant,
    /// Stage position after the last acknowledged command
    pub last_position: Option<StagePosition>,
    /// `ARM` was submitted, acknowledged or not
    pub arm_submitted: bool,
}

impl ExecutionContext {
    fn new(plan: &Plan, session: &Session) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            current_step: None,
            last_completed_step: plan.first_step.checked_sub(1),
            retries_per_step: HashMap::new(),
            commands_executed: 0,
            started: Instant::now(),
            last_position: plan.start_position.or(session.machine().position),
            arm_submitted: false,
        }
    }

    pub fn total_retries(&self) -> u32 {
        self.retries_per_step.values().sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Why a single command could not be completed
enum CommandFailure {
    Cancelled,
    Failed(String),
}

pub struct ExecutionEngine {
    planner: Planner,
    retry: RetryConfig,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancelToken,
}

impl ExecutionEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            planner: Planner::new(config.planner.clone()),
            retry: config.retry.clone(),
            observer: Arc::new(NoOpObserver),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Validate and plan a job without touching any hardware
    pub fn plan(&self, job: &Job, first_step: usize) -> Result<Plan, JobError> {
        Ok(self.planner.plan_from(job, first_step)?)
    }

    pub async fn execute(&self, job: &Job, session: &mut Session) -> Result<JobReport, JobError> {
        self.execute_from(job, session, 0).await
    }

    /// Run `job` starting at `first_step`, e.g. after an earlier run aborted
    pub async fn execute_from(
        &self,
        job: &Job,
        session: &mut Session,
        first_step: usize,
    ) -> Result<JobReport, JobError> {
        let plan = match self.planner.plan_from(job, first_step) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Job '{}' rejected: {}", job.name, e);
                self.publish(&JobEvent::job_failed(Uuid::nil(), &e.to_string(), None)).await;
                return Err(JobError::Rejected(e));
            }
        };

        if session.state() != SessionState::Idle {
            return Err(JobError::NotReady(SessionError::InvalidState {
                operation: "start a job",
                state: session.state(),
            }));
        }

        let mut ctx = ExecutionContext::new(&plan, session);
        info!(
            "Starting job '{}' ({}): {} commands, steps {}..{}, estimated {:?}",
            plan.job_name,
            ctx.job_id,
            plan.len(),
            plan.first_step,
            plan.step_count,
            plan.summary.estimated_duration
        );

        match self.run_plan(&plan, session, &mut ctx).await {
            Ok(()) => {
                let steps_completed = plan.step_count - plan.first_step;
                let elapsed = ctx.elapsed();
                info!(
                    "Job '{}' completed in {:?} ({} commands, {} retries)",
                    plan.job_name,
                    elapsed,
                    ctx.commands_executed,
                    ctx.total_retries()
                );
                self.publish(&JobEvent::job_completed(
                    ctx.job_id,
                    steps_completed,
                    elapsed.as_millis() as u64,
                ))
                .await;
                Ok(JobReport {
                    job_id: ctx.job_id,
                    job_name: plan.job_name.clone(),
                    first_step: plan.first_step,
                    steps_completed,
                    commands_executed: ctx.commands_executed,
                    retries: ctx.total_retries(),
                    elapsed,
                    final_position: ctx.last_position,
                })
            }
            Err(failure) => {
                self.disarm_after_failure(session, &ctx).await;
                let last_step = ctx.last_completed_step;
                let (reason, err) = match failure {
                    CommandFailure::Cancelled => {
                        warn!("Job '{}' cancelled", plan.job_name);
                        ("cancelled".to_string(), JobError::Cancelled { last_step })
                    }
                    CommandFailure::Failed(reason) => {
                        error!("Job '{}' aborted: {}", plan.job_name, reason);
                        (reason.clone(), JobError::Aborted { last_step, reason })
                    }
                };
                self.publish(&JobEvent::job_failed(ctx.job_id, &reason, last_step)).await;
                Err(err)
            }
        }
    }

    async fn run_plan(
        &self,
        plan: &Plan,
        session: &mut Session,
        ctx: &mut ExecutionContext,
    ) -> Result<(), CommandFailure> {
        self.run_command(Command::Arm, None, session, ctx).await?;

        let mut remaining: &[PlannedCommand] = &plan.commands;
        for step in plan.first_step..plan.step_count {
            let count = remaining.iter().take_while(|c| c.step == step).count();
            let (commands, rest) = remaining.split_at(count);
            remaining = rest;

            ctx.current_step = Some(step);
            let kind = commands
                .first()
                .map_or("noop", |c| c.command.opcode());
            self.publish(&JobEvent::step_started(ctx.job_id, step, kind)).await;

            for planned in commands {
                self.run_command(planned.command, Some(step), session, ctx).await?;
            }

            ctx.last_completed_step = Some(step);
            self.publish(&JobEvent::step_completed(ctx.job_id, step, commands.len())).await;
        }
        ctx.current_step = None;

        self.run_command(Command::Disarm, None, session, ctx).await
    }

    /// Execute one command, retrying transient failures
    async fn run_command(
        &self,
        command: Command,
        step: Option<usize>,
        session: &mut Session,
        ctx: &mut ExecutionContext,
    ) -> Result<(), CommandFailure> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(CommandFailure::Cancelled);
            }

            if command == Command::Arm {
                ctx.arm_submitted = true;
            }
            let timeout = session.command_timeout(&command, ctx.last_position);
            let error = match session.execute(command, timeout).await {
                Ok(_) => {
                    ctx.commands_executed += 1;
                    if let Some(target) = command.target() {
                        ctx.last_position = Some(target);
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= max_attempts {
                let reason = if error.is_transient() {
                    format!("{} failed after {} attempts: {}", command.opcode(), attempt, error)
                } else {
                    format!("{} failed: {}", command.opcode(), error)
                };
                return Err(CommandFailure::Failed(reason));
            }

            warn!(
                "{} attempt {}/{} failed: {}",
                command.opcode(),
                attempt,
                max_attempts,
                error
            );
            *ctx.retries_per_step.entry(step).or_insert(0) += 1;
            self.publish(&JobEvent::step_retrying(ctx.job_id, step, attempt, &error.to_string()))
                .await;

            if session.state() == SessionState::Faulted {
                if let Err(e) = session.recover().await {
                    return Err(CommandFailure::Failed(format!(
                        "{} failed ({}) and recovery failed: {}",
                        command.opcode(),
                        error,
                        e
                    )));
                }
            }

            tokio::time::sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// Leave the laser disarmed if the session can still take commands
    async fn disarm_after_failure(&self, session: &mut Session, ctx: &ExecutionContext) {
        if !ctx.arm_submitted {
            return;
        }
        if session.state() == SessionState::Faulted {
            if let Err(e) = session.recover().await {
                warn!("Could not recover session to disarm laser: {}", e);
                return;
            }
        }
        if session.state() != SessionState::Idle {
            return;
        }
        let timeout = session.command_timeout(&Command::Disarm, ctx.last_position);
        if let Err(e) = session.execute(Command::Disarm, timeout).await {
            warn!("Failed to disarm laser: {}", e);
        }
    }

    async fn publish(&self, event: &JobEvent) {
        if let Err(e) = self.observer.publish(event).await {
            warn!("Failed to publish {} event: {}", event.label(), e);
        }
    }
}

/// Runs jobs on their own tokio task
pub struct JobRunner;

impl JobRunner {
    /// Start `job` at `first_step` on a new task. The session is handed back
    /// through [`JobHandle::join`].
    pub fn spawn(engine: ExecutionEngine, job: Job, mut session: Session, first_step: usize) -> JobHandle {
        let cancel = engine.cancel_token();
        let task = tokio::spawn(async move {
            let result = engine.execute_from(&job, &mut session, first_step).await;
            (session, result)
        });
        JobHandle { cancel, task }
    }
}

pub struct JobHandle {
    cancel: CancelToken,
    task: JoinHandle<(Session, Result<JobReport, JobError>)>,
}

impl JobHandle {
    /// Ask the job to stop at the next command boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job and take the session back
    pub async fn join(self) -> crate::Result<(Session, Result<JobReport, JobError>)> {
        Ok(self.task.await?)
    }
}
