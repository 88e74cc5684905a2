//! nanofab - job execution and motion coordination for a laser nanofactory
//!
//! Drives a two-photon lithography stage like a 3D printer: a parsed job is
//! planned into primitive motion/exposure commands, which are sequenced
//! against controller acknowledgements with retry and fault recovery.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nanofab::{Config, ConsoleObserver, ExecutionEngine, Job, Session};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let job = Job::load_from_path("jobs/calibration_grid.yaml")?;
//!
//!     let mut session = Session::from_config(&config)?;
//!     session.connect().await?;
//!
//!     let engine = ExecutionEngine::new(&config).with_observer(Arc::new(ConsoleObserver::new()));
//!     let report = engine.execute(&job, &mut session).await?;
//!     println!("{} steps in {:?}", report.steps_completed, report.elapsed);
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Transport**: byte links to the controller (TCP, serial, simulated)
//! - **Codec**: ASCII command/response frames with checksums
//! - **Session**: connection lifecycle and one-command-in-flight discipline
//! - **Planner**: job steps to primitive commands, pure and deterministic
//! - **ExecutionEngine**: sequencing, retries, recovery, cancellation
//! - **ProgressObserver**: transport-agnostic progress events

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod planner;
pub mod session;
pub mod transport;
pub mod units;

// High-level exports for easy usage
pub use config::{Config, PlannerConfig, RetryConfig, SessionConfig, TransportConfig, TransportKind};
pub use engine::{CancelToken, ExecutionEngine, JobError, JobHandle, JobReport, JobRunner};
pub use error::{NanofabError, Result};
pub use events::{ChannelObserver, ConsoleObserver, JobEvent, NoOpObserver, ProgressObserver};
pub use job::{ExposureSpec, Job, Point, ProcessParameters, Step};
pub use planner::{Plan, PlanError, PlannedCommand, Planner};
pub use session::{MachineState, Session, SessionError, SessionState};

// Core component exports for advanced usage
pub use codec::{Codec, CodecError, Command, CommandFrame, Exposure, ResponseFrame, ResponseStatus};
pub use transport::{
    SerialTransport, SimulatedTransport, SimulatorHandle, TcpTransport, Transport, TransportAdapter,
    TransportError,
};
pub use units::{Decimicron, FeedRate, Power, StagePosition};
