//! Crate-level error type for nanofab operations

use thiserror::Error;

use crate::engine::JobError;
use crate::planner::PlanError;
use crate::session::SessionError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, NanofabError>;

#[derive(Error, Debug)]
pub enum NanofabError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Job rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Frame pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
