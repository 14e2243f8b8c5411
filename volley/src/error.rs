//! Error types for profile validation and for the run itself.
use thiserror::Error;

/// A load profile that cannot be run.
///
/// Config errors are raised by [`LoadProfile::validate`](crate::config::LoadProfile::validate)
/// before anything is spawned, so a rejected profile never produces a partial run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("load profile has no executors")]
    Empty,

    #[error("executor name must not be empty")]
    EmptyName,

    #[error("duplicate executor name `{0}`")]
    DuplicateName(String),

    #[error("executor `{name}`: {reason}")]
    Invalid { name: String, reason: String },

    #[error("executor `{name}` has a malformed stage #{index}: {reason}")]
    MalformedStage {
        name: String,
        index: usize,
        reason: String,
    },

    #[error("load profile needs {required} concurrent workers but the pool ceiling is {ceiling}")]
    ConcurrencyExceedsCeiling { required: usize, ceiling: usize },

    #[error("could not parse load profile: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the scheduler and by individual executors.
///
/// Per-iteration failures never show up here: they are recorded on the
/// iteration's [`Sample`](crate::sample::Sample).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The run was stopped by its caller rather than completing on its own.
    #[error("run was cancelled")]
    Cancelled,

    #[error("executor `{executor}` could not allocate {needed} worker slots")]
    SlotsUnavailable { executor: String, needed: usize },

    #[error("executor `{executor}` panicked")]
    ExecutorPanicked { executor: String },

    #[error("scheduler has already been started")]
    AlreadyStarted,
}

/// Rejected command sent through an [`ExternalController`](crate::executor::ExternalController).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("requested {requested} vus but the executor allows at most {max}")]
    ExceedsMaxVus { requested: usize, max: usize },

    #[error("executor is no longer running")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
