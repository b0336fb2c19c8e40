use std::time::Duration;

use thiserror::Error;

/// Reasons a location fix could not be obtained. All of them are transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FixError {
    /// No fix arrived before the deadline.
    #[error("no fix within {0:?}")]
    Timeout(Duration),

    /// The provider refused the subscription.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Errors returned by scheduler registration calls.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A one-shot spec was passed where a recurring one is required.
    #[error("job {0} has no period")]
    NotPeriodic(String),

    /// A recurring spec with a zero period.
    #[error("job {0} has a zero period")]
    ZeroInterval(String),

    /// Registry persistence failed.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
