use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("backend unavailable: {source}")]
    BackendUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("lock {name:?} is not held by this token")]
    NotHeld { name: String },

    #[error("invalid lease config: {reason}")]
    InvalidConfig { reason: String },

    #[error("renewal scheduler is already running")]
    SchedulerRunning,

    #[error("lock {name:?} is held by another owner")]
    Contended { name: String },

    #[error("lease {name:?} was lost while the critical section was running")]
    LeaseLost { name: String },

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
