use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Bootstrap failed for instance {instance}: {reason}")]
    Bootstrap { instance: String, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Object store error: {0}")]
    Store(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether retrying the same operation on a later cycle can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::Queue(_) | FleetError::Store(_) | FleetError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
