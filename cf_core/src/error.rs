/// Core error type for cronfleet
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not leader: {0}")]
    NotLeader(String),

    #[error("Circuit open for executor {0}")]
    CircuitOpen(String),

    #[error("Event bus error: {0}")]
    Bus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the distinguished fail-fast error produced by an open breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen(_))
    }

    /// True when an operation was routed to a follower replica
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::NotLeader(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
