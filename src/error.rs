use std::fmt;

/// Engine-wide error type. Every fallible operation in the crate returns
/// `EngineResult`, so callers can match on the failure kind directly.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed update pattern or unsupported pattern feature
    BadUpdate(String),
    /// A time value could not be parsed into a tree clock
    BadClock(String),
    /// Missing or invalid principal for a statutory change
    Unauthorised(String),
    /// Encoded operation exceeds the configured size cap
    OperationSizeExceeded { size: usize, max: usize },
    /// Two engines attempted to open the same dataset
    DatasetInUse(String),
    /// The dataset is non-empty but the clone was configured as genesis
    IsGenesis(String),
    /// The dataset is empty but the clone was not configured as genesis
    NotGenesis(String),
    /// Remotes are not live while a peer is required
    NoPeer(String),
    /// A request/reply exchange exceeded the network timeout
    Timeout(String),
    /// Operation issued against a closed engine
    Closed,
    /// A referenced operation or journal entry is missing
    Corruption(String),
    /// Key/value backend failure
    Storage(String),
    /// Encoding or decoding failure
    Codec(String),
    /// Configuration error at clone initialisation
    Configuration(String),
    /// Wrapped adapter-level error
    Internal(anyhow::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BadUpdate(msg) => write!(f, "Bad update: {}", msg),
            EngineError::BadClock(msg) => write!(f, "Bad clock: {}", msg),
            EngineError::Unauthorised(msg) => write!(f, "Unauthorised: {}", msg),
            EngineError::OperationSizeExceeded { size, max } => {
                write!(f, "Operation size {} exceeds configured maximum {}", size, max)
            }
            EngineError::DatasetInUse(msg) => write!(f, "Dataset in use: {}", msg),
            EngineError::IsGenesis(msg) => write!(f, "Dataset exists but clone is genesis: {}", msg),
            EngineError::NotGenesis(msg) => {
                write!(f, "Dataset is new but clone is not genesis: {}", msg)
            }
            EngineError::NoPeer(msg) => write!(f, "No live peer: {}", msg),
            EngineError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            EngineError::Closed => write!(f, "Clone engine is closed"),
            EngineError::Corruption(msg) => write!(f, "Journal corruption: {}", msg),
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
            EngineError::Codec(msg) => write!(f, "Codec error: {}", msg),
            EngineError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            EngineError::Internal(err) => write!(f, "Internal error: {}", err),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err)
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Codec(err.to_string())
    }
}

impl EngineError {
    /// Fatal errors close the engine; everything else is either retried
    /// internally or surfaced to the caller with the store unchanged.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Corruption(_) | EngineError::DatasetInUse(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
