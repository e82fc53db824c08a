//! Error types for the tutor core library

use thiserror::Error;

/// Core error type for coordinator operations
#[derive(Error, Debug)]
pub enum TutorError {
    /// Missing key, or missing parent in the key hierarchy
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create of a key that is already present
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stale revision on compare-and-update
    #[error("Revision conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        /// Key being updated
        key: String,
        /// Revision the caller read
        expected: u64,
        /// Revision currently stored
        actual: u64,
    },

    /// Chunk sequence does not continue the episode
    #[error("Out of order chunk for episode {episode}: expected sequence {expected}, got {actual}")]
    OutOfOrder {
        /// Episode key
        episode: String,
        /// Next sequence the episode accepts
        expected: u64,
        /// Sequence the client sent
        actual: u64,
    },

    /// Operation against an entity in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Snapshot ancestor edge would close a cycle
    #[error("Cyclic lineage: snapshot {snapshot} is already an ancestor of {ancestor}")]
    CyclicLineage {
        /// Snapshot being created
        snapshot: String,
        /// Requested ancestor that descends from it
        ancestor: String,
    },

    /// Assignment lease is gone; in-flight work must be discarded
    #[error("Lease expired for assignment {0}")]
    LeaseExpired(String),

    /// Progress report went backwards
    #[error("Progress regression on {field}: previous {previous}, reported {reported}")]
    ProgressRegression {
        /// Name of the monotonic field
        field: &'static str,
        /// Stored value
        previous: String,
        /// Rejected value
        reported: String,
    },

    /// Malformed input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TutorError {
    /// Whether re-reading and reapplying the operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether the error means the key (or its parent) is absent
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, TutorError>;
