//! Error types for idmesh core operations

use thiserror::Error;

/// Main error type for idmesh core operations.
///
/// The first three variants form the store's contract with its callers:
/// `NotFound` is recoverable wherever a sensible default exists,
/// `AlreadyExists` means an insert lost a uniqueness race (usually a
/// successful no-op for the caller), and `Conflict` means the database
/// stayed busy through every retry.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Requested row is absent
    #[error("not found")]
    NotFound,

    /// Insert lost a uniqueness race
    #[error("already exists")]
    AlreadyExists,

    /// Database stayed busy/locked through the bounded retries
    #[error("database conflict in {0}")]
    Conflict(&'static str),

    /// Any other database failure
    #[error("database error in {0}: {1}")]
    Database(&'static str, rusqlite::Error),

    /// A stored blob had an impossible shape
    #[error("corrupt record: {0}")]
    Corrupt(&'static str),

    /// Wire encode/decode failure
    #[error("wire error: {0}")]
    Wire(#[from] idmesh_wire::WireError),

    /// Profile field failed validation
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// The daemon session broke down (handshake, channel, or socket)
    #[error("connection error: {0}")]
    Connection(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// True when the error is the recoverable "row absent" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound)
    }

    /// True when an insert lost a uniqueness race.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, MeshError::AlreadyExists)
    }
}

/// Result type alias using MeshError
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", MeshError::NotFound), "not found");
        assert_eq!(
            format!("{}", MeshError::Conflict("set_identity")),
            "database conflict in set_identity"
        );
    }

    #[test]
    fn test_classification_helpers() {
        assert!(MeshError::NotFound.is_not_found());
        assert!(MeshError::AlreadyExists.is_already_exists());
        assert!(!MeshError::AlreadyExists.is_not_found());
    }
}
