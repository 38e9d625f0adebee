use thiserror::Error;

/// Stable machine-readable error codes.
///
/// The repair command copies `as_str()` into its response document, so these
/// strings are part of the wire surface and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocshardErrorCode {
    ShutdownInProgress,
    DeadlineExceeded,
    Overloaded,
    VersionGapSkipped,
    InvalidArgument,
    InvalidConfig,
    TypeMismatch,
    NotPrimary,
    NotFound,
    AmbiguousMatch,
    AlreadyExists,
    DocumentMissing,
    DocumentStillExists,
    IndexMissing,
    CollectionMissing,
    IntegrityMismatch,
    Conflict,
}

impl DocshardErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DocshardErrorCode::ShutdownInProgress => "shutdown_in_progress",
            DocshardErrorCode::DeadlineExceeded => "deadline_exceeded",
            DocshardErrorCode::Overloaded => "overloaded",
            DocshardErrorCode::VersionGapSkipped => "version_gap_skipped",
            DocshardErrorCode::InvalidArgument => "invalid_argument",
            DocshardErrorCode::InvalidConfig => "invalid_config",
            DocshardErrorCode::TypeMismatch => "type_mismatch",
            DocshardErrorCode::NotPrimary => "not_primary",
            DocshardErrorCode::NotFound => "not_found",
            DocshardErrorCode::AmbiguousMatch => "ambiguous_match",
            DocshardErrorCode::AlreadyExists => "already_exists",
            DocshardErrorCode::DocumentMissing => "document_missing",
            DocshardErrorCode::DocumentStillExists => "document_still_exists",
            DocshardErrorCode::IndexMissing => "index_missing",
            DocshardErrorCode::CollectionMissing => "collection_missing",
            DocshardErrorCode::IntegrityMismatch => "integrity_mismatch",
            DocshardErrorCode::Conflict => "conflict",
        }
    }
}

/// Crate-wide error type.
///
/// Every variant is `Clone` so the coalescer can fan a single query failure
/// out to all waiters of a group verbatim.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocshardError {
    #[error("shutdown in progress: {0}")]
    ShutdownInProgress(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("coalescing group overloaded: {0}")]
    Overloaded(String),
    #[error("version gap too large: {0}")]
    VersionGapSkipped(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("not primary: cannot accept writes for '{namespace}'")]
    NotPrimary { namespace: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("ambiguous match: {message}")]
    AmbiguousMatch { message: String, match_count: usize },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("document missing: {0}")]
    DocumentMissing(String),
    #[error("document still exists: {0}")]
    DocumentStillExists(String),
    #[error("index '{index}' not found in '{namespace}'")]
    IndexMissing { namespace: String, index: String },
    #[error("collection '{namespace}' not found")]
    CollectionMissing { namespace: String },
    #[error("document integrity verification failed: {message}")]
    IntegrityMismatch { message: String },
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl DocshardError {
    pub fn code(&self) -> DocshardErrorCode {
        match self {
            DocshardError::ShutdownInProgress(_) => DocshardErrorCode::ShutdownInProgress,
            DocshardError::DeadlineExceeded(_) => DocshardErrorCode::DeadlineExceeded,
            DocshardError::Overloaded(_) => DocshardErrorCode::Overloaded,
            DocshardError::VersionGapSkipped(_) => DocshardErrorCode::VersionGapSkipped,
            DocshardError::InvalidArgument(_) => DocshardErrorCode::InvalidArgument,
            DocshardError::InvalidConfig { .. } => DocshardErrorCode::InvalidConfig,
            DocshardError::TypeMismatch { .. } => DocshardErrorCode::TypeMismatch,
            DocshardError::NotPrimary { .. } => DocshardErrorCode::NotPrimary,
            DocshardError::NotFound(_) => DocshardErrorCode::NotFound,
            DocshardError::AmbiguousMatch { .. } => DocshardErrorCode::AmbiguousMatch,
            DocshardError::AlreadyExists(_) => DocshardErrorCode::AlreadyExists,
            DocshardError::DocumentMissing(_) => DocshardErrorCode::DocumentMissing,
            DocshardError::DocumentStillExists(_) => DocshardErrorCode::DocumentStillExists,
            DocshardError::IndexMissing { .. } => DocshardErrorCode::IndexMissing,
            DocshardError::CollectionMissing { .. } => DocshardErrorCode::CollectionMissing,
            DocshardError::IntegrityMismatch { .. } => DocshardErrorCode::IntegrityMismatch,
            DocshardError::Conflict(_) => DocshardErrorCode::Conflict,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::{DocshardError, DocshardErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(DocshardErrorCode::AmbiguousMatch.as_str(), "ambiguous_match");
        assert_eq!(DocshardErrorCode::AlreadyExists.as_str(), "already_exists");
        assert_eq!(
            DocshardErrorCode::DocumentStillExists.as_str(),
            "document_still_exists"
        );
        assert_eq!(DocshardErrorCode::NotFound.as_str(), "not_found");
        assert_eq!(
            DocshardErrorCode::ShutdownInProgress.as_str(),
            "shutdown_in_progress"
        );
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = DocshardError::IndexMissing {
            namespace: "db.coll".into(),
            index: "idx_x".into(),
        };
        assert_eq!(err.code(), DocshardErrorCode::IndexMissing);
        assert_eq!(err.code_str(), "index_missing");
    }

    #[test]
    fn errors_clone_for_fan_out() {
        let err = DocshardError::Conflict("too much contention".into());
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
