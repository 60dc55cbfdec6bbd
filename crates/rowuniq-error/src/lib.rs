use thiserror::Error;

/// Primary error type for RowUniq operations.
///
/// Structured variants for the failure modes of the accumulate → spill →
/// merge → extract pipeline, with enough context to map each error onto the
/// host engine's diagnostic catalogue. The collector itself never produces
/// user-facing messages.
#[derive(Error, Debug)]
pub enum DedupError {
    /// An in-memory structure could not grow: a set element, the run
    /// directory, the fast-path output buffer, or the merge work buffer.
    ///
    /// Non-fatal during accumulation; the caller may retry the insert or
    /// extract what has been collected so far.
    #[error("out of memory allocating {what} ({bytes} bytes)")]
    OutOfMemory { what: &'static str, bytes: usize },

    /// I/O failure while creating the spill file or appending a sorted run.
    #[error("spill write failed: {source}")]
    SpillWrite { source: std::io::Error },

    /// I/O or bookkeeping failure inside run reduction or the final merge.
    #[error("merge failed: {source}")]
    Merge { source: std::io::Error },

    /// Operation attempted in a phase that does not permit it, e.g. `put`
    /// after extraction or a second `extract_into`.
    #[error("{operation} is not valid in the {phase} phase")]
    InvalidPhase {
        operation: &'static str,
        phase: &'static str,
    },

    /// Construction argument rejected.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// A key passed to `put` does not have the declared fixed width.
    #[error("key width mismatch: got {got} bytes, expected {expected}")]
    KeyWidthMismatch { got: usize, expected: usize },

    /// I/O error from a collaborator surface (e.g. a sink's backing stream).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`DedupError`], mirroring the failure taxonomy
/// the surrounding executor dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Memory could not be allocated.
    Allocation,
    /// Writing a run to the spill file failed.
    SpillWrite,
    /// Run reduction or the final merge failed.
    Merge,
    /// Lifecycle violation.
    InvalidPhase,
    /// Bad construction or call argument.
    InvalidArgument,
    /// Collaborator I/O failure.
    Io,
}

impl DedupError {
    /// Map this error to its coarse kind.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } => ErrorKind::Allocation,
            Self::SpillWrite { .. } => ErrorKind::SpillWrite,
            Self::Merge { .. } => ErrorKind::Merge,
            Self::InvalidPhase { .. } => ErrorKind::InvalidPhase,
            Self::InvalidArgument { .. } | Self::KeyWidthMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the operation may be retried against the same collector.
    ///
    /// Allocation failures during accumulation leave the collector usable;
    /// everything else either poisons it or indicates a caller bug.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Whether this error, raised during extraction, poisons the collector.
    ///
    /// Phase and argument errors are rejected up front and leave the state
    /// machine untouched.
    pub const fn is_poisoning(&self) -> bool {
        !matches!(
            self,
            Self::InvalidPhase { .. } | Self::InvalidArgument { .. } | Self::KeyWidthMismatch { .. }
        )
    }

    /// Create an allocation failure for `what`.
    pub const fn oom(what: &'static str, bytes: usize) -> Self {
        Self::OutOfMemory { what, bytes }
    }

    /// Create a spill-write failure from an I/O error.
    pub fn spill_write(source: std::io::Error) -> Self {
        Self::SpillWrite { source }
    }

    /// Create a merge failure from an I/O error.
    pub fn merge(source: std::io::Error) -> Self {
        Self::Merge { source }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }
}

/// Result type alias using [`DedupError`].
pub type Result<T> = std::result::Result<T, DedupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = DedupError::oom("output buffer", 4096);
        assert_eq!(err.to_string(), "out of memory allocating output buffer (4096 bytes)");

        let err = DedupError::KeyWidthMismatch { got: 7, expected: 8 };
        assert_eq!(err.to_string(), "key width mismatch: got 7 bytes, expected 8");

        let err = DedupError::InvalidPhase {
            operation: "put",
            phase: "extracted",
        };
        assert_eq!(err.to_string(), "put is not valid in the extracted phase");
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(DedupError::oom("x", 1).kind(), ErrorKind::Allocation);
        assert_eq!(
            DedupError::spill_write(std::io::Error::other("disk full")).kind(),
            ErrorKind::SpillWrite
        );
        assert_eq!(
            DedupError::merge(std::io::Error::other("short read")).kind(),
            ErrorKind::Merge
        );
        assert_eq!(
            DedupError::invalid_argument("key width must be nonzero").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            DedupError::KeyWidthMismatch { got: 0, expected: 4 }.kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn retryable_and_poisoning() {
        assert!(DedupError::oom("node", 32).is_retryable());
        assert!(!DedupError::merge(std::io::Error::other("eio")).is_retryable());

        assert!(DedupError::merge(std::io::Error::other("eio")).is_poisoning());
        assert!(DedupError::oom("work buffer", 1).is_poisoning());
        assert!(!DedupError::InvalidPhase {
            operation: "extract_into",
            phase: "extracted",
        }
        .is_poisoning());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DedupError = io_err.into();
        assert!(matches!(err, DedupError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
