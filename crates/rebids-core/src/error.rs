//! Error types and handling for bidsmap matching and resolution

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for bidsmap matching and resolution operations
#[derive(Debug, Error)]
pub enum BidsError {
    /// Malformed bidsmap entry, bad pattern spec, duplicate participant
    /// entries, or participants table / sidecar schema mismatch
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A dynamic field template references an attribute, table column or
    /// BIDS label that cannot be found
    #[error("Resolution error in '{template}': placeholder '{placeholder}' at byte {position}: {message}")]
    Resolution {
        template: String,
        placeholder: String,
        position: usize,
        message: String,
    },

    /// More than one run matched a recording under a strict policy
    #[error("Ambiguous match for '{recording}': {first} also matched by {extra}")]
    Ambiguous {
        recording: String,
        first: String,
        extra: String,
    },

    /// No run matched; the destination cannot be named
    #[error("No run matches recording '{recording}'")]
    NoMatch { recording: String },

    /// The same subject resolved to differing accumulated field values
    /// across sessions without the allow-conflicts opt-in
    #[error("Subject '{subject}' has conflicting value for '{field}': '{old}' vs '{new}'")]
    SubjectConflict {
        subject: String,
        field: String,
        old: String,
        new: String,
    },

    /// File system I/O errors
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error kind enumeration for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Ambiguous,
    NoMatch,
    SubjectConflict,
    Io,
}

impl ErrorKind {
    /// Base process exit code for this error class. A workflow exits
    /// with this code when an error of the class terminates the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Configuration => 10,
            ErrorKind::Resolution => 20,
            ErrorKind::NoMatch => 30,
            ErrorKind::SubjectConflict => 40,
            ErrorKind::Ambiguous => 50,
            ErrorKind::Io => 60,
        }
    }
}

impl BidsError {
    /// Get the error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BidsError::Configuration { .. } => ErrorKind::Configuration,
            BidsError::Resolution { .. } => ErrorKind::Resolution,
            BidsError::Ambiguous { .. } => ErrorKind::Ambiguous,
            BidsError::NoMatch { .. } => ErrorKind::NoMatch,
            BidsError::SubjectConflict { .. } => ErrorKind::SubjectConflict,
            BidsError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Check if this error is recoverable (the workflow may skip the
    /// current recording and continue)
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NoMatch | ErrorKind::Resolution)
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a resolution error pointing at a placeholder
    pub fn resolution(
        template: impl Into<String>,
        placeholder: impl Into<String>,
        position: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            template: template.into(),
            placeholder: placeholder.into(),
            position,
            message: message.into(),
        }
    }

    /// Create a no-match error
    pub fn no_match(recording: impl Into<String>) -> Self {
        Self::NoMatch {
            recording: recording.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<std::io::Error> for BidsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}
