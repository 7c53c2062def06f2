//! Error taxonomy for talking to the remote collection.

use thiserror::Error;

use crate::vcard_io::FormatError;

/// Why a write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// No version tag is known locally, so a conditional write is impossible.
    NoKnownVersion,
    /// The server rejected the `If-Match` precondition.
    RemoteChanged,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::NoKnownVersion => write!(
                f,
                "no known version; refusing to risk silently overwriting a concurrent change"
            ),
            ConflictReason::RemoteChanged => write!(
                f,
                "a newer remote version exists; re-download before retrying the upload"
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure or a non-2xx response.
    #[error("{target}: {message}")]
    Transport {
        target: String,
        status: Option<reqwest::StatusCode>,
        message: String,
    },

    /// The listing response could not be understood.
    #[error("malformed listing response: {0}")]
    Protocol(String),

    #[error("{identity}: malformed contact payload: {source}")]
    Format {
        identity: String,
        #[source]
        source: FormatError,
    },

    #[error("{identity}: conflict: {reason}")]
    Conflict {
        identity: String,
        reason: ConflictReason,
    },
}

impl SyncError {
    pub fn transport(target: impl Into<String>, err: reqwest::Error) -> Self {
        SyncError::Transport {
            target: target.into(),
            status: err.status(),
            message: err.to_string(),
        }
    }

    pub fn status(target: impl Into<String>, status: reqwest::StatusCode) -> Self {
        SyncError::Transport {
            target: target.into(),
            status: Some(status),
            message: format!("server answered {status}"),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// Short label used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport { .. } => "transport",
            SyncError::Protocol(_) => "protocol",
            SyncError::Format { .. } => "format",
            SyncError::Conflict { .. } => "conflict",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_identity_and_remedy() {
        let err = SyncError::Conflict {
            identity: "abc".into(),
            reason: ConflictReason::RemoteChanged,
        };
        let text = err.to_string();
        assert!(text.starts_with("abc: conflict"));
        assert!(text.contains("re-download"));
        assert!(err.is_conflict());
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn test_status_error_keeps_code() {
        let err = SyncError::status("abc", reqwest::StatusCode::FORBIDDEN);
        match err {
            SyncError::Transport { status, .. } => {
                assert_eq!(status, Some(reqwest::StatusCode::FORBIDDEN))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
