//! Crate-wide error type.
//!
//! Every public operation returns [`CoreResult`]. Errors are plain values —
//! nothing in this crate panics or unwinds across a component boundary in
//! non-test code.

use thiserror::Error;

/// All failure modes exposed by the core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Stream open/read/gzip decompression failure. Carries the path that
    /// was being read, if one is known.
    #[error("io error on {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed JSON, a truncated document, or an unexpected top-level
    /// shape (neither an index file nor an in-network document).
    #[error("parse error: {0}")]
    ParseError(String),

    /// `compare` referenced a source name that has not been loaded.
    #[error("missing source: {0}")]
    MissingSource(String),

    /// An operation referenced a session id that does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A part was submitted to an existing session with a rule, negotiated
    /// type, or exclude_expired flag different from the session's first
    /// part.
    #[error("session {session_id} parameter mismatch: {detail}")]
    SessionParamMismatch { session_id: String, detail: String },

    /// A part was submitted to an existing session naming a different
    /// baseline source than the session was created with.
    #[error("session {session_id} baseline changed: expected {expected}, got {actual}")]
    SessionBaselineChanged {
        session_id: String,
        expected: String,
        actual: String,
    },

    /// An unknown rule token, or a multi-valued rule (`all_classes`,
    /// `context`) passed to a scalar-only code path.
    #[error("bad rule: {0}")]
    BadRule(String),

    /// `fetch_and_ingest_url` hit an access-denied response carrying an
    /// expiration signature ("AccessDenied" / "Expired" in the body).
    #[error("expired link: {0}")]
    ExpiredLink(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::ParseError(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_includes_path() {
        let err = CoreError::IoError {
            path: "/tmp/missing.json".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "nope"),
        };
        assert!(err.to_string().contains("/tmp/missing.json"));
    }

    #[test]
    fn json_error_converts_to_parse_error() {
        let bad: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: CoreError = bad.unwrap_err().into();
        assert!(matches!(err, CoreError::ParseError(_)));
    }
}
