//! Crate-wide error enum (§7, §10.5).
//!
//! Every error kind named in the error-handling table is a variant here.
//! `NotLeader` is deliberately absent: a write on a follower is encoded as
//! an HTTP 308 redirect before any `OpenStateError` is ever constructed
//! (see `http.rs`), matching the spec's "not an error to client" note.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpenStateError>;

#[derive(Error, Debug)]
pub enum OpenStateError {
    #[error("definition conflict: event '{event}' maps src '{src}' to both '{first}' and '{second}'")]
    DefinitionConflict {
        event: String,
        src: String,
        first: String,
        second: String,
    },

    #[error("no such definition: {0}")]
    DefinitionNotFound(String),

    #[error("no such instance: {0}")]
    InstanceNotFound(String),

    #[error("FSM cannot {0}")]
    EventNotAllowed(String),

    #[error("event '{0}' raced with a concurrent transition")]
    EventRaced(String),

    #[error("callback failed: {0}")]
    CallbackFailed(String),

    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("raft apply timed out after {0:?}")]
    RaftTimeout(std::time::Duration),

    #[error("raft error: {0}")]
    Raft(String),

    #[error("log entry corrupt: unknown message tag {0}")]
    LogCorrupt(u8),

    #[error("membership reconciliation error: {0}")]
    Membership(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("request body error: {0}")]
    Decode(String),
}

impl OpenStateError {
    /// Maps this error onto an HTTP status code for `http.rs`'s response
    /// encoding. `NotLeader` has no variant here because it never reaches
    /// this path — it's handled as a redirect before the request is decoded.
    /// Every variant that does reach this path maps to 500 (§4.6's "surfaced
    /// as a 500 with the error's text"); this crate draws no distinction by
    /// error kind beyond the redirect.
    pub fn status_code(&self) -> u16 {
        500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_500() {
        assert_eq!(
            OpenStateError::DefinitionNotFound("traffic".into()).status_code(),
            500
        );
        assert_eq!(
            OpenStateError::InstanceNotFound("traffic-1".into()).status_code(),
            500
        );
    }

    #[test]
    fn event_not_allowed_maps_to_500() {
        assert_eq!(
            OpenStateError::EventNotAllowed("turn_red".into()).status_code(),
            500
        );
    }

    #[test]
    fn raft_timeout_maps_to_500() {
        assert_eq!(
            OpenStateError::RaftTimeout(std::time::Duration::from_secs(30)).status_code(),
            500
        );
    }

    #[test]
    fn log_corrupt_maps_to_500() {
        assert_eq!(OpenStateError::LogCorrupt(9).status_code(), 500);
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = OpenStateError::EventNotAllowed("turn_green".into());
        assert_eq!(err.to_string(), "FSM cannot turn_green");
    }
}
