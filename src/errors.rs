//! Typed error hierarchy for the YokeFlow engine.
//!
//! One enum covers the whole engine; every variant maps to a stable wire
//! `kind` that clients and agents can match on. Storage errors additionally
//! carry a recoverability flag consumed by the store's retry policy.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type YokeResult<T> = Result<T, YokeError>;

/// Engine-wide error taxonomy.
#[derive(Debug, Error)]
pub enum YokeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quality violation: {0}")]
    QualityViolation(String),

    #[error("blocked command ({rule}): {command}")]
    BlockedCommand { command: String, rule: String },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("storage error: {message}")]
    Storage { message: String, recoverable: bool },

    #[error("transient external error: {0}")]
    TransientExternal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl YokeError {
    /// Stable wire name for this error, per the RPC error-frame contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::QualityViolation(_) => "quality_violation",
            Self::BlockedCommand { .. } => "blocked_command",
            Self::Sandbox(_) => "sandbox_error",
            Self::Storage { .. } => "storage_error",
            Self::TransientExternal(_) => "transient_external",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the store may retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage { recoverable, .. } => *recoverable,
            Self::TransientExternal(_) => true,
            _ => false,
        }
    }

    /// Shorthand for a not-found error with a displayable id.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// CLI exit code: 1 for user errors, 2 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::NotFound { .. } | Self::Conflict(_) => 1,
            _ => 2,
        }
    }
}

/// Message fragments that mark a storage failure as worth retrying.
///
/// Covers SQLite lock/busy states, pool exhaustion, serialization conflicts,
/// and the transport-level failures a connection pool can hit.
pub const RECOVERABLE_STORAGE_PATTERNS: &[&str] = &[
    "database is locked",
    "database table is locked",
    "database is busy",
    "database schema has changed",
    "locking protocol",
    "busy_snapshot",
    "busy_recovery",
    "busy_timeout",
    "cannot commit transaction",
    "cannot rollback",
    "deadlock",
    "serialization failure",
    "snapshot isolation",
    "pool timed out",
    "pool closed",
    "connection closed",
    "connection reset",
    "connection refused",
    "broken pipe",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "resource busy",
    "try again",
    "interrupted",
    "disk i/o error",
];

/// Classify a raw sqlx failure into the engine taxonomy.
pub fn classify_storage_error(err: &sqlx::Error) -> YokeError {
    let recoverable = match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            RECOVERABLE_STORAGE_PATTERNS.iter().any(|p| msg.contains(p))
        }
        _ => {
            let msg = err.to_string().to_lowercase();
            RECOVERABLE_STORAGE_PATTERNS.iter().any(|p| msg.contains(p))
        }
    };
    YokeError::Storage {
        message: err.to_string(),
        recoverable,
    }
}

impl From<sqlx::Error> for YokeError {
    fn from(err: sqlx::Error) -> Self {
        classify_storage_error(&err)
    }
}

impl From<serde_json::Error> for YokeError {
    fn from(err: serde_json::Error) -> Self {
        YokeError::Internal(format!("json encoding failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_wire_names() {
        assert_eq!(YokeError::Validation("x".into()).kind(), "validation");
        assert_eq!(YokeError::not_found("project", "p1").kind(), "not_found");
        assert_eq!(YokeError::Conflict("dup".into()).kind(), "conflict");
        assert_eq!(
            YokeError::QualityViolation("untested".into()).kind(),
            "quality_violation"
        );
        assert_eq!(
            YokeError::BlockedCommand {
                command: "sudo rm".into(),
                rule: "privilege_escalation".into()
            }
            .kind(),
            "blocked_command"
        );
        assert_eq!(YokeError::Sandbox("gone".into()).kind(), "sandbox_error");
        assert_eq!(
            YokeError::Storage {
                message: "locked".into(),
                recoverable: true
            }
            .kind(),
            "storage_error"
        );
        assert_eq!(YokeError::Internal("bug".into()).kind(), "internal");
    }

    #[test]
    fn not_found_message_carries_entity_and_id() {
        let err = YokeError::not_found("session", "abc-123");
        assert_eq!(err.to_string(), "session abc-123 not found");
    }

    #[test]
    fn recoverability_follows_storage_flag() {
        assert!(
            YokeError::Storage {
                message: "database is locked".into(),
                recoverable: true
            }
            .is_recoverable()
        );
        assert!(
            !YokeError::Storage {
                message: "no such table: projects".into(),
                recoverable: false
            }
            .is_recoverable()
        );
        assert!(YokeError::TransientExternal("llm 529".into()).is_recoverable());
        assert!(!YokeError::Validation("bad name".into()).is_recoverable());
    }

    #[test]
    fn exit_codes_split_user_and_internal_errors() {
        assert_eq!(YokeError::Validation("x".into()).exit_code(), 1);
        assert_eq!(YokeError::not_found("project", "p").exit_code(), 1);
        assert_eq!(YokeError::Conflict("running".into()).exit_code(), 1);
        assert_eq!(YokeError::Internal("bug".into()).exit_code(), 2);
        assert_eq!(
            YokeError::Storage {
                message: "io".into(),
                recoverable: false
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn classify_pool_errors_as_recoverable() {
        let err = classify_storage_error(&sqlx::Error::PoolTimedOut);
        assert!(err.is_recoverable());
        let err = classify_storage_error(&sqlx::Error::PoolClosed);
        assert!(err.is_recoverable());
    }

    #[test]
    fn classify_row_not_found_as_non_recoverable() {
        let err = classify_storage_error(&sqlx::Error::RowNotFound);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn recoverable_pattern_table_has_breadth() {
        // The retry policy advertises 20+ distinct recoverable categories.
        assert!(RECOVERABLE_STORAGE_PATTERNS.len() >= 20);
    }
}
