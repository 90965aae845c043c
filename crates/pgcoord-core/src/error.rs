//! Error taxonomy shared by the catalog, registry, transports and direct mode.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by every coordination operation.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The database or RPC endpoint cannot be reached (auth failure, DNS, timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// Lookup against an unregistered node or database.
    #[error("{0}")]
    NotFound(String),

    /// Malformed input, rejected before reaching the catalog.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation invoked from the wrong database context.
    #[error("{0}")]
    Privilege(String),

    /// The catalog rejected or could not complete a read or write.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The caller's deadline elapsed before the operation completed.
    #[error("deadline exceeded after {}ms", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    /// Builds the canonical "not found" error for a node id.
    pub fn node_not_found(node_id: &str) -> Self {
        CoordError::NotFound(format!("node '{}' not found", node_id))
    }

    /// Stable error code used on the IPC and RPC wire.
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::Connection(_) => "NOT_CONNECTED",
            CoordError::NotFound(_) => "NODE_NOT_FOUND",
            CoordError::Validation(_) | CoordError::Config(_) => "INVALID_REQUEST",
            CoordError::Privilege(_) => "PERMISSION_DENIED",
            CoordError::Catalog(_) => "CATALOG_ERROR",
            CoordError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            CoordError::Io(_) | CoordError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Rebuilds an error from its wire code and message.
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "NOT_CONNECTED" => CoordError::Connection(message),
            "NODE_NOT_FOUND" => CoordError::NotFound(message),
            "INVALID_REQUEST" => CoordError::Validation(message),
            "PERMISSION_DENIED" => CoordError::Privilege(message),
            "CATALOG_ERROR" => CoordError::Catalog(message),
            "DEADLINE_EXCEEDED" => CoordError::DeadlineExceeded(Duration::ZERO),
            _ => CoordError::Internal(message),
        }
    }

    /// True when the service itself cannot function, so transports must fail
    /// the call instead of folding it into a structured response.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CoordError::Connection(_) | CoordError::DeadlineExceeded(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NotFound(_))
    }
}

/// Classifies a driver error into the taxonomy.
///
/// Errors reported by the server (SQLSTATE present) are catalog-level, anything
/// else means the session is unusable.
pub(crate) fn classify_postgres_error(e: &postgres::Error) -> CoordError {
    let msg = format_postgres_error(e);
    match e.as_db_error() {
        Some(db_error) => {
            let code = db_error.code().code();
            // 28xxx: invalid authorization, 3D000: database does not exist,
            // 57P0x: server shutting down / cannot connect now.
            if code.starts_with("28") || code == "3D000" || code.starts_with("57P0") {
                CoordError::Connection(msg)
            } else {
                CoordError::Catalog(msg)
            }
        }
        None => CoordError::Connection(msg),
    }
}

/// Formats PostgreSQL error message for display.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("timed out") {
            "connection timed out".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_is_recognizable() {
        let err = CoordError::node_not_found("n9");
        assert!(err.to_string().contains("not found"));
        assert!(err.is_not_found());
        assert_eq!(err.code(), "NODE_NOT_FOUND");
    }

    #[test]
    fn only_connection_and_deadline_are_unavailable() {
        assert!(CoordError::Connection("refused".into()).is_unavailable());
        assert!(CoordError::DeadlineExceeded(Duration::from_millis(5)).is_unavailable());
        assert!(!CoordError::Catalog("check violation".into()).is_unavailable());
        assert!(!CoordError::node_not_found("x").is_unavailable());
        assert!(!CoordError::Validation("bad".into()).is_unavailable());
    }

    #[test]
    fn wire_code_round_trips_the_kind() {
        let err = CoordError::from_code("PERMISSION_DENIED", "must be called from postgres".into());
        assert!(matches!(err, CoordError::Privilege(_)));
        let err = CoordError::from_code("NODE_NOT_FOUND", "node 'a' not found".into());
        assert!(err.is_not_found());
        let err = CoordError::from_code("SOMETHING_NEW", "?".into());
        assert!(matches!(err, CoordError::Internal(_)));
    }
}
