use serde::Serialize;
use thiserror::Error;

/// Broad class of a failure, used by request layers to pick a response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Policy,
    Resource,
    Internal,
}

/// Reason code attached to a command-policy rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyCode {
    CommandNotAllowed,
    DangerousCommand,
}

impl PolicyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyCode::CommandNotAllowed => "command-not-allowed",
            PolicyCode::DangerousCommand => "dangerous-command",
        }
    }
}

impl std::fmt::Display for PolicyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GridError {
    #[error("invalid request: {0}")]
    Invalid(String),

    // Deliberately detail-free: missing session, missing token and mismatch look the same.
    #[error("forbidden")]
    Forbidden,

    #[error("command rejected by policy ({code})")]
    Policy {
        code: PolicyCode,
        pattern: Option<&'static str>,
    },

    #[error("session {0} is not running")]
    NotRunning(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("multiplexer error: {0}")]
    Multiplexer(String),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::Invalid(_) | GridError::Layout(_) => ErrorKind::Validation,
            GridError::Forbidden => ErrorKind::Authorization,
            GridError::Policy { .. } => ErrorKind::Policy,
            GridError::NotRunning(_)
            | GridError::NotFound(_)
            | GridError::Launch(_)
            | GridError::Multiplexer(_) => ErrorKind::Resource,
            GridError::Persist(_) | GridError::Config(_) | GridError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Identifier of the dangerous pattern that matched, for trusted callers only.
    pub fn policy_pattern(&self) -> Option<&'static str> {
        match self {
            GridError::Policy { pattern, .. } => *pattern,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::Persist(err.to_string())
    }
}

impl From<serde_yaml::Error> for GridError {
    fn from(err: serde_yaml::Error) -> Self {
        GridError::Config(err.to_string())
    }
}

impl From<GridError> for String {
    fn from(error: GridError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_error_display_hides_pattern() {
        let err = GridError::Policy {
            code: PolicyCode::DangerousCommand,
            pattern: Some("recursive-root-delete"),
        };
        let shown = err.to_string();
        assert_eq!(shown, "command rejected by policy (dangerous-command)");
        assert!(!shown.contains("recursive"));
        assert_eq!(err.policy_pattern(), Some("recursive-root-delete"));
        assert_eq!(err.kind(), ErrorKind::Policy);
    }

    #[test]
    fn forbidden_carries_no_detail() {
        assert_eq!(GridError::Forbidden.to_string(), "forbidden");
        assert_eq!(GridError::Forbidden.kind(), ErrorKind::Authorization);
    }
}
