use thiserror::Error;

/// Why the policy plugin rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyReason {
    /// Pre-mutation admission check failed (create/connect denied).
    Other,
    /// Post-update verification failed.
    NoAccess,
    /// The mutation applied but the read policy filtered the result out.
    CannotReadBack,
}

impl std::fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyReason::Other => "OTHER",
            PolicyReason::NoAccess => "NO_ACCESS",
            PolicyReason::CannotReadBack => "CANNOT_READ_BACK",
        };
        write!(f, "{}", name)
    }
}

/// One validation failure, with the JSON path that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Engine errors.
///
/// All operations return this type so that callers handle one taxonomy across
/// both backends. `Query` wraps driver-level failures and carries the rendered
/// SQL when available for diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    /// Client arguments failed shape validation; raised before any SQL runs.
    #[error("invalid arguments for {model}.{operation}: {}", format_issues(issues))]
    InputValidation {
        model: String,
        operation: String,
        issues: Vec<ValidationIssue>,
    },

    /// `*OrThrow` variants and single-row mutations when no row matched.
    #[error("no {model} record matched the given filter")]
    NotFound { model: String },

    /// The backend refused the statement (constraint violation, connection
    /// drop, malformed SQL).
    #[error("query failed: {message}")]
    Query {
        message: String,
        sql: Option<String>,
    },

    /// An access policy rejected the operation.
    #[error("operation on {model} rejected by policy ({reason})")]
    RejectedByPolicy { model: String, reason: PolicyReason },

    /// Engine invariant violation; a bug, not a caller mistake.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation not supported by the active backend.
    #[error("not supported: {0}")]
    Unsupported(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn validation(
        model: impl Into<String>,
        operation: impl Into<String>,
        issues: Vec<ValidationIssue>,
    ) -> Self {
        Self::InputValidation {
            model: model.into(),
            operation: operation.into(),
            issues,
        }
    }

    pub fn not_found(model: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    pub fn rejected(model: impl Into<String>, reason: PolicyReason) -> Self {
        Self::RejectedByPolicy {
            model: model.into(),
            reason,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Attach the rendered SQL to a driver failure, keeping other variants.
    pub fn with_sql(self, sql: &str) -> Self {
        match self {
            Self::Query { message, sql: None } => Self::Query {
                message,
                sql: Some(sql.to_string()),
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
