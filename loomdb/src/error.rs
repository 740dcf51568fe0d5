use std::fmt;
use thiserror::Error;

/// A single constraint violation found while validating a record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Violation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation collected for one Insert/Update, in field slug order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(field, message));
    }

    /// Whether any violation was reported against `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", lines.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum LoomError {
    #[error("Schema conflict: slug '{slug}' already exists")]
    SchemaConflict { slug: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Action failed: {0}")]
    ActionFailure(String),

    #[error("Invalid schedule '{expression}': {message}")]
    ScheduleParse { expression: String, message: String },

    #[error("Invalid query `{query}`: {message}")]
    InvalidQuery { query: String, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl LoomError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        LoomError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// The violations carried by a `Validation` error, empty for other kinds.
    pub fn violations(&self) -> &[Violation] {
        match self {
            LoomError::Validation(errors) => &errors.violations,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;
