// ABOUTME: Typed errors for the fetch and verify pipelines
// ABOUTME: Covers the failures callers branch on; everything else travels as anyhow::Error

use thiserror::Error;

/// Errors that callers inspect rather than just propagate.
#[derive(Debug, Error)]
pub enum MoltError {
    /// A component that needs a specific dialect was handed another one.
    #[error("expected {expected} connection, got {actual}")]
    WrongDialect {
        expected: &'static str,
        actual: String,
    },

    /// A bulk-load statement failed on a single isolated file.
    #[error("error importing {file}: {message}")]
    Import {
        file: String,
        sql_state: Option<String>,
        command: String,
        message: String,
    },

    /// Two datums of unrelated type families were compared.
    #[error("cannot compare {left} with {right}")]
    Incomparable { left: String, right: String },

    /// Continuation inputs could not be resolved to something resumable.
    #[error("cannot resume: {0}")]
    Continuation(String),

    /// Invalid flag or config file combination.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Dig the Postgres SQLSTATE code out of an error chain, if there is one.
pub fn sql_state(err: &anyhow::Error) -> Option<String> {
    for cause in err.chain() {
        if let Some(pg) = cause.downcast_ref::<tokio_postgres::Error>() {
            if let Some(code) = pg.code() {
                return Some(code.code().to_string());
            }
        }
        if let Some(MoltError::Import {
            sql_state: Some(state),
            ..
        }) = cause.downcast_ref::<MoltError>()
        {
            return Some(state.clone());
        }
    }
    None
}
