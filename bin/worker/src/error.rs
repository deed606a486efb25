//! Worker startup errors.
//!
//! Errors are designed for layered context using rootcause:
//! - Adapters return plain errors from the library seam traits
//! - Startup wraps them in [`WorkerError`] and returns a `Report`

use std::fmt;

/// Errors that stop the worker from starting or keep a consumer from running.
#[derive(Debug)]
pub enum WorkerError {
    /// Configuration could not be loaded.
    Config { message: String },
    /// NATS stream or consumer setup failed.
    Nats { message: String },
    /// Database connection or migration failed.
    Database { message: String },
    /// A workflow graph file could not be read or parsed.
    Graphs { path: String, message: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => write!(f, "invalid configuration: {message}"),
            Self::Nats { message } => write!(f, "NATS setup failed: {message}"),
            Self::Database { message } => write!(f, "database setup failed: {message}"),
            Self::Graphs { path, message } => {
                write!(f, "failed to load workflow graph {path}: {message}")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<config::ConfigError> for WorkerError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_names_the_file() {
        let err = WorkerError::Graphs {
            path: "flows/welcome.json".to_string(),
            message: "expected value".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to load workflow graph flows/welcome.json: expected value"
        );
    }

    #[test]
    fn database_error_display() {
        let err = WorkerError::Database {
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "database setup failed: connection refused");
    }

    #[test]
    fn config_errors_convert() {
        let err: WorkerError = config::ConfigError::Message("bad port".to_string()).into();
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
