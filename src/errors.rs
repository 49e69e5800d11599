use miette::Diagnostic;
use thiserror::Error;

/// Top-level error for startup and CLI paths. Domain modules carry their
/// own error enums; this one collects whatever can abort the process.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(gatehouse::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(gatehouse::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(gatehouse::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(gatehouse::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Repository error: {0}")]
    #[diagnostic(code(gatehouse::repository))]
    Repository(#[from] crate::repository::RepositoryError),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(gatehouse::bad_config))]
    BadConfig(String),

    #[error("{0}")]
    #[diagnostic(code(gatehouse::other))]
    Other(String),
}
