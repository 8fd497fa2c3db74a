use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Save error: {0}")]
    Save(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;
