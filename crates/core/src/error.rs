use crate::dialect::DialectError;
use crate::executor::ExecutionError;
use crate::shrine::ShrineError;

#[derive(Debug, thiserror::Error)]
pub enum LeafError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid query: {0}")]
    Validation(String),
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Shrine(#[from] ShrineError),
    #[error("invalid text: {0}")]
    Text(#[from] leaf_types::TextError),
    #[error("invalid certificate: {0}")]
    Certificate(String),
    #[error("query cannot be federated: {0}")]
    NotFederatable(String),
    #[error("persistence store failed: {0}")]
    Storage(String),

    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize JSON: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize JSON: {0}")]
    Deserialization(serde_json::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),
}

pub type LeafResult<T> = std::result::Result<T, LeafError>;
