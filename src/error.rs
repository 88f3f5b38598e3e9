use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum GibbsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {file} line {line}: {reason}")]
    Parse {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("par file is missing required parameter {0}")]
    MissingParameter(String),

    #[error("no TOAs found in {0}")]
    NoToas(String),

    #[error("parameter {0} not found in parameter map")]
    UnknownParameter(String),

    #[error("parameter vector has length {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("linear algebra failure: {0}")]
    LinAlg(String),

    #[error("invalid model configuration: {0}")]
    Config(String),

    #[error("failed to write npy file: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("failed to read npy file: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot resume from {path}: {reason}")]
    Resume { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, GibbsError>;
