use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Unknown server id: {0}")]
    UnknownServerId(String),

    #[error("Invalid server state: {0}")]
    InvalidServerState(String),

    #[error("Missing file: {0}")]
    MissingFile(String),

    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Wrapper process error: {0}")]
    WrapperProcess(String),

    #[error("Update error: {0}")]
    Update(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::File(err.to_string())
    }
}
