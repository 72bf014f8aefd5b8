/// Errors raised while validating configuration or preparing a batch.
///
/// `Configuration` is fatal: the batch is aborted before any job runs.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
