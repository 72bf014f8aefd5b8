use std::path::PathBuf;

/// Errors from reading, merging, or persisting dataset files.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid label on line {line} of {}: {message}", path.display())]
    InvalidLabel {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Image id {0} is already in the dataset")]
    DuplicateImage(String),

    #[error("Manifest kept changing underneath the writer after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("Accumulator is no longer running")]
    AccumulatorClosed,
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
