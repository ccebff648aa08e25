use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    /// The persisted watermark could not be parsed. It is never replaced with "now", doing so
    /// would skip an unknown amount of history.
    #[error("Corrupt Checkpoint at {key} - {reason} (value: {value:?})")]
    CorruptCheckpoint {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Source(value.to_string())
    }
}
