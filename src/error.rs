use thiserror::Error;

/// The seven error kinds the core distinguishes. Each subsystem's doc
/// comment notes which variants it can produce.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("transient I/O error: {context}")]
    TransientIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PR is not mergeable: {0}")]
    NotMergeable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transient_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::TransientIo {
            context: context.into(),
            source,
        }
    }

    /// Whether this error kind should be swallowed and logged rather than
    /// ever propagated as fatal (see spec §7 "Never a fatal").
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TransientIo { .. } | Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {e}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Validation(format!("yaml error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(format!("http client error: {e}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Validation(format!("zip error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
