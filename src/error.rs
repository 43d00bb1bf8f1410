use std::path::PathBuf;

use thiserror::Error;

/// Errors that may occur while setting up or running the fanout.
#[derive(Debug, Error)]
pub enum Error {
    /// The service configuration file is unreadable or invalid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// A virtual endpoint could not be cleared or allocated.
    #[error("Could not provision endpoint {id} at {path:?}. Problem: {problem}")]
    Provision {
        /// The endpoint id.
        id: u32,

        /// Where the endpoint lives (or should have lived).
        path: PathBuf,

        /// What went wrong.
        problem: String,
    },

    /// Endpoints were requested but none of them could be brought up.
    #[error("None of the requested endpoints could be provisioned")]
    NoEndpoints,

    /// The physical source could not be opened.
    #[error("Could not open source {path:?}. Problem: {problem}")]
    SourceUnavailable {
        /// Path to the physical device.
        path: PathBuf,

        /// What went wrong.
        problem: String,
    },

    /// The physical source closed or errored while running.
    #[error("Source lost: {0}")]
    SourceLost(String),

    /// A consumer tried to attach to an endpoint which does not exist.
    #[error("The endpoint `{0:?}` is not available")]
    EndpointUnavailable(PathBuf),

    /// IO related errors.
    #[error("Underlying IO problem")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Is this the error variant [`Error::Provision`]?
    pub fn is_provision(&self) -> bool {
        matches!(self, Error::Provision { .. })
    }

    /// If this is [`Error::BadConfig`], get the message.
    pub fn try_into_bad_config(self) -> Option<String> {
        match self {
            Error::BadConfig(message) => Some(message),
            _ => None,
        }
    }
}
