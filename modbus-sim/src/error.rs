use std::time::Duration;

use thiserror::Error;

use crate::modbus::frame::FrameError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Unsupported scheme {0:?}, expected tcp://host:port")]
    UnsupportedScheme(String),

    #[error("URL {0} has no host")]
    MissingHost(url::Url),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}
