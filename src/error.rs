use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("no data queued")]
    NoData,

    #[error("no space for data")]
    NoSpace,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn device(msg: impl Into<String>) -> Self {
        Error::Device(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}
