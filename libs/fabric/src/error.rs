use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("{0} timeout exceeded")]
    Timeout(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True when the connection can no longer carry frames
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
