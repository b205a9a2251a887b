use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0} id space exhausted")]
    IdSpaceExhausted(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
