//! Error types for producer-side resource exhaustion.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("no free writer ids")]
    NoFreeWriterIds,
}

pub type Result<T> = std::result::Result<T, Error>;
