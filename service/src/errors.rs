//! Error kinds surfaced at the service API boundary.
//!
//! Requests carrying malformed input or hitting resource exhaustion are
//! rejected here; nothing that happens after a session exists turns into
//! an error for the caller (malformed chunks, timeouts and disconnects
//! degrade into stats instead).

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid trace config: {0}")]
    InvalidConfig(String),
    #[error("no free buffer ids")]
    NoFreeBuffers,
    #[error("consumer already owns a tracing session")]
    SessionAlreadyActive,
    #[error("no tracing session for this consumer")]
    SessionNotFound,
    #[error("session is not in a state that allows {0}")]
    InvalidStateTransition(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
