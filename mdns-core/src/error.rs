use std::fmt;

use mdns_proto::{MalformedMessage, WriterError};

/// Errors surfaced to a public-API caller. Everything else (malformed
/// records, name collisions, recoverable IO) is logged and handled
/// internally per the engine's recovery policy.
#[derive(Debug)]
pub enum EngineError {
    Io(std::io::Error),
    Writer(WriterError),
    Reader(MalformedMessage),
    /// A mutation was attempted on a descriptor that has already been
    /// cancelled.
    IllegalState,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Writer(err) => write!(f, "writer error: {err}"),
            Self::Reader(err) => write!(f, "reader error: {err}"),
            Self::IllegalState => write!(f, "mutation attempted on a cancelled descriptor"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<WriterError> for EngineError {
    fn from(value: WriterError) -> Self {
        Self::Writer(value)
    }
}

impl From<MalformedMessage> for EngineError {
    fn from(value: MalformedMessage) -> Self {
        Self::Reader(value)
    }
}
