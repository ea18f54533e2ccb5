//! Runtime error taxonomy
//!
//! Resources surface only `CriticalSectionAborted`, `ContextClosed`, or
//! `Io`; everything else bubbles out of `ArchetypeContext::run` as a fatal
//! run error. The runtime never translates errors into program-visible
//! values; error handling in MPCal code is modeled by explicit retries via
//! abort.

use mpcal_core::{CodecError, TypeError};

#[derive(Debug)]
pub enum RuntimeError {
    /// An operator of the value algebra failed. Fatal to the archetype.
    Type(TypeError),
    /// A wire payload failed to encode or decode. Fatal to the archetype.
    Codec(CodecError),
    /// A resource cannot honor this critical section's accesses. Recovered
    /// by aborting all touched resources and retrying from the label.
    CriticalSectionAborted,
    /// The context was closed while running. `run` returns `Ok(())`.
    ContextClosed,
    /// Permanent I/O failure in a resource. Fatal to the archetype.
    Io(std::io::Error),
    /// Read on a map resource, write on a failure detector, and the like.
    /// Fatal; a programmer bug.
    ProtocolMisuse(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn misuse(message: impl Into<String>) -> Self {
        RuntimeError::ProtocolMisuse(message.into())
    }

    /// True for the one error the scheduler recovers from by retrying.
    pub fn is_aborted(&self) -> bool {
        matches!(self, RuntimeError::CriticalSectionAborted)
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Type(e) => write!(f, "{e}"),
            RuntimeError::Codec(e) => write!(f, "{e}"),
            RuntimeError::CriticalSectionAborted => write!(f, "critical section aborted"),
            RuntimeError::ContextClosed => write!(f, "archetype context closed"),
            RuntimeError::Io(e) => write!(f, "i/o failure: {e}"),
            RuntimeError::ProtocolMisuse(msg) => write!(f, "protocol misuse: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Type(e) => Some(e),
            RuntimeError::Codec(e) => Some(e),
            RuntimeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TypeError> for RuntimeError {
    fn from(e: TypeError) -> Self {
        RuntimeError::Type(e)
    }
}

impl From<CodecError> for RuntimeError {
    fn from(e: CodecError) -> Self {
        RuntimeError::Codec(e)
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e)
    }
}
