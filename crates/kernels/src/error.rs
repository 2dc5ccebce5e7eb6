//! Error taxonomy shared by every gemmtune crate.
//!
//! Failures split into two families. [`Fatal`] errors unwind the whole
//! search: they signal a bad configuration or a broken internal invariant.
//! [`Recoverable`] errors are local to one candidate: the search driver
//! absorbs them and moves on to the next point on the front.

use thiserror::Error;

/// Errors that terminate a search.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fatal {
    /// Malformed or contradictory input: constraint strings, geometry,
    /// aliased device buffers.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal invariant was broken.
    #[error("internal logic error: {0}")]
    Logic(String),
}

/// Errors confined to a single candidate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Recoverable {
    /// The capability oracle rejected the candidate for this device.
    #[error("device capability failure: {0}")]
    Capability(String),

    /// The device ran out of resources while enqueueing the candidate.
    #[error("device resource failure: {0}")]
    Resource(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TuneError {
    #[error(transparent)]
    Fatal(#[from] Fatal),

    #[error(transparent)]
    Recoverable(#[from] Recoverable),
}

impl TuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        Fatal::Configuration(msg.into()).into()
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Fatal::Logic(msg.into()).into()
    }

    pub fn capability(msg: impl Into<String>) -> Self {
        Recoverable::Capability(msg.into()).into()
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Recoverable::Resource(msg.into()).into()
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TuneError::Fatal(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, TuneError::Fatal(Fatal::Configuration(_)))
    }

    pub fn is_logic(&self) -> bool {
        matches!(self, TuneError::Fatal(Fatal::Logic(_)))
    }
}

pub type Result<T> = std::result::Result<T, TuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        assert!(TuneError::config("x").is_fatal());
        assert!(TuneError::config("x").is_configuration());
        assert!(TuneError::logic("x").is_logic());
        assert!(!TuneError::capability("x").is_fatal());
        assert!(!TuneError::resource("x").is_fatal());
    }

    #[test]
    fn test_error_display_is_transparent() {
        let err = TuneError::resource("queue exhausted");
        assert_eq!(err.to_string(), "device resource failure: queue exhausted");
    }
}
