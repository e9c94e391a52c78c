use thiserror::Error;

/// Errors surfaced by the span identity layer.
///
/// Codec failures always use the single [`Error::InvalidEncoding`] variant,
/// whatever the underlying parse problem was. The wire format has gone
/// through several generations and the error contract must stay stable
/// across them, so malformed input is never decomposed into sub-reasons.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The encoded span identity is malformed, truncated, forged, or from
    /// an incompatible id space.
    #[error("invalid span identity encoding")]
    InvalidEncoding,

    /// The operation requires an identity field that is absent.
    #[error("span identity is missing required field: {0}")]
    MissingRequiredField(&'static str),

    /// Propagation data was present but did not yield an addressable
    /// native parent.
    #[error("cannot resolve parent: {0}")]
    UnresolvedParent(&'static str),
}

/// A convenient alias for identity operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
