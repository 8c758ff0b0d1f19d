//! Error types for quantity parsing.

use thiserror::Error;

/// Errors that can occur when parsing a quantity string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    /// The quantity string is empty.
    #[error("quantity cannot be empty")]
    Empty,

    /// The numeric portion could not be parsed.
    #[error("invalid quantity number: '{0}'")]
    InvalidNumber(String),

    /// The suffix is not a recognised unit.
    #[error("unknown quantity suffix: '{0}'")]
    UnknownSuffix(String),

    /// Negative quantities are not representable.
    #[error("quantity cannot be negative: '{0}'")]
    Negative(String),

    /// The value does not fit in 64 bits of bytes.
    #[error("quantity out of range: '{0}'")]
    Overflow(String),
}

impl QuantityError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, QuantityError::Empty)
    }
}
