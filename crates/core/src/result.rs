//! Result type definition and extension traits.
//!
//! Provides combinators for Result types so callers can log and discard
//! errors without unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for document operations.
///
/// # Examples
///
/// ```ignore
/// fn load(text: &str) -> Result<Vec<Resource>> {
///     let docs = manifest::parse_yaml(text)?;
///     Ok(docs)
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing safe combinators for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding failed operation");
                None
            }
        }
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

/// Extension trait for Option types.
pub trait OptionExt<T> {
    /// Run `f` when the Option is None, returning it unchanged.
    fn tap_none<F: FnOnce()>(self, f: F) -> Self;
}

impl<T> OptionExt<T> for Option<T> {
    fn tap_none<F: FnOnce()>(self, f: F) -> Self {
        if self.is_none() {
            f();
        }
        self
    }
}
