//! Explicit success/failure container for operations that cross component
//! boundaries.
//!
//! Every fallible operation whose result is consumed by a collaborator
//! (session steps, client-facing status) returns an [`Outcome`] so the call
//! site is forced to branch on failure — there is no silent error path.
//! Internal plumbing keeps using `std::result::Result` with `?`; the
//! [`Outcome::into_result`] bridge converts at the boundary.
//!
//! An outcome is frozen at construction: there are no mutators, and the
//! accessors fail fast when called on the wrong side (`value()` on a failed
//! outcome is a programming error, not a recoverable condition).
//!
//! [`TranslatedOutcome`] is the variant handed to UI-facing collaborators: it
//! carries a user-facing message string instead of a structured error. The
//! two kinds are never mixed within one call chain.

use std::fmt;

enum Inner<T, E> {
    Ok(T),
    Failed(E),
}

/// Success-or-failure wrapper with fail-fast accessors.
pub struct Outcome<T, E> {
    inner: Inner<T, E>,
}

impl<T, E> Outcome<T, E> {
    /// Construct a successful outcome.
    pub fn ok(value: T) -> Self {
        Self {
            inner: Inner::Ok(value),
        }
    }

    /// Construct a failed outcome.
    pub fn fail(error: E) -> Self {
        Self {
            inner: Inner::Failed(error),
        }
    }

    /// Whether this outcome carries an error.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner, Inner::Failed(_))
    }

    /// Whether this outcome carries a value.
    pub fn is_ok(&self) -> bool {
        !self.is_failed()
    }

    /// Borrow the success value.
    ///
    /// Panics when called on a failed outcome — check [`is_failed`] first.
    ///
    /// [`is_failed`]: Outcome::is_failed
    pub fn value(&self) -> &T {
        match &self.inner {
            Inner::Ok(value) => value,
            Inner::Failed(_) => panic!("called value() on a failed outcome"),
        }
    }

    /// Consume the outcome and return the success value.
    ///
    /// Panics when called on a failed outcome.
    pub fn into_value(self) -> T {
        match self.inner {
            Inner::Ok(value) => value,
            Inner::Failed(_) => panic!("called into_value() on a failed outcome"),
        }
    }

    /// Borrow the error.
    ///
    /// Panics when called on a successful outcome.
    pub fn error(&self) -> &E {
        match &self.inner {
            Inner::Ok(_) => panic!("called error() on a successful outcome"),
            Inner::Failed(error) => error,
        }
    }

    /// Consume the outcome and return the error.
    ///
    /// Panics when called on a successful outcome.
    pub fn into_error(self) -> E {
        match self.inner {
            Inner::Ok(_) => panic!("called into_error() on a successful outcome"),
            Inner::Failed(error) => error,
        }
    }

    /// Bridge into `std::result::Result` for `?`-style call sites.
    pub fn into_result(self) -> Result<T, E> {
        match self.inner {
            Inner::Ok(value) => Ok(value),
            Inner::Failed(error) => Err(error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::fail(error),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Outcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Ok(value) => f.debug_tuple("Outcome::Ok").field(value).finish(),
            Inner::Failed(error) => f.debug_tuple("Outcome::Failed").field(error).finish(),
        }
    }
}

impl<T: Clone, E: Clone> Clone for Outcome<T, E> {
    fn clone(&self) -> Self {
        match &self.inner {
            Inner::Ok(value) => Self::ok(value.clone()),
            Inner::Failed(error) => Self::fail(error.clone()),
        }
    }
}

/// Outcome variant for UI-facing collaborators.
///
/// The error side is a user-facing, already-translated message string.
/// Constructing a failure with an empty message is a contract violation.
#[derive(Debug, Clone)]
pub struct TranslatedOutcome<T> {
    inner: Outcome<T, String>,
}

impl<T> TranslatedOutcome<T> {
    /// Construct a successful translated outcome.
    pub fn ok(value: T) -> Self {
        Self {
            inner: Outcome::ok(value),
        }
    }

    /// Construct a failed translated outcome with a user-facing message.
    ///
    /// Panics on an empty message — a blank error shown to the user is a
    /// programming error.
    pub fn fail(message: impl Into<String>) -> Self {
        let message = message.into();
        assert!(
            !message.is_empty(),
            "translated outcome requires a non-empty message"
        );
        Self {
            inner: Outcome::fail(message),
        }
    }

    /// Whether this outcome carries a failure message.
    pub fn is_failed(&self) -> bool {
        self.inner.is_failed()
    }

    /// Borrow the success value. Panics on a failed outcome.
    pub fn value(&self) -> &T {
        self.inner.value()
    }

    /// The user-facing message. Panics on a successful outcome.
    pub fn message(&self) -> &str {
        self.inner.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_outcome() {
        let outcome: Outcome<u32, String> = Outcome::ok(7);
        assert!(!outcome.is_failed());
        assert!(outcome.is_ok());
        assert_eq!(*outcome.value(), 7);
        assert_eq!(outcome.into_value(), 7);
    }

    #[test]
    fn test_failed_outcome() {
        let outcome: Outcome<u32, &str> = Outcome::fail("broken");
        assert!(outcome.is_failed());
        assert_eq!(*outcome.error(), "broken");
        assert_eq!(outcome.into_error(), "broken");
    }

    #[test]
    #[should_panic(expected = "called value() on a failed outcome")]
    fn test_value_on_failure_panics() {
        let outcome: Outcome<u32, &str> = Outcome::fail("broken");
        let _ = outcome.value();
    }

    #[test]
    #[should_panic(expected = "called error() on a successful outcome")]
    fn test_error_on_success_panics() {
        let outcome: Outcome<u32, &str> = Outcome::ok(1);
        let _ = outcome.error();
    }

    #[test]
    fn test_into_result_bridge() {
        let ok: Outcome<u32, String> = Outcome::ok(3);
        assert_eq!(ok.into_result(), Ok(3));

        let failed: Outcome<u32, String> = Outcome::fail("nope".to_string());
        assert_eq!(failed.into_result(), Err("nope".to_string()));
    }

    #[test]
    fn test_from_result() {
        let outcome: Outcome<u32, String> = Ok::<_, String>(9).into();
        assert_eq!(*outcome.value(), 9);

        let outcome: Outcome<u32, String> = Err::<u32, _>("bad".to_string()).into();
        assert!(outcome.is_failed());
    }

    #[test]
    fn test_translated_outcome() {
        let ok = TranslatedOutcome::ok(());
        assert!(!ok.is_failed());

        let failed: TranslatedOutcome<()> = TranslatedOutcome::fail("Reconnecting…");
        assert!(failed.is_failed());
        assert_eq!(failed.message(), "Reconnecting…");
    }

    #[test]
    #[should_panic(expected = "non-empty message")]
    fn test_translated_empty_message_panics() {
        let _: TranslatedOutcome<()> = TranslatedOutcome::fail("");
    }
}
