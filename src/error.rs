//! Error classification shared by every component.
//!
//! Each component has its own error enum; all of them map onto an
//! [`ErrorClass`] so the run loop can decide between stopping the process and
//! waiting for the next pass.

use std::fmt;

/// How a failure should be treated by the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Nothing will succeed until an operator intervenes (bad credentials,
    /// bad configuration).  Stops the continuous loop.
    Fatal,
    /// Likely to succeed on a later pass without any change upstream.
    Retryable,
    /// The artifact itself is unusable; retrying gives the same answer until
    /// the producer publishes new content.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
        }
    }

    /// The more severe of two classes.
    pub fn max(self, other: Self) -> Self {
        fn rank(c: ErrorClass) -> u8 {
            match c {
                ErrorClass::Retryable => 0,
                ErrorClass::Permanent => 1,
                ErrorClass::Fatal => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can end up in a pass result.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_prefers_fatal() {
        assert_eq!(ErrorClass::Retryable.max(ErrorClass::Fatal), ErrorClass::Fatal);
        assert_eq!(ErrorClass::Fatal.max(ErrorClass::Permanent), ErrorClass::Fatal);
        assert_eq!(
            ErrorClass::Retryable.max(ErrorClass::Permanent),
            ErrorClass::Permanent
        );
        assert_eq!(
            ErrorClass::Retryable.max(ErrorClass::Retryable),
            ErrorClass::Retryable
        );
    }
}
