//! Error taxonomy for default retryability decisions
//!
//! The retry executor needs to distinguish failures worth retrying from
//! failures that will never succeed. Callers with richer error types can
//! supply their own predicate; everyone else maps their errors onto
//! [`ErrorClass`] via the [`Classify`] trait and gets the default
//! classification:
//!
//! - **Transient**: network-class infrastructure failures (connection
//!   refused/reset/aborted, broken pipe, timeout, DNS lookup failure).
//!   Always retryable.
//! - **Operational**: an anticipated application failure carrying a
//!   status-code-like classification. Retryable only for a fixed allow-list
//!   of codes.
//! - **Permanent**: everything else. Never retried.

use std::io;

/// Status classifications of operational errors that are safe to retry.
///
/// Request timeout, too many requests, bad gateway, service unavailable,
/// and gateway timeout.
pub const RETRYABLE_STATUS_CODES: [u16; 5] = [408, 429, 502, 503, 504];

/// Coarse failure classification used by the default retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient infrastructure failure (network-class); always retryable
    Transient,
    /// Anticipated application failure with a status-code classification;
    /// retryable only for codes in [`RETRYABLE_STATUS_CODES`]
    Operational(u16),
    /// Anything else; never retried
    Permanent,
}

impl ErrorClass {
    /// Whether the default classification considers this class retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient => true,
            Self::Operational(status) => RETRYABLE_STATUS_CODES.contains(status),
            Self::Permanent => false,
        }
    }
}

/// Trait for mapping an error type onto the default taxonomy
///
/// Implement this on your error type to use
/// [`policies::ClassifiedRetry`](crate::retry::policies::ClassifiedRetry)
/// without writing a custom predicate.
pub trait Classify {
    /// Classify this error for retryability purposes
    fn class(&self) -> ErrorClass;

    /// Whether this error is retryable under the default classification
    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl Classify for io::Error {
    fn class(&self) -> ErrorClass {
        match self.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

impl<E: Classify> Classify for Box<E> {
    fn class(&self) -> ErrorClass {
        (**self).class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `ErrorClass::is_retryable` for each taxonomy branch.
    ///
    /// Assertions:
    /// - Confirms `Transient` is retryable.
    /// - Confirms `Operational` follows the status allow-list.
    /// - Confirms `Permanent` is never retryable.
    #[test]
    fn test_error_class_retryability() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());

        for status in RETRYABLE_STATUS_CODES {
            assert!(ErrorClass::Operational(status).is_retryable());
        }
        assert!(!ErrorClass::Operational(400).is_retryable());
        assert!(!ErrorClass::Operational(404).is_retryable());
        assert!(!ErrorClass::Operational(500).is_retryable());
    }

    /// Validates the `Classify` impl for `std::io::Error`.
    ///
    /// Assertions:
    /// - Confirms network-class kinds map to `Transient`.
    /// - Confirms non-network kinds map to `Permanent`.
    #[test]
    fn test_io_error_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(refused.class(), ErrorClass::Transient);
        assert!(refused.is_retryable());

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(timed_out.class(), ErrorClass::Transient);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert_eq!(denied.class(), ErrorClass::Permanent);
        assert!(!denied.is_retryable());
    }

    /// Validates that boxed errors delegate to the inner classification.
    #[test]
    fn test_boxed_classification_delegates() {
        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let boxed = Box::new(inner);
        assert_eq!(boxed.class(), ErrorClass::Transient);
    }
}
