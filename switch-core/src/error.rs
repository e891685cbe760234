// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for the hardware command pipeline

use core::fmt;

/// Driver result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Driver error type
///
/// Only [`Error::TryAgain`] and [`Error::HardwareStuck`] are retryable; every
/// other variant aborts the current operation and leaves the hardware in its
/// last explicitly applied state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed input from the caller
    InvalidArg,
    /// Bookkeeping allocation failed
    NoSysResources,
    /// Buffer pool exhausted, descriptor ring full, or hardware not yet
    /// quiescent; safe to retry
    TryAgain,
    /// An atomic lock/unlock span cannot fit in one DMA buffer
    NoSpace,
    /// Nothing pending for the requested operation
    ObjectNotFound,
    /// Pushing to the descriptor ring failed at the transport level
    CommFail,
    /// Internal invariant violation
    Unexpected,
    /// A drain poll exhausted its retry bound before the port quiesced
    HardwareStuck {
        /// Logical port still holding traffic
        port: u16,
    },
    /// Device or session is shutting down
    NotReady,
}

impl Error {
    /// Whether the caller may simply retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TryAgain | Error::HardwareStuck { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArg => write!(f, "Invalid argument"),
            Error::NoSysResources => write!(f, "No system resources"),
            Error::TryAgain => write!(f, "Resource exhausted, try again"),
            Error::NoSpace => write!(f, "Atomic span exceeds one DMA buffer"),
            Error::ObjectNotFound => write!(f, "Object not found"),
            Error::CommFail => write!(f, "Descriptor ring push failed"),
            Error::Unexpected => write!(f, "Internal invariant violation"),
            Error::HardwareStuck { port } => {
                write!(f, "Port {} failed to drain within the retry bound", port)
            }
            Error::NotReady => write!(f, "Device or session is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::TryAgain.is_retryable());
        assert!(Error::HardwareStuck { port: 3 }.is_retryable());

        assert!(!Error::InvalidArg.is_retryable());
        assert!(!Error::NoSpace.is_retryable());
        assert!(!Error::ObjectNotFound.is_retryable());
        assert!(!Error::CommFail.is_retryable());
        assert!(!Error::Unexpected.is_retryable());
        assert!(!Error::NotReady.is_retryable());
    }
}
