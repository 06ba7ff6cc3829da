// SPDX-License-Identifier: MIT

use core::result;

/// Status for feature API command execution.
///
/// Every engine entry point returns either `()` or a value on success and
/// one of these codes otherwise. `TryAgain` is not a failure: it is the
/// cooperative suspension signal of the state machines and must be
/// propagated unchanged to the outer driver.
#[derive(Debug, strum_macros::Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The asynchronous operation is not yet complete.
    TryAgain,
    /// A required reference was empty.
    BadReference,
    /// Context corruption was detected.
    BadContext,
    /// The path does not map to an object of the expected kind.
    BadPath,
    /// An argument value is outside its allowed range.
    BadValue,
    /// Another command is already in flight on this context.
    BadSequence,
    /// The command needs a TPM but the context has none.
    NoTpm,
    /// The NV index has the wrong type for the operation.
    NvWrongType,
    /// The write would exceed the declared NV data size.
    NvExceeded,
    /// The NV index is not writeable.
    NvNotWriteable,
    /// The NV index is too small for the data.
    NvTooSmall,
    /// No policy matching the digest could be found.
    PolicyUnknown,
    /// The policy path does not resolve to a stored policy.
    PolicyPathNotFound,
    /// An invalid template or policy was supplied.
    BadTemplate,
    /// A required authorization callback is not registered.
    AuthorizationUnknown,
    /// A signature did not verify.
    SignatureVerificationFailed,
    /// The object or policy store rejected the operation.
    StorageError,
    /// File or device I/O failed.
    IoError,
    /// Allocation failed or a fixed-size table overflowed.
    Memory,
    /// The TPM rejected the presented authorization value.
    BadAuth,
    /// Catch-all for broken internal invariants.
    GeneralFailure,
    /// The requested feature is not implemented.
    NotImplemented,
}

impl Error {
    /// Whether a command may continue after seeing this code.
    ///
    /// Only the suspension signal and a bad authorization during the
    /// designated retry window are recoverable; everything else aborts the
    /// command after cleanup.
    #[must_use]
    pub fn recoverable(self) -> bool {
        matches!(self, Error::TryAgain | Error::BadAuth)
    }
}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn display_names() {
        assert_eq!(Error::TryAgain.to_string(), "TryAgain");
        assert_eq!(Error::NvWrongType.to_string(), "NvWrongType");
    }

    #[test]
    fn recoverable_split() {
        assert!(Error::TryAgain.recoverable());
        assert!(Error::BadAuth.recoverable());
        assert!(!Error::BadSequence.recoverable());
        assert!(!Error::IoError.recoverable());
    }
}
