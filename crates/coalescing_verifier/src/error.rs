// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Errors surfaced by the asynchronous adapter, [`VerifyFuture`][crate::VerifyFuture].
///
/// Verification failures are not errors of this crate; they are part of the verifier's
/// output and are passed through unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No result will ever arrive for this caller.
    ///
    /// Either the cache was dropped while the verification was still in flight, or a
    /// callback of another caller of the same verification panicked while the result was
    /// being handed out, which abandons the callers still waiting.
    #[error("the verification was abandoned before its result reached this caller")]
    Abandoned,
}

/// A specialized `Result` for the asynchronous adapter.
pub type Result<T> = std::result::Result<T, Error>;
