// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the coalescing cache and the verifier doing the real work.

use std::fmt;
use std::hash::Hash;
use std::rc::Weak;

use crate::job::JobId;

/// An asynchronous, side-effect-free verification operation.
///
/// Implementations perform the real work (for certificates: chain building, policy
/// evaluation, trust store lookups). The coalescing cache guarantees that concurrent
/// callers asking for the same [`Key`][Verifier::Key] share a single call to
/// [`start`][Verifier::start].
///
/// # Contract
///
/// * If the result is known immediately, `start` returns [`Started::Ready`] and drops
///   the [`Completion`] without using it.
/// * Otherwise `start` returns [`Started::Pending`] with a cancellation handle and later
///   calls [`Completion::complete`] exactly once.
/// * Once the cancellation handle is dropped, the completion must never be invoked.
/// * The completion must never be invoked from within `start` or `set_config`; callers'
///   callbacks run inside [`Completion::complete`] and may call back into the cache.
pub trait Verifier: 'static {
    /// Parameters that fully determine the result of a verification.
    type Key: Clone + Eq + Hash + fmt::Debug + 'static;

    /// Outcome of a verification: status plus any result payload.
    type Output: Clone + 'static;

    /// Configuration applied to subsequently started verifications.
    type Config;

    /// Cancellation handle for an in-flight verification. Dropping it cancels the work.
    type Pending: 'static;

    /// Starts verifying `key`.
    fn start(&mut self, key: &Self::Key, completion: Completion<Self::Output>) -> Started<Self::Output, Self::Pending>;

    /// Replaces the configuration used by verifications started from now on.
    ///
    /// Verifications already in flight are unaffected.
    fn set_config(&mut self, config: Self::Config);
}

/// What a [`Verifier`] did when asked to start a verification.
#[derive(Debug)]
pub enum Started<T, P> {
    /// The verification finished synchronously with this output.
    Ready(T),

    /// The verification is in flight. Dropping the handle cancels it.
    Pending(P),
}

/// Receives the result of a job once its verification finishes.
pub(crate) trait CompleteJob<T> {
    fn complete_job(&self, job: JobId, output: T);
}

/// One-shot token through which a [`Verifier`] reports the result of a pending verification.
///
/// Dropping the token without calling [`complete`][Self::complete] is allowed; the cache
/// treats the verification as still pending until its cancellation handle is dropped.
#[must_use = "a pending verification only finishes when its completion is invoked"]
pub struct Completion<T> {
    target: Weak<dyn CompleteJob<T>>,
    job: JobId,
}

impl<T> Completion<T> {
    pub(crate) fn new(target: Weak<dyn CompleteJob<T>>, job: JobId) -> Self {
        Self { target, job }
    }

    /// Delivers the verification result to every caller waiting on it.
    ///
    /// Callbacks of waiting callers run synchronously inside this call. If the cache
    /// has already been dropped this is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called from within [`Verifier::start`] or after the verification's
    /// cancellation handle was dropped.
    pub fn complete(self, output: T) {
        if let Some(target) = self.target.upgrade() {
            target.complete_job(self.job, output);
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("job", &self.job).finish_non_exhaustive()
    }
}
