// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Caller-owned handles and their job-side counterparts.

use std::fmt;
use std::rc::Weak;

use crate::job::JobId;

/// Identifies one caller's [`Request`] within a job. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RequestId(u64);

impl RequestId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) const fn get(self) -> u64 {
        self.0
    }
}

/// Lets a [`Request`] detach itself from its job without knowing the verifier type.
pub(crate) trait Detach {
    fn detach(&self, job: JobId, request: RequestId);

    fn is_attached(&self, job: JobId, request: RequestId) -> bool;
}

/// A caller's handle on a pending verification.
///
/// The callback passed to [`CoalescingVerifier::verify`][crate::CoalescingVerifier::verify]
/// runs at most once, while this handle is alive. Dropping the handle cancels the
/// caller's interest: its callback will never run. If it was the last handle attached
/// to a job, the underlying verification is cancelled as well.
///
/// There is no explicit cancel method; dropping the handle *is* cancellation.
#[must_use = "dropping the request cancels it"]
pub struct Request {
    owner: Weak<dyn Detach>,
    job: JobId,
    id: RequestId,
}

impl Request {
    pub(crate) fn new(owner: Weak<dyn Detach>, job: JobId, id: RequestId) -> Self {
        Self { owner, job, id }
    }

    /// Returns `true` while the request still waits for its result.
    ///
    /// Becomes `false` once the callback has been handed its result, or once the
    /// owning cache is dropped.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.owner.upgrade().is_some_and(|owner| owner.is_attached(self.job, self.id))
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self.job, self.id);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").field("job", &self.job).field("id", &self.id).finish()
    }
}

/// The job-side record of an attached [`Request`]: its id and the callback to run.
pub(crate) struct Subscriber<T> {
    id: RequestId,
    callback: Box<dyn FnOnce(T)>,
}

impl<T> Subscriber<T> {
    pub(crate) fn new(id: RequestId, callback: Box<dyn FnOnce(T)>) -> Self {
        Self { id, callback }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    /// Hands the result to the caller. The callback may drop the caller's [`Request`],
    /// the cache itself, or start new verifications.
    pub(crate) fn complete(self, result: T) {
        (self.callback)(result);
    }

    /// The job went away without a result; the callback is dropped without running.
    pub(crate) fn on_job_abort(self) {
        drop(self.callback);
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish_non_exhaustive()
    }
}
