// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `Future` adapter over the callback interface.

use std::fmt;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::oneshot;

use crate::error::{Error, Result};
use crate::request::Request;

/// Future returned by [`CoalescingVerifier::verify_future`][crate::CoalescingVerifier::verify_future].
///
/// Owns the caller's [`Request`]; dropping the future before it resolves cancels the
/// caller's interest in the verification.
#[must_use = "futures do nothing unless polled, and dropping this one cancels the verification"]
pub struct VerifyFuture<T> {
    state: State<T>,
}

enum State<T> {
    Ready(T),
    Pending { receiver: oneshot::Receiver<T>, request: Request },
    Done,
}

impl<T> VerifyFuture<T> {
    pub(crate) fn ready(value: T) -> Self {
        Self { state: State::Ready(value) }
    }

    pub(crate) fn pending(request: Request, receiver: oneshot::Receiver<T>) -> Self {
        Self {
            state: State::Pending { receiver, request },
        }
    }

    /// Returns the caller's request while the verification is still pending.
    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        match &self.state {
            State::Pending { request, .. } => Some(request),
            State::Ready(_) | State::Done => None,
        }
    }
}

// Nothing is ever pinned structurally; the receiver is polled through a fresh `Pin::new`.
impl<T> Unpin for VerifyFuture<T> {}

impl<T> Future for VerifyFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match mem::replace(&mut this.state, State::Done) {
            State::Ready(value) => Poll::Ready(Ok(value)),
            State::Pending { mut receiver, request } => match Pin::new(&mut receiver).poll(cx) {
                Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Abandoned)),
                Poll::Pending => {
                    this.state = State::Pending { receiver, request };
                    Poll::Pending
                }
            },
            State::Done => panic!("VerifyFuture polled after it already resolved"),
        }
    }
}

impl<T> fmt::Debug for VerifyFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Ready(_) => "Ready",
            State::Pending { .. } => "Pending",
            State::Done => "Done",
        };
        f.debug_struct("VerifyFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use futures::executor::block_on;

    use super::*;
    use crate::CoalescingVerifier;
    use crate::testing::{FakeVerifier, Verdict};

    #[test]
    fn ready_resolves_immediately() {
        let (verifier, control) = FakeVerifier::new();
        control.answer_immediately("a", Verdict::ok("R"));
        let cache = CoalescingVerifier::new(verifier);

        let future = cache.verify_future("a".to_string());
        assert!(future.request().is_none());
        assert_eq!(block_on(future), Ok(Verdict::ok("R")));
    }

    #[test]
    fn pending_resolves_after_completion() {
        block_on(async {
            let (verifier, control) = FakeVerifier::new();
            let cache = CoalescingVerifier::new(verifier);

            // The verification starts eagerly, before the futures are first polled.
            let first = cache.verify_future("a".to_string());
            let second = cache.verify_future("a".to_string());
            assert_eq!(control.start_count("a"), 1);

            control.complete("a", Verdict::ok("R"));

            assert_eq!(first.await, Ok(Verdict::ok("R")));
            assert_eq!(second.await, Ok(Verdict::ok("R")));
        });
    }

    #[test]
    fn dropping_future_cancels() {
        let (verifier, control) = FakeVerifier::new();
        let cache = CoalescingVerifier::new(verifier);

        let future = cache.verify_future("a".to_string());
        assert!(future.request().is_some_and(Request::is_attached));
        drop(future);

        assert_eq!(control.cancelled(), vec!["a".to_string()]);
        assert_eq!(cache.job_counts().joinable, 0);
    }

    #[test]
    fn dropping_cache_abandons_future() {
        let (verifier, _control) = FakeVerifier::new();
        let cache = CoalescingVerifier::new(verifier);

        let future = cache.verify_future("a".to_string());
        drop(cache);

        assert_eq!(block_on(future), Err(Error::Abandoned));
    }

    #[test]
    fn panicking_sibling_callback_abandons_future() {
        let (verifier, control) = FakeVerifier::new();
        let cache = CoalescingVerifier::new(verifier);

        let _first = cache.verify("a".to_string(), |_| panic!("callback failed"));
        let future = cache.verify_future("a".to_string());

        let unwound = catch_unwind(AssertUnwindSafe(|| control.complete("a", Verdict::ok("R"))));
        assert!(unwound.is_err());

        assert_eq!(cache.job_counts().joinable, 0);
        assert_eq!(block_on(future), Err(Error::Abandoned));
    }

    #[test]
    #[should_panic(expected = "already resolved")]
    fn poll_after_resolution_panics() {
        let mut future = VerifyFuture::ready(1_u32);
        block_on(async {
            assert_eq!((&mut future).await, Ok(1));
            let _ = (&mut future).await;
        });
    }

    #[test]
    fn debug_shows_state() {
        let future = VerifyFuture::ready(1_u32);
        assert!(format!("{future:?}").contains("Ready"));
    }
}
