// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The coalescing facade.
//!
//! # Borrow discipline
//!
//! All state lives in `RefCell`s shared between the facade, its [`Request`]s and the
//! [`Completion`]s handed to the verifier. No borrow is ever held while foreign code
//! runs: caller callbacks, the verifier, and destructors of anything the caller or the
//! verifier supplied (callbacks, cancellation handles) are always invoked after the
//! borrow that produced them has ended. Any of those may re-enter the cache, including
//! dropping it.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::thread;

use futures_channel::oneshot;
use tick::Clock;
use tick::runtime::InactiveClock;

use crate::builder::CoalescingVerifierBuilder;
use crate::future::VerifyFuture;
use crate::job::{Delivery, JobCounts, JobId, JobTable};
use crate::request::{Detach, Request, RequestId};
use crate::telemetry::{DEFAULT_NAME, EventScope, Telemetry, VerifierActivity, VerifierName};
use crate::verifier::{CompleteJob, Completion, Started, Verifier};

/// Result of [`CoalescingVerifier::verify`].
#[derive(Debug)]
#[must_use = "dropping a pending request cancels it"]
pub enum Outcome<T> {
    /// The verifier answered synchronously. The callback was dropped without running.
    Ready(T),

    /// The result will be delivered to the callback later, unless the request is
    /// dropped first.
    Pending(Request),
}

impl<T> Outcome<T> {
    /// Returns `true` if the result will arrive through the callback.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Returns the synchronous result, if any. A pending request is dropped (cancelled).
    #[must_use]
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending(_) => None,
        }
    }

    /// Returns the request handle, if the verification is pending.
    #[must_use]
    pub fn into_request(self) -> Option<Request> {
        match self {
            Self::Ready(_) => None,
            Self::Pending(request) => Some(request),
        }
    }
}

/// Collapses concurrent verifications of the same key into one call to the
/// underlying [`Verifier`].
///
/// Every caller gets its own [`Request`] handle and its own callback invocation with an
/// identical copy of the result. Callers may drop their handle at any time, including
/// from inside another caller's callback; when the last handle attached to an in-flight
/// verification is dropped, that verification is cancelled.
///
/// [`set_config`][Self::set_config] starts a new generation: verifications already in
/// flight finish for their existing callers, but new callers never join them.
///
/// Dropping the `CoalescingVerifier` cancels everything. No callback runs after the drop
/// begins.
///
/// # Thread safety
///
/// This type is single-threaded. Every entry point, including the verifier's
/// completions, must run on the thread that owns it.
///
/// # Examples
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// use coalescing_verifier::{CoalescingVerifier, Completion, Outcome, Started, Verifier};
///
/// /// Parks every verification until the test completes it by hand.
/// #[derive(Default)]
/// struct Parked {
///     parked: Rc<RefCell<Vec<Completion<u32>>>>,
/// }
///
/// impl Verifier for Parked {
///     type Key = &'static str;
///     type Output = u32;
///     type Config = ();
///     type Pending = ();
///
///     fn start(&mut self, _key: &&'static str, completion: Completion<u32>) -> Started<u32, ()> {
///         self.parked.borrow_mut().push(completion);
///         Started::Pending(())
///     }
///
///     fn set_config(&mut self, _config: ()) {}
/// }
///
/// let parked = Rc::new(RefCell::new(Vec::new()));
/// let verifier = CoalescingVerifier::new(Parked { parked: Rc::clone(&parked) });
/// let results = Rc::new(RefCell::new(Vec::new()));
///
/// let mut requests = Vec::new();
/// for _ in 0..3 {
///     let results = Rc::clone(&results);
///     match verifier.verify("a.example:443", move |code| results.borrow_mut().push(code)) {
///         Outcome::Pending(request) => requests.push(request),
///         Outcome::Ready(_) => unreachable!(),
///     }
/// }
///
/// // Three callers, one underlying verification.
/// assert_eq!(parked.borrow().len(), 1);
///
/// let completion = parked.borrow_mut().pop().unwrap();
/// completion.complete(0);
/// assert_eq!(*results.borrow(), vec![0, 0, 0]);
/// ```
pub struct CoalescingVerifier<V: Verifier> {
    shared: Rc<Shared<V>>,
}

impl<V: Verifier> CoalescingVerifier<V> {
    /// Creates a coalescing verifier in front of `verifier`, timed by the system clock and
    /// with logging disabled.
    #[must_use]
    pub fn new(verifier: V) -> Self {
        Self::with_telemetry(verifier, system_clock(), Telemetry::new(DEFAULT_NAME, false))
    }

    /// Returns a builder for configuring name, clock and logging.
    pub fn builder(verifier: V) -> CoalescingVerifierBuilder<V> {
        CoalescingVerifierBuilder::new(verifier)
    }

    pub(crate) fn with_telemetry(verifier: V, clock: Clock, telemetry: Telemetry) -> Self {
        Self {
            shared: Rc::new_cyclic(|this| Shared {
                verifier: RefCell::new(verifier),
                table: RefCell::new(JobTable::new(clock)),
                telemetry,
                this: Weak::clone(this),
            }),
        }
    }

    /// Returns the name used in log events.
    #[must_use]
    pub fn name(&self) -> VerifierName {
        self.shared.telemetry.name()
    }

    /// Verifies `key`, joining an in-flight verification of the same key if there is one.
    ///
    /// * If a joinable verification of `key` exists, the caller is attached to it and
    ///   [`Outcome::Pending`] is returned.
    /// * Otherwise the verifier is started. If it answers synchronously, its result is
    ///   returned as [`Outcome::Ready`] and `callback` is dropped without running.
    /// * If it answers later, the caller is attached and [`Outcome::Pending`] is returned.
    ///
    /// The callback never runs from inside `verify`. It runs at most once, with its own
    /// copy of the result, unless the returned [`Request`] or the cache is dropped first.
    pub fn verify<F>(&self, key: V::Key, callback: F) -> Outcome<V::Output>
    where
        F: FnOnce(V::Output) + 'static,
    {
        self.shared.verify(key, Box::new(callback))
    }

    /// Asynchronous form of [`verify`][Self::verify].
    ///
    /// Dropping the returned future cancels the caller's interest exactly as dropping a
    /// [`Request`] does. The future resolves to [`Error::Abandoned`][crate::Error::Abandoned]
    /// if the cache is dropped before the verification completes, or if the callback of
    /// another caller sharing the verification panics before this caller is served.
    pub fn verify_future(&self, key: V::Key) -> VerifyFuture<V::Output> {
        let (sender, receiver) = oneshot::channel();

        let outcome = self.verify(key, move |output| {
            // The receiver lives in the future that owns the request, so it is still there.
            let _ = sender.send(output);
        });

        match outcome {
            Outcome::Ready(output) => VerifyFuture::ready(output),
            Outcome::Pending(request) => VerifyFuture::pending(request, receiver),
        }
    }

    /// Starts a new configuration generation and forwards `config` to the verifier.
    ///
    /// Verifications already in flight keep running and deliver their results to
    /// their existing callers, but new calls never join them, even for the same key.
    pub fn set_config(&self, config: V::Config) {
        self.invalidate();
        self.shared.verifier.borrow_mut().set_config(config);
    }

    /// Starts a new generation without changing the configuration.
    ///
    /// Use this when the verifier's answers may have changed for reasons outside the
    /// configuration, e.g. its trust store was updated.
    pub fn invalidate(&self) {
        let generation = self.shared.table.borrow_mut().advance_generation();
        self.shared
            .telemetry
            .record(VerifierActivity::GenerationAdvanced, EventScope::generation(generation));
    }

    /// Returns how many verifications are in flight.
    #[must_use]
    pub fn job_counts(&self) -> JobCounts {
        self.shared.table.borrow().counts()
    }
}

impl<V: Verifier> Drop for CoalescingVerifier<V> {
    fn drop(&mut self) {
        let jobs = self.shared.table.borrow_mut().shut_down();

        for (id, job) in jobs {
            let generation = job.generation();
            job.abort();
            self.shared
                .telemetry
                .record(VerifierActivity::JobAborted, EventScope::job(id, generation));
        }
    }
}

impl<V: Verifier> fmt::Debug for CoalescingVerifier<V> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingVerifier")
            .field("name", &self.name())
            .field("jobs", &self.shared.table.try_borrow().map(|table| table.counts()).ok())
            .finish_non_exhaustive()
    }
}

/// A clock reading the machine's time. Only stopwatches are taken from it, so its timer
/// driver is not needed.
pub(crate) fn system_clock() -> Clock {
    let (clock, _driver) = InactiveClock::default().activate();
    clock
}

struct Shared<V: Verifier> {
    verifier: RefCell<V>,
    table: RefCell<JobTable<V>>,
    telemetry: Telemetry,
    this: Weak<Self>,
}

impl<V: Verifier> Shared<V> {
    fn verify(&self, key: V::Key, callback: Box<dyn FnOnce(V::Output)>) -> Outcome<V::Output> {
        let joinable = self.table.borrow().find_joinable(&key);
        if let Some(job) = joinable {
            return Outcome::Pending(self.attach(job, callback));
        }

        let (job, generation) = {
            let mut table = self.table.borrow_mut();
            (table.create(key.clone()), table.generation())
        };
        self.telemetry.record(VerifierActivity::JobStarted, EventScope::job(job, generation));

        let completer: Weak<dyn CompleteJob<V::Output>> = Weak::<Self>::clone(&self.this);
        let started = self.verifier.borrow_mut().start(&key, Completion::new(completer, job));

        match started {
            Started::Ready(output) => {
                let finished = self.table.borrow_mut().remove(job);
                self.telemetry.record(
                    VerifierActivity::JobCompletedSync,
                    EventScope::job(job, generation).with_duration(finished.elapsed(), finished.is_first()),
                );
                drop(finished);
                Outcome::Ready(output)
            }
            Started::Pending(pending) => {
                self.table.borrow_mut().register(job, pending);
                Outcome::Pending(self.attach(job, callback))
            }
        }
    }

    fn attach(&self, job: JobId, callback: Box<dyn FnOnce(V::Output)>) -> Request {
        let request = self.table.borrow_mut().attach(job, callback);
        self.telemetry
            .record(VerifierActivity::RequestAttached, EventScope::request(job, request));

        let owner: Weak<dyn Detach> = Weak::<Self>::clone(&self.this);
        Request::new(owner, job, request)
    }

    /// Removes a job whose fan-out was interrupted by a panicking callback. Its
    /// remaining requests are detached without their callbacks running.
    fn abandon(&self, job: JobId) {
        let taken = self.table.borrow_mut().take(job);
        if let Some(taken) = taken {
            let generation = taken.generation();
            taken.abort();
            self.telemetry
                .record(VerifierActivity::JobAborted, EventScope::job(job, generation));
        }
    }
}

/// Hands a completed job's result to its requests, oldest first.
///
/// Each step re-resolves the cache and the job, because the previous callback may have
/// dropped either. Requests that joined during fan-out are served in the same pass.
fn fan_out<V: Verifier>(this: &Weak<Shared<V>>, job: JobId) {
    loop {
        let Some(shared) = this.upgrade() else {
            return;
        };

        let delivery = shared.table.borrow_mut().next_delivery(job);
        match delivery {
            Delivery::Gone => return,
            Delivery::Drained(finished) => {
                drop(finished);
                return;
            }
            Delivery::Next(subscriber, result) => {
                shared
                    .telemetry
                    .record(VerifierActivity::RequestCompleted, EventScope::request(job, subscriber.id()));
                drop(shared);

                let guard = AbandonOnPanic { owner: this, job };
                subscriber.complete(result);
                drop(guard);
            }
        }
    }
}

/// Removes the job if a callback unwinds out of the fan-out loop, so later callers do
/// not join a job that will never finish handing out its result.
struct AbandonOnPanic<'a, V: Verifier> {
    owner: &'a Weak<Shared<V>>,
    job: JobId,
}

impl<V: Verifier> Drop for AbandonOnPanic<'_, V> {
    fn drop(&mut self) {
        if thread::panicking()
            && let Some(shared) = self.owner.upgrade()
        {
            shared.abandon(self.job);
        }
    }
}

impl<V: Verifier> CompleteJob<V::Output> for Shared<V> {
    fn complete_job(&self, job: JobId, output: V::Output) {
        let released = {
            let mut table = self.table.borrow_mut();
            if table.is_shut_down() {
                return;
            }
            table.begin_completion(job, output)
        };

        // The verifier's handle is released before any callback runs, so cancelling
        // from inside a callback has nothing left to cancel.
        drop(released);

        let scope = self.table.borrow().job(job).map(|entry| {
            EventScope::job(job, entry.generation()).with_duration(entry.elapsed(), entry.is_first())
        });
        if let Some(scope) = scope {
            self.telemetry.record(VerifierActivity::JobCompleted, scope);
        }

        fan_out(&self.this, job);
    }
}

impl<V: Verifier> Detach for Shared<V> {
    fn detach(&self, job: JobId, request: RequestId) {
        let (subscriber, orphan) = self.table.borrow_mut().detach(job, request);

        if let Some(subscriber) = subscriber {
            self.telemetry
                .record(VerifierActivity::RequestDetached, EventScope::request(job, request));
            subscriber.on_job_abort();
        }

        if let Some(orphan) = orphan {
            let generation = orphan.generation();
            orphan.abort();
            self.telemetry
                .record(VerifierActivity::JobCancelled, EventScope::job(job, generation));
        }
    }

    fn is_attached(&self, job: JobId, request: RequestId) -> bool {
        self.table.borrow().is_attached(job, request)
    }
}
