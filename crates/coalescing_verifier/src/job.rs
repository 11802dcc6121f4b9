// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Jobs and the arena that owns them.
//!
//! A [`Job`] owns one in-flight call to the underlying verifier and the queue of
//! callers waiting on it. Jobs live in a [`JobTable`] and are addressed by [`JobId`]s
//! that are never reused, so a stale id simply fails lookup. The fan-out loop relies
//! on this to notice that its job went away while a caller's callback was running.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use std::{fmt, mem};

use tick::{Clock, Stopwatch};

use crate::request::{RequestId, Subscriber};
use crate::verifier::Verifier;

/// Identifies a job within its [`JobTable`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct JobId(u64);

impl JobId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) const fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created, verifier not yet consulted (or it is answering right now).
    Created,
    /// The verifier is working on it; callers may join.
    Pending,
    /// The result is known and is being handed out.
    Completing,
}

pub(crate) struct Job<V: Verifier> {
    key: V::Key,
    generation: u64,
    phase: Phase,
    pending: Option<V::Pending>,
    result: Option<V::Output>,
    subscribers: VecDeque<Subscriber<V::Output>>,
    first: bool,
    stopwatch: Stopwatch,
}

impl<V: Verifier> Job<V> {
    fn new(key: V::Key, generation: u64, first: bool, stopwatch: Stopwatch) -> Self {
        Self {
            key,
            generation,
            phase: Phase::Created,
            pending: None,
            result: None,
            subscribers: VecDeque::new(),
            first,
            stopwatch,
        }
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &V::Key {
        &self.key
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether this was the first job created over the cache's lifetime.
    pub(crate) fn is_first(&self) -> bool {
        self.first
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn mark_pending(&mut self, pending: V::Pending) {
        assert_eq!(self.phase, Phase::Created, "only a freshly created job can become pending");
        self.pending = Some(pending);
        self.phase = Phase::Pending;
    }

    /// Stores the result and releases the cancellation handle, which the caller drops
    /// once no borrow of the table is held.
    fn begin_completion(&mut self, output: V::Output) -> Option<V::Pending> {
        match self.phase {
            Phase::Pending => {}
            Phase::Created => panic!("verifier completed a job from within start; it must return Started::Ready instead"),
            Phase::Completing => panic!("verifier completed the same job twice"),
        }

        self.result = Some(output);
        self.phase = Phase::Completing;
        self.pending.take()
    }

    fn attach(&mut self, subscriber: Subscriber<V::Output>) {
        assert!(
            matches!(self.phase, Phase::Pending | Phase::Completing),
            "requests can only join a job that is pending or handing out its result"
        );
        self.subscribers.push_back(subscriber);
    }

    fn detach(&mut self, request: RequestId) -> Option<Subscriber<V::Output>> {
        let position = self.subscribers.iter().position(|s| s.id() == request)?;
        self.subscribers.remove(position)
    }

    fn is_attached(&self, request: RequestId) -> bool {
        self.subscribers.iter().any(|s| s.id() == request)
    }

    /// Nobody is listening and the verifier is still busy: cancel rather than let
    /// the work finish for no observer.
    fn is_orphaned(&self) -> bool {
        self.phase == Phase::Pending && self.subscribers.is_empty()
    }

    /// Pops the oldest subscriber along with its own copy of the result.
    fn next_delivery(&mut self) -> Option<(Subscriber<V::Output>, V::Output)> {
        assert_eq!(self.phase, Phase::Completing, "fan-out requires a completed job");

        let subscriber = self.subscribers.pop_front()?;
        let result = self.result.clone().unwrap_or_else(|| unreachable!("a completing job always holds its result"));
        Some((subscriber, result))
    }

    /// Tears the job down without a result: the verifier's work is cancelled and every
    /// still-attached subscriber is dropped without its callback running.
    pub(crate) fn abort(mut self) {
        drop(self.pending.take());

        for subscriber in mem::take(&mut self.subscribers) {
            subscriber.on_job_abort();
        }
    }
}

impl<V: Verifier> fmt::Debug for Job<V> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("phase", &self.phase)
            .field("subscribers", &self.subscribers.len())
            .field("first", &self.first)
            .finish_non_exhaustive()
    }
}

/// Number of live jobs, split by whether new callers may still join them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    /// Jobs of the current generation; new callers for the same key join these.
    pub joinable: usize,
    /// Jobs of earlier generations; they finish for their existing callers only.
    pub draining: usize,
}

/// Outcome of one fan-out step.
pub(crate) enum Delivery<V: Verifier> {
    /// Hand this result to this subscriber.
    Next(Subscriber<V::Output>, V::Output),
    /// Every subscriber has been served; the job is removed and returned.
    Drained(Job<V>),
    /// The job no longer exists.
    Gone,
}

/// Owns every job of one cache, plus the index of jobs new callers may join.
pub(crate) struct JobTable<V: Verifier> {
    jobs: HashMap<JobId, Job<V>>,
    joinable: HashMap<V::Key, JobId>,
    generation: u64,
    next_job: u64,
    next_request: u64,
    created_any: bool,
    shut_down: bool,
    clock: Clock,
}

impl<V: Verifier> JobTable<V> {
    /// Creates an empty table whose jobs are timed with `clock`.
    pub fn new(clock: Clock) -> Self {
        Self {
            jobs: HashMap::new(),
            joinable: HashMap::new(),
            generation: 0,
            next_job: 0,
            next_request: 0,
            created_any: false,
            shut_down: false,
            clock,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn job(&self, id: JobId) -> Option<&Job<V>> {
        self.jobs.get(&id)
    }

    /// Looks up a job of the current generation that a new caller for `key` may join.
    pub fn find_joinable(&self, key: &V::Key) -> Option<JobId> {
        let id = *self.joinable.get(key)?;
        self.jobs
            .get(&id)
            .filter(|job| job.generation == self.generation && job.phase != Phase::Created)
            .map(|_| id)
    }

    /// Creates a job that is not yet visible to other callers.
    pub fn create(&mut self, key: V::Key) -> JobId {
        assert!(!self.shut_down, "jobs cannot be created after shutdown");

        let id = JobId::new(self.next_job);
        self.next_job += 1;

        let first = !mem::replace(&mut self.created_any, true);
        self.jobs
            .insert(id, Job::new(key, self.generation, first, self.clock.stopwatch()));
        id
    }

    /// Records that the verifier is working on `id` and makes the job joinable.
    ///
    /// A draining job of an earlier generation may share the key; it keeps running
    /// but loses its index entry.
    pub fn register(&mut self, id: JobId, pending: V::Pending) {
        let job = self.jobs.get_mut(&id).unwrap_or_else(|| panic!("registering unknown job {id:?}"));
        job.mark_pending(pending);
        self.joinable.insert(job.key.clone(), id);
    }

    pub fn attach(&mut self, id: JobId, callback: Box<dyn FnOnce(V::Output)>) -> RequestId {
        let request = RequestId::new(self.next_request);
        self.next_request += 1;

        self.jobs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("attaching to unknown job {id:?}"))
            .attach(Subscriber::new(request, callback));
        request
    }

    /// Removes `request` from its job. If that leaves a pending job with nobody
    /// listening, the job is removed as well and handed back for cancellation.
    pub fn detach(&mut self, id: JobId, request: RequestId) -> (Option<Subscriber<V::Output>>, Option<Job<V>>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return (None, None);
        };

        let subscriber = job.detach(request);
        let orphaned = subscriber.is_some() && job.is_orphaned();

        let removed = orphaned.then(|| self.remove(id));
        (subscriber, removed)
    }

    pub fn is_attached(&self, id: JobId, request: RequestId) -> bool {
        self.jobs.get(&id).is_some_and(|job| job.is_attached(request))
    }

    /// Stores the verifier's result; returns the released cancellation handle.
    ///
    /// # Panics
    ///
    /// Panics if the job does not exist (the verifier completed cancelled work) or is not pending.
    pub fn begin_completion(&mut self, id: JobId, output: V::Output) -> Option<V::Pending> {
        self.jobs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("verifier completed job {id:?} after its cancellation handle was dropped"))
            .begin_completion(output)
    }

    pub fn next_delivery(&mut self, id: JobId) -> Delivery<V> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Delivery::Gone;
        };

        match job.next_delivery() {
            Some((subscriber, result)) => Delivery::Next(subscriber, result),
            None => Delivery::Drained(self.remove(id)),
        }
    }

    /// Removes a job that has no attached requests left.
    ///
    /// # Panics
    ///
    /// Panics if the job does not exist or still has requests attached.
    pub fn remove(&mut self, id: JobId) -> Job<V> {
        let job = self.take(id).unwrap_or_else(|| panic!("removing unknown job {id:?}"));
        assert_eq!(job.subscriber_count(), 0, "a job must not be removed while requests are attached");
        job
    }

    /// Removes a job regardless of attached requests, e.g. after a callback panicked mid fan-out.
    pub fn take(&mut self, id: JobId) -> Option<Job<V>> {
        let job = self.jobs.remove(&id)?;

        // A newer job may own the index entry for the same key.
        if self.joinable.get(&job.key) == Some(&id) {
            self.joinable.remove(&job.key);
        }

        Some(job)
    }

    /// Starts a new generation: existing jobs keep running but no longer accept joiners.
    pub fn advance_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn counts(&self) -> JobCounts {
        self.jobs
            .values()
            .filter(|job| job.phase != Phase::Created)
            .fold(JobCounts::default(), |mut counts, job| {
                if job.generation == self.generation {
                    counts.joinable += 1;
                } else {
                    counts.draining += 1;
                }
                counts
            })
    }

    /// Marks the table as shut down and hands back every job for teardown.
    pub fn shut_down(&mut self) -> Vec<(JobId, Job<V>)> {
        self.shut_down = true;
        self.joinable.clear();

        let mut jobs: Vec<_> = self.jobs.drain().collect();
        jobs.sort_unstable_by_key(|(id, _)| *id);
        jobs
    }
}

impl<V: Verifier> fmt::Debug for JobTable<V> {
    #[cfg_attr(test, mutants::skip)] // Diagnostic output only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTable")
            .field("jobs", &self.jobs.len())
            .field("generation", &self.generation)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}
