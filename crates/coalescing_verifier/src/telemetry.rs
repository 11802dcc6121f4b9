// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured logging of job and request lifecycle events.
//!
//! Events are a side channel: nothing here may influence control flow.

use std::time::Duration;

use tracing::Level;

use crate::job::JobId;
use crate::request::RequestId;

/// Static name identifying a verifier instance in logs.
pub type VerifierName = &'static str;

pub(crate) const DEFAULT_NAME: VerifierName = "coalescing_verifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifierActivity {
    JobStarted,
    JobCompletedSync,
    JobCompleted,
    JobCancelled,
    JobAborted,
    RequestAttached,
    RequestDetached,
    RequestCompleted,
    GenerationAdvanced,
}

impl VerifierActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobStarted => "job.started",
            Self::JobCompletedSync => "job.completed_sync",
            Self::JobCompleted => "job.completed",
            Self::JobCancelled => "job.cancelled",
            Self::JobAborted => "job.aborted",
            Self::RequestAttached => "request.attached",
            Self::RequestDetached => "request.detached",
            Self::RequestCompleted => "request.completed",
            Self::GenerationAdvanced => "generation.advanced",
        }
    }

    pub fn level(self) -> Level {
        match self {
            Self::JobStarted | Self::JobCompletedSync | Self::RequestAttached | Self::RequestCompleted => Level::DEBUG,
            Self::JobCompleted | Self::JobCancelled | Self::JobAborted | Self::RequestDetached | Self::GenerationAdvanced => {
                Level::INFO
            }
        }
    }
}

/// Identifies what an event is about. Fields that do not apply stay `None`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EventScope {
    pub job: Option<JobId>,
    pub request: Option<RequestId>,
    pub generation: Option<u64>,
    pub duration: Option<Duration>,
    pub first_job: bool,
}

impl EventScope {
    pub fn job(job: JobId, generation: u64) -> Self {
        Self {
            job: Some(job),
            generation: Some(generation),
            ..Self::default()
        }
    }

    pub fn request(job: JobId, request: RequestId) -> Self {
        Self {
            job: Some(job),
            request: Some(request),
            ..Self::default()
        }
    }

    pub fn generation(generation: u64) -> Self {
        Self {
            generation: Some(generation),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_duration(self, duration: Duration, first_job: bool) -> Self {
        Self {
            duration: Some(duration),
            first_job,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Telemetry {
    name: VerifierName,
    logging_enabled: bool,
}

impl Telemetry {
    pub fn new(name: VerifierName, logging_enabled: bool) -> Self {
        Self { name, logging_enabled }
    }

    pub fn name(&self) -> VerifierName {
        self.name
    }

    #[inline]
    pub fn record(&self, activity: VerifierActivity, scope: EventScope) {
        if self.logging_enabled {
            Self::emit(self.name, activity, scope);
        }
    }

    fn emit(name: VerifierName, activity: VerifierActivity, scope: EventScope) {
        let act = activity.as_str();
        let job = scope.job.map(JobId::get);
        let request = scope.request.map(RequestId::get);
        let duration_ns = scope.duration.as_ref().map(Duration::as_nanos);
        let first_job = scope.first_job;

        // Tracing levels must be constant at the call site.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    verifier.name = name,
                    verifier.activity = act,
                    job.id = ?job,
                    job.generation = ?scope.generation,
                    job.duration_ns = ?duration_ns,
                    job.first = first_job,
                    request.id = ?request,
                    "verifier.event"
                )
            };
        }

        if activity.level() == Level::INFO {
            emit_event!(info);
        } else {
            emit_event!(debug);
        }
    }
}
