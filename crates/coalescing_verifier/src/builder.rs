// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`CoalescingVerifier`].

use tick::Clock;

use crate::CoalescingVerifier;
use crate::cache::system_clock;
use crate::telemetry::{DEFAULT_NAME, Telemetry, VerifierName};
use crate::verifier::Verifier;

/// Configures a [`CoalescingVerifier`] before construction.
///
/// Created by [`CoalescingVerifier::builder`].
///
/// # Examples
///
/// ```
/// # use coalescing_verifier::{CoalescingVerifier, Completion, Started, Verifier};
/// # struct Echo;
/// # impl Verifier for Echo {
/// #     type Key = String;
/// #     type Output = String;
/// #     type Config = ();
/// #     type Pending = ();
/// #     fn start(&mut self, key: &String, _: Completion<String>) -> Started<String, ()> {
/// #         Started::Ready(key.clone())
/// #     }
/// #     fn set_config(&mut self, _: ()) {}
/// # }
/// let verifier = CoalescingVerifier::builder(Echo)
///     .name("cert_verifier")
///     .logs()
///     .build();
///
/// assert_eq!(verifier.name(), "cert_verifier");
/// ```
#[derive(Debug)]
pub struct CoalescingVerifierBuilder<V> {
    verifier: V,
    name: VerifierName,
    clock: Clock,
    logs: bool,
}

impl<V: Verifier> CoalescingVerifierBuilder<V> {
    pub(crate) fn new(verifier: V) -> Self {
        Self {
            verifier,
            name: DEFAULT_NAME,
            clock: system_clock(),
            logs: false,
        }
    }

    /// Sets the name attached to every log event of this instance.
    #[must_use]
    pub fn name(self, name: VerifierName) -> Self {
        Self { name, ..self }
    }

    /// Sets the clock that times jobs. Defaults to the system clock.
    ///
    /// Job durations reported in logs are measured with this clock, so tests can drive them
    /// through a `tick::ClockControl`.
    #[must_use]
    pub fn clock(self, clock: Clock) -> Self {
        Self { clock, ..self }
    }

    /// Enables structured logging of job and request lifecycle events via `tracing`.
    #[must_use]
    pub fn logs(self) -> Self {
        Self { logs: true, ..self }
    }

    /// Builds the verifier.
    #[must_use]
    pub fn build(self) -> CoalescingVerifier<V> {
        CoalescingVerifier::with_telemetry(self.verifier, self.clock, Telemetry::new(self.name, self.logs))
    }
}
