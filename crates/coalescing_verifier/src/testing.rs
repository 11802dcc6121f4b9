// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles: a verifier driven by hand and a log capture buffer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use crate::verifier::{Completion, Started, Verifier};

/// Output of [`FakeVerifier`]: a status code plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Verdict {
    pub code: i32,
    pub payload: String,
}

impl Verdict {
    pub fn ok(payload: &str) -> Self {
        Self {
            code: 0,
            payload: payload.to_string(),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            code,
            payload: String::new(),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    key: String,
    config: u32,
    completion: Option<Completion<Verdict>>,
}

#[derive(Debug, Default)]
struct FakeState {
    config: u32,
    next_id: u64,
    starts: Vec<String>,
    in_flight: Vec<InFlight>,
    cancelled: Vec<String>,
    immediate: HashMap<String, Verdict>,
}

/// A verifier whose verifications stay in flight until a test completes them via
/// [`FakeControl`].
#[derive(Debug)]
pub(crate) struct FakeVerifier {
    state: Rc<RefCell<FakeState>>,
}

/// Test-side handle to the state shared with a [`FakeVerifier`].
#[derive(Debug, Clone)]
pub(crate) struct FakeControl {
    state: Rc<RefCell<FakeState>>,
}

/// Cancellation handle of a [`FakeVerifier`] verification.
#[derive(Debug)]
pub(crate) struct FakePending {
    state: Rc<RefCell<FakeState>>,
    id: u64,
}

impl Drop for FakePending {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        if let Some(position) = state.in_flight.iter().position(|f| f.id == self.id) {
            let cancelled = state.in_flight.remove(position);
            state.cancelled.push(cancelled.key);
        }
    }
}

impl FakeVerifier {
    pub fn new() -> (Self, FakeControl) {
        let state = Rc::new(RefCell::new(FakeState::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            FakeControl { state },
        )
    }
}

impl Verifier for FakeVerifier {
    type Key = String;
    type Output = Verdict;
    type Config = u32;
    type Pending = FakePending;

    fn start(&mut self, key: &String, completion: Completion<Verdict>) -> Started<Verdict, FakePending> {
        let mut state = self.state.borrow_mut();
        state.starts.push(key.clone());

        if let Some(verdict) = state.immediate.get(key).cloned() {
            return Started::Ready(verdict);
        }

        let id = state.next_id;
        state.next_id += 1;
        let config = state.config;
        state.in_flight.push(InFlight {
            id,
            key: key.clone(),
            config,
            completion: Some(completion),
        });

        Started::Pending(FakePending {
            state: Rc::clone(&self.state),
            id,
        })
    }

    fn set_config(&mut self, config: u32) {
        self.state.borrow_mut().config = config;
    }
}

impl FakeControl {
    /// Makes every later verification of `key` finish synchronously with `verdict`.
    pub fn answer_immediately(&self, key: &str, verdict: Verdict) {
        self.state.borrow_mut().immediate.insert(key.to_string(), verdict);
    }

    pub fn starts(&self) -> Vec<String> {
        self.state.borrow().starts.clone()
    }

    pub fn start_count(&self, key: &str) -> usize {
        self.state.borrow().starts.iter().filter(|k| *k == key).count()
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    /// Configurations the in-flight verifications of `key` were started under, oldest first.
    pub fn in_flight_configs(&self, key: &str) -> Vec<u32> {
        self.state
            .borrow()
            .in_flight
            .iter()
            .filter(|f| f.key == key)
            .map(|f| f.config)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.borrow().cancelled.clone()
    }

    /// Completes the oldest in-flight verification of `key`.
    ///
    /// The completion runs after the fake's own state is released, so callbacks may
    /// freely start or cancel verifications.
    pub fn complete(&self, key: &str, verdict: Verdict) {
        let completion = {
            let mut state = self.state.borrow_mut();
            let position = state
                .in_flight
                .iter()
                .position(|f| f.key == key)
                .unwrap_or_else(|| panic!("no verification of {key} in flight"));
            let mut finished = state.in_flight.remove(position);
            finished.completion.take().expect("completion already taken")
        };

        completion.complete(verdict);
    }

    /// Takes the completion of the oldest in-flight verification of `key` while leaving
    /// it in flight, so the test can invoke it at an arbitrary later point.
    pub fn steal_completion(&self, key: &str) -> Completion<Verdict> {
        let mut state = self.state.borrow_mut();
        state
            .in_flight
            .iter_mut()
            .find(|f| f.key == key)
            .and_then(|f| f.completion.take())
            .unwrap_or_else(|| panic!("no completion for {key} available"))
    }

    /// Creates a cancellation handle that is not tied to any cache, for exercising jobs directly.
    pub fn detached_pending(&self, key: &str) -> FakePending {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        let config = state.config;
        state.in_flight.push(InFlight {
            id,
            key: key.to_string(),
            config,
            completion: None,
        });

        FakePending {
            state: Rc::clone(&self.state),
            id,
        }
    }
}

/// Captures formatted `tracing` output for inspection.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    /// Number of captured lines mentioning `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.output().lines().filter(|line| line.contains(needle)).count()
    }

    pub fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(
            output.contains(expected),
            "log output does not contain '{expected}', got:\n{output}"
        );
    }

    /// A subscriber writing to this buffer; install with `tracing::subscriber::set_default`.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + use<> {
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

#[derive(Debug)]
pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
