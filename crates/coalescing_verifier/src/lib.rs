// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Collapses concurrent identical verification requests into a single underlying operation.
//!
//! [`CoalescingVerifier`] sits in front of an expensive, asynchronous, side-effect-free
//! [`Verifier`] (the motivating case is certificate chain verification, see [`cert`]).
//! Callers that ask for the same key while a verification is in flight share that one
//! verification, yet each of them holds an independent, cancellable [`Request`] and has
//! its own callback invoked with its own copy of the result.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use coalescing_verifier::{CoalescingVerifier, Completion, Started, Verifier};
//!
//! # #[derive(Default)]
//! # struct Parked(Rc<RefCell<Vec<Completion<bool>>>>);
//! # impl Verifier for Parked {
//! #     type Key = String;
//! #     type Output = bool;
//! #     type Config = ();
//! #     type Pending = ();
//! #     fn start(&mut self, _: &String, completion: Completion<bool>) -> Started<bool, ()> {
//! #         self.0.borrow_mut().push(completion);
//! #         Started::Pending(())
//! #     }
//! #     fn set_config(&mut self, _: ()) {}
//! # }
//! let parked = Rc::new(RefCell::new(Vec::new()));
//! let verifier = CoalescingVerifier::new(Parked(Rc::clone(&parked)));
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = Rc::clone(&seen);
//! let first = verifier.verify("a.example:443".to_string(), move |ok| log.borrow_mut().push(("first", ok)));
//! let log = Rc::clone(&seen);
//! let second = verifier.verify("a.example:443".to_string(), move |ok| log.borrow_mut().push(("second", ok)));
//! assert!(first.is_pending() && second.is_pending());
//!
//! // Dropping a request is how a caller cancels.
//! drop(second);
//!
//! let completion = parked.borrow_mut().pop().unwrap();
//! completion.complete(true);
//! assert_eq!(*seen.borrow(), vec![("first", true)]);
//! ```
//!
//! # Cancellation
//!
//! Dropping a [`Request`] detaches the caller. When the last request of an in-flight
//! verification is dropped, the verification itself is cancelled by dropping the
//! verifier's cancellation handle.
//!
//! # Reentrancy
//!
//! Callbacks run synchronously inside [`Completion::complete`], one caller at a time in
//! the order the callers joined. A callback may drop any request, start new
//! verifications (including of the same key, which then joins the ongoing hand-out),
//! or drop the [`CoalescingVerifier`] itself, in which case no further callback runs.
//!
//! # Generations
//!
//! [`CoalescingVerifier::set_config`] and [`CoalescingVerifier::invalidate`] start a new
//! generation. Verifications of older generations still finish for their callers, but
//! are never joined by new ones.
//!
//! # Async
//!
//! [`CoalescingVerifier::verify_future`] wraps the callback interface in a [`VerifyFuture`].

mod builder;
mod cache;
pub mod cert;
mod error;
mod future;
mod job;
mod request;
mod telemetry;
mod verifier;

#[cfg(test)]
mod testing;

#[doc(inline)]
pub use builder::CoalescingVerifierBuilder;
#[doc(inline)]
pub use cache::{CoalescingVerifier, Outcome};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use future::VerifyFuture;
#[doc(inline)]
pub use job::JobCounts;
#[doc(inline)]
pub use request::Request;
#[doc(inline)]
pub use telemetry::VerifierName;
#[doc(inline)]
pub use verifier::{Completion, Started, Verifier};
