// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates several callers verifying the same certificate chain at once.
//!
//! Five callers ask for the same verification before it finishes. The underlying verifier
//! is started once; one caller loses interest and drops its request; the remaining four
//! each receive their own copy of the result when the verification completes.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use coalescing_verifier::cert::{CertRequest, CertVerifyResult};
use coalescing_verifier::{CoalescingVerifier, Completion, Outcome, Started, Verifier};
use tracing::Level;

/// Holds on to every verification until `main` decides it is done.
struct SlowVerifier {
    parked: Rc<RefCell<Vec<(CertRequest, Completion<CertVerifyResult>)>>>,
}

impl Verifier for SlowVerifier {
    type Key = CertRequest;
    type Output = CertVerifyResult;
    type Config = ();
    type Pending = ();

    fn start(&mut self, key: &CertRequest, completion: Completion<CertVerifyResult>) -> Started<CertVerifyResult, ()> {
        println!("  [verifier] building chain for {}", key.hostname());
        self.parked.borrow_mut().push((key.clone(), completion));
        Started::Pending(())
    }

    fn set_config(&mut self, (): ()) {}
}

fn main() {
    let subscriber = tracing_subscriber::fmt().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("no other global subscriber is installed");

    let parked = Rc::new(RefCell::new(Vec::new()));
    let verifier = CoalescingVerifier::builder(SlowVerifier {
        parked: Rc::clone(&parked),
    })
    .name("example_verifier")
    .logs()
    .build();

    let key = CertRequest::new(Bytes::from_static(b"leaf"), "a.example").with_intermediate(Bytes::from_static(b"root"));

    println!("Starting 5 verifications of a.example...\n");

    let mut requests = Vec::new();
    for caller in 1..=5 {
        let outcome = verifier.verify(key.clone(), move |result: CertVerifyResult| {
            println!(
                "  [caller {caller}] verified={} chain_len={}",
                result.is_ok(),
                result.verified_chain.len()
            );
        });

        match outcome {
            Outcome::Pending(request) => requests.push(request),
            Outcome::Ready(result) => println!("  [caller {caller}] answered synchronously: {result:?}"),
        }
    }

    println!("\nCaller 3 gives up.\n");
    drop(requests.remove(2));

    println!("Verifier was started {} time(s).\n", parked.borrow().len());

    let (request, completion) = parked.borrow_mut().remove(0);
    let mut chain = vec![request.certificate().clone()];
    chain.extend(request.intermediates().iter().cloned());
    completion.complete(CertVerifyResult::verified(chain));

    println!("\nJobs still in flight: {:?}", verifier.job_counts());
}
