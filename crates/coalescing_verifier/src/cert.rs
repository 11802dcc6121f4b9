// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request, result and configuration types for certificate chain verification.
//!
//! A [`Verifier`][crate::Verifier] for certificates uses [`CertRequest`] as its key,
//! [`CertVerifyResult`] as its output and [`CertVerifierConfig`] as its configuration.

use bytes::Bytes;
use thiserror::Error;

/// Options that change how a single verification is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct VerifyFlags {
    /// Never fetch missing intermediates, CRLs or OCSP responses from the network.
    pub disable_network_fetches: bool,
}

impl VerifyFlags {
    /// Flags with every option off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            disable_network_fetches: false,
        }
    }

    /// Disables network fetches during verification.
    #[must_use]
    pub const fn with_network_fetches_disabled(self) -> Self {
        Self {
            disable_network_fetches: true,
            ..self
        }
    }
}

/// Everything that determines the outcome of verifying a certificate chain.
///
/// Two equal requests always yield the same result under the same configuration,
/// which is what allows concurrent verifications of equal requests to be coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertRequest {
    certificate: Bytes,
    intermediates: Vec<Bytes>,
    hostname: String,
    flags: VerifyFlags,
    ocsp_response: Bytes,
    sct_list: Bytes,
}

impl CertRequest {
    /// Creates a request to verify the DER-encoded `certificate` for `hostname`.
    #[must_use]
    pub fn new(certificate: impl Into<Bytes>, hostname: impl Into<String>) -> Self {
        Self {
            certificate: certificate.into(),
            intermediates: Vec::new(),
            hostname: hostname.into(),
            flags: VerifyFlags::new(),
            ocsp_response: Bytes::new(),
            sct_list: Bytes::new(),
        }
    }

    /// Adds a DER-encoded intermediate certificate supplied by the peer.
    #[must_use]
    pub fn with_intermediate(mut self, intermediate: impl Into<Bytes>) -> Self {
        self.intermediates.push(intermediate.into());
        self
    }

    /// Sets per-request verification flags.
    #[must_use]
    pub fn with_flags(self, flags: VerifyFlags) -> Self {
        Self { flags, ..self }
    }

    /// Attaches a stapled OCSP response.
    #[must_use]
    pub fn with_ocsp_response(self, ocsp_response: impl Into<Bytes>) -> Self {
        Self {
            ocsp_response: ocsp_response.into(),
            ..self
        }
    }

    /// Attaches a TLS-provided signed certificate timestamp list.
    #[must_use]
    pub fn with_sct_list(self, sct_list: impl Into<Bytes>) -> Self {
        Self {
            sct_list: sct_list.into(),
            ..self
        }
    }

    /// The DER-encoded leaf certificate.
    #[must_use]
    pub fn certificate(&self) -> &Bytes {
        &self.certificate
    }

    /// Intermediates supplied by the peer, in the order received.
    #[must_use]
    pub fn intermediates(&self) -> &[Bytes] {
        &self.intermediates
    }

    /// The hostname the certificate must be valid for.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Per-request verification flags.
    #[must_use]
    pub fn flags(&self) -> VerifyFlags {
        self.flags
    }

    /// The stapled OCSP response, empty if none.
    #[must_use]
    pub fn ocsp_response(&self) -> &Bytes {
        &self.ocsp_response
    }

    /// The signed certificate timestamp list, empty if none.
    #[must_use]
    pub fn sct_list(&self) -> &Bytes {
        &self.sct_list
    }
}

/// Why a certificate chain was rejected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CertError {
    /// The certificate does not match the requested hostname.
    #[error("certificate is not valid for the requested hostname")]
    CommonNameInvalid,

    /// The certificate is expired or not yet valid.
    #[error("certificate is outside its validity period")]
    DateInvalid,

    /// No path to a trusted root could be built.
    #[error("certificate is not issued by a trusted authority")]
    AuthorityInvalid,

    /// The certificate or an issuer has been revoked.
    #[error("certificate has been revoked")]
    Revoked,

    /// Revocation status was required but could not be determined.
    #[error("unable to check certificate revocation status")]
    UnableToCheckRevocation,

    /// The chain uses a signature algorithm that is no longer accepted.
    #[error("certificate chain uses a weak signature algorithm")]
    WeakSignatureAlgorithm,

    /// The certificate could not be parsed or is otherwise malformed.
    #[error("certificate is invalid")]
    Invalid,
}

/// Bits describing everything noteworthy about a verified chain, errors or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CertStatus(u32);

impl CertStatus {
    /// Revocation checking was performed.
    pub const REV_CHECKING_ENABLED: Self = Self(1 << 0);
    /// The chain contains a SHA-1 signature.
    pub const SHA1_SIGNATURE_PRESENT: Self = Self(1 << 1);
    /// The leaf is an EV certificate.
    pub const IS_EV: Self = Self(1 << 2);
    /// The chain did not meet certificate transparency requirements.
    pub const CT_COMPLIANCE_FAILED: Self = Self(1 << 3);

    /// No bits set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with the bits of `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Outcome of verifying a [`CertRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertVerifyResult {
    /// The verification verdict, passed through unchanged from the verifier.
    pub status: Result<(), CertError>,
    /// Additional properties of the chain.
    pub cert_status: CertStatus,
    /// The chain that was actually verified, leaf first.
    pub verified_chain: Vec<Bytes>,
    /// Whether the chain terminates in a root shipped with the platform, as opposed to
    /// one installed locally.
    pub is_issued_by_known_root: bool,
    /// SHA-256 hashes of the subject public key info of every certificate in the chain.
    pub public_key_hashes: Vec<[u8; 32]>,
}

impl CertVerifyResult {
    /// A successful result for `verified_chain`.
    #[must_use]
    pub fn verified(verified_chain: Vec<Bytes>) -> Self {
        Self {
            status: Ok(()),
            cert_status: CertStatus::empty(),
            verified_chain,
            is_issued_by_known_root: false,
            public_key_hashes: Vec::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: CertError) -> Self {
        Self {
            status: Err(error),
            cert_status: CertStatus::empty(),
            verified_chain: Vec::new(),
            is_issued_by_known_root: false,
            public_key_hashes: Vec::new(),
        }
    }

    /// Whether the chain was accepted.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Whether any signature in the verified chain uses SHA-1.
    #[must_use]
    pub fn has_sha1(&self) -> bool {
        self.cert_status.contains(CertStatus::SHA1_SIGNATURE_PRESENT)
    }
}

/// Settings of a certificate verifier that apply to every request.
///
/// Changing them through [`CoalescingVerifier::set_config`][crate::CoalescingVerifier::set_config]
/// starts a new generation: in-flight verifications under the old settings are never
/// joined by new callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CertVerifierConfig {
    /// Check revocation status online.
    pub enable_rev_checking: bool,
    /// Require revocation information for chains ending in locally installed roots.
    pub require_rev_checking_local_anchors: bool,
    /// Accept SHA-1 signatures in chains ending in locally installed roots.
    pub enable_sha1_local_anchors: bool,
    /// Skip the distrust policy for legacy Symantec roots.
    pub disable_symantec_enforcement: bool,
    /// Extra DER-encoded roots to trust.
    pub additional_trust_anchors: Vec<Bytes>,
}

impl CertVerifierConfig {
    /// Default settings: no revocation checking, no extra trust anchors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables online revocation checking.
    #[must_use]
    pub fn with_rev_checking(self, enabled: bool) -> Self {
        Self {
            enable_rev_checking: enabled,
            ..self
        }
    }

    /// Requires revocation information for locally installed roots.
    #[must_use]
    pub fn with_required_rev_checking_local_anchors(self, required: bool) -> Self {
        Self {
            require_rev_checking_local_anchors: required,
            ..self
        }
    }

    /// Accepts SHA-1 in chains ending in locally installed roots.
    #[must_use]
    pub fn with_sha1_local_anchors(self, enabled: bool) -> Self {
        Self {
            enable_sha1_local_anchors: enabled,
            ..self
        }
    }

    /// Disables the legacy Symantec distrust policy.
    #[must_use]
    pub fn with_symantec_enforcement_disabled(self, disabled: bool) -> Self {
        Self {
            disable_symantec_enforcement: disabled,
            ..self
        }
    }

    /// Trusts an additional DER-encoded root.
    #[must_use]
    pub fn with_trust_anchor(mut self, anchor: impl Into<Bytes>) -> Self {
        self.additional_trust_anchors.push(anchor.into());
        self
    }
}
