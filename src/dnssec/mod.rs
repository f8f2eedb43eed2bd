pub mod algorithm;
pub mod denial;
pub mod digest;
pub mod key_tag;
pub mod trust_anchor;
pub mod validator;

pub use algorithm::Algorithm;
pub use digest::DigestType;
pub use key_tag::calculate_key_tag;
pub use trust_anchor::{TrustAnchor, TrustAnchorStore};

/// Security state of a query or of a validated RR set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    /// Nothing established yet.
    Indeterminate,
    /// Provably outside any chain of trust.
    Insecure,
    /// Validated against a chained trust anchor.
    Secure,
    /// Validation was attempted and failed; terminal.
    Bogus,
}

impl SecurityState {
    /// Apply a transition while keeping the state monotonic: trust may only
    /// be lost within a query lifetime, and BOGUS absorbs everything.
    pub fn transition(self, to: SecurityState) -> SecurityState {
        match (self, to) {
            (SecurityState::Bogus, _) => SecurityState::Bogus,
            (_, SecurityState::Bogus) => SecurityState::Bogus,
            (SecurityState::Indeterminate, next) => next,
            (SecurityState::Insecure, _) => SecurityState::Insecure,
            (SecurityState::Secure, SecurityState::Insecure) => SecurityState::Insecure,
            (SecurityState::Secure, _) => SecurityState::Secure,
        }
    }
}

/// DNSSEC constants
pub mod constants {
    /// EDNS payload size advertised for DNSSEC-capable queries (RFC 4035).
    pub const DNSSEC_UDP_SIZE: u16 = 4096;

    /// Cap on NSEC3 iterations before the proof is treated as bogus
    /// (RFC 5155 §10.3 guidance).
    pub const MAX_NSEC3_ITERATIONS: u16 = 2500;
}
