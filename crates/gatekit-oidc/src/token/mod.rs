//! Token inspection, key resolution and verification.
//!
//! - [`codec`] - unverified JWT segment decoding
//! - [`keyset`] - indexed JSON Web Key Set snapshots
//! - [`resolver`] - static / certificate-chain / dynamic key resolution
//! - [`verifier`] - JWS verification and claim validation

pub mod codec;
pub mod keyset;
pub mod resolver;
pub mod verifier;

pub use codec::{decode_claims, decode_header, is_opaque};
pub use keyset::{KeySet, KeyType, VerificationKey};
pub use resolver::{
    CertChainResolver, DynamicKeyResolver, DynamicResolverConfig, KeyResolver, ResolvedKey,
    StaticKeyResolver, TokenHeaders,
};
pub use verifier::{
    AudienceRequirement, ClaimValidator, TokenRequirements, VerifiedClaims, issue_self_signed,
    verify, verify_self_signed, verify_with_key,
};
