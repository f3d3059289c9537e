//! # Signature Primitives
//!
//! Domain-separated Ed25519 signing and verification used by every signed
//! claim in palaver.
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted (no algorithm negotiation)
//! - Domain separation prevents cross-protocol signature replay: a signed
//!   chat claim can never be replayed as a credential token and vice versa
//! - Verification uses `verify_strict` to reject malleable signatures

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Identity, Keypair};

/// Error type for signature verification failures.
/// Used across all palaver signature verification (claims, tokens).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: each signed data type uses a unique prefix so signatures cannot
// be reused in a different context.

/// Domain separation prefix for chat claim signatures (heartbeats, posts,
/// direct messages, identity tokens).
pub const CLAIM_SIGNATURE_DOMAIN: &[u8] = b"palaver-claim-v1:";

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
/// Returns a 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature
/// against the claimed signer's identity (public key).
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
