//! # Identity and Key Material
//!
//! Core identity types used throughout palaver:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret seed + public key)
//! - [`Identity`]: 32-byte public key serving as a participant's unique
//!   identifier
//!
//! ## Identity Model
//!
//! Palaver uses a simple identity model: **Identity = Ed25519 Public Key**.
//! Possession of the private seed proves identity; there is no user
//! directory or registration database. The credential issuer binds a
//! display name and permissions to a public key inside a signed token, but
//! the key itself is the identity.
//!
//! ## On-Disk Material
//!
//! The only persisted artifacts are credential bundles: a signed identity
//! token plus the hex-encoded private seed, wrapped in banner delimiters
//! (see [`format_credentials`] / [`parse_credentials`]). Everything else is
//! in-memory and rebuilt from live traffic.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as seconds since Unix epoch.
/// Used for issue/expiry timestamps in signed claims.
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, PartialEq)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    /// One keypair is minted per issued credential and never reused.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_seed_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Parse a hex-encoded 32-byte seed, as stored in credential bundles
    /// and signing-key files.
    pub fn from_seed_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self::from_seed_bytes(&arr))
    }

    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Hex encoding of the private seed. Treat as a secret.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.seed_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

/// A participant's public identity: the raw 32-byte Ed25519 public key.
///
/// Serialized as lowercase hex (64 characters) in claim payloads and
/// message subjects.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that this identity is usable for signature verification.
    ///
    /// Rejects all-zero / all-0xFF bytes and anything that is not a valid
    /// Ed25519 public key point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identity::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Credential Bundles
// ============================================================================

const TOKEN_BEGIN: &str = "-----BEGIN PALAVER USER TOKEN-----";
const TOKEN_END: &str = "------END PALAVER USER TOKEN------";
const SEED_BEGIN: &str = "-----BEGIN USER PRIVATE SEED-----";
const SEED_END: &str = "------END USER PRIVATE SEED------";

/// Format an issued token and private seed as a credential bundle for
/// human/file consumption. The seed banner carries an explicit secrecy
/// warning.
pub fn format_credentials(token: &str, seed_hex: &str) -> String {
    format!(
        "\n{TOKEN_BEGIN}\n{token}\n{TOKEN_END}\n\n\
         ************************* IMPORTANT *************************\n\
         Private seeds are sensitive and should be treated as secrets.\n\n\
         {SEED_BEGIN}\n{seed_hex}\n{SEED_END}\n\n\
         *************************************************************\n"
    )
}

/// Error type for credential bundle parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    /// A banner-delimited section is missing or unterminated.
    MissingSection(&'static str),
    /// The private seed is not valid 32-byte hex.
    BadSeed,
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::MissingSection(which) => {
                write!(f, "credentials missing {which} section")
            }
            CredentialsError::BadSeed => write!(f, "credentials contain an invalid private seed"),
        }
    }
}

impl std::error::Error for CredentialsError {}

/// Parse a credential bundle back into its signed token text and keypair.
///
/// Accepts the exact output of [`format_credentials`]; tolerant of
/// surrounding whitespace but not of reordered or missing sections.
pub fn parse_credentials(contents: &str) -> Result<(String, Keypair), CredentialsError> {
    let token = extract_section(contents, TOKEN_BEGIN, TOKEN_END)
        .ok_or(CredentialsError::MissingSection("user token"))?;
    let seed = extract_section(contents, SEED_BEGIN, SEED_END)
        .ok_or(CredentialsError::MissingSection("private seed"))?;

    let keypair = Keypair::from_seed_hex(&seed).map_err(|_| CredentialsError::BadSeed)?;
    Ok((token, keypair))
}

fn extract_section(contents: &str, begin: &str, end: &str) -> Option<String> {
    let start = contents.find(begin)? + begin.len();
    let rest = &contents[start..];
    let stop = rest.find(end)?;
    let body = rest[..stop].trim();
    if body.is_empty() {
        return None;
    }
    Some(body.to_string())
}
