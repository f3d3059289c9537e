//! # Signed Claim Codec
//!
//! Every payload on the wire — heartbeats, channel posts, direct messages,
//! issued identity tokens, and the issuer's account document — is a signed
//! claim in a compact three-segment format:
//!
//! ```text
//! base64url(header JSON) . base64url(payload JSON) . base64url(signature)
//! ```
//!
//! The signature is Ed25519 over the first two segments with the
//! [`CLAIM_SIGNATURE_DOMAIN`] prefix, verified against the `iss` public key
//! embedded in the payload. Decoding verifies the signature; a decoded
//! [`Claims`] value is therefore authentic, though not yet semantically
//! validated (see [`crate::validate`]).
//!
//! ## Claim Kinds
//!
//! Payloads are strongly typed via [`ClaimBody`]; the untyped "bag of
//! fields" never escapes this module. Common envelope fields:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `jti` | Unique token identifier (content-derived, used for dedup) |
//! | `iat` | Issue time, seconds since Unix epoch |
//! | `exp` | Optional expiry, seconds since Unix epoch |
//! | `iss` | Signing public key |
//! | `sub` | Claim subject: a public key, channel name, or recipient key |
//! | `name` | Display name carried by the claim |

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, CLAIM_SIGNATURE_DOMAIN};
use crate::identity::{now_secs, Identity, Keypair};
use crate::permissions::Permissions;

/// Algorithm tag carried in every claim header.
const CLAIM_ALG: &str = "ed25519";

/// Type tag carried in every claim header.
const CLAIM_TYP: &str = "PLV";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

/// The signed payload common to every claim kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Unique token identifier; dedup key for broadcast and direct claims.
    pub jti: String,
    /// Issue time (seconds since Unix epoch).
    pub iat: u64,
    /// Expiry (seconds since Unix epoch); absent claims never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// The signing public key. Decoding verifies the signature against it.
    pub iss: Identity,
    /// Claim subject: originating key (heartbeat), channel name (post),
    /// recipient key (direct message), or granted key (identity token).
    pub sub: String,
    /// Display name carried by the claim.
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub body: ClaimBody,
}

/// Strongly-typed claim payloads, one variant per claim kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimBody {
    /// The issuer's account document. Self-signed; lists the delegated
    /// signing keys allowed to mint identity tokens on its behalf.
    Account {
        #[serde(default)]
        signing_keys: Vec<Identity>,
    },
    /// An issued identity token binding a public key (`sub`) to a display
    /// name, expiry, payload limit, and fixed allow-lists.
    User {
        issuer_account: Identity,
        max_payload: u64,
        permissions: Permissions,
    },
    /// Periodic presence announcement. `sub` = originating public key.
    Heartbeat {
        #[serde(default)]
        newcomer: bool,
    },
    /// A chat message: channel post (`sub` = channel name) or direct
    /// message (`sub` = recipient public key, hex).
    Post { text: String },
}

/// Process-wide counter folded into token identifiers so two claims minted
/// in the same second by the same key still get distinct ids.
static CLAIM_SEQ: AtomicU64 = AtomicU64::new(1);

/// Compute a content-derived unique token identifier.
fn token_id(iss: &Identity, sub: &str, iat: u64) -> String {
    let seq = CLAIM_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"palaver-claim-id-v1:");
    hasher.update(iss.as_bytes());
    hasher.update(sub.as_bytes());
    hasher.update(&iat.to_le_bytes());
    hasher.update(&seq.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

impl Claims {
    /// Build a new claim issued now, with a fresh token identifier.
    pub fn new(iss: Identity, sub: String, name: String, exp: Option<u64>, body: ClaimBody) -> Self {
        let iat = now_secs();
        Self {
            jti: token_id(&iss, &sub, iat),
            iat,
            exp,
            iss,
            sub,
            name,
            body,
        }
    }

    /// Compose a presence heartbeat for the local identity.
    /// `freshness_secs` should be 2-3x the broadcast period so one dropped
    /// heartbeat does not flip receivers that track expiry to "stale".
    pub fn heartbeat(me: Identity, name: &str, freshness_secs: u64, newcomer: bool) -> Self {
        Self::new(
            me,
            me.to_hex(),
            name.to_string(),
            Some(now_secs() + freshness_secs),
            ClaimBody::Heartbeat { newcomer },
        )
    }

    /// Compose a chat message. `target` is a channel name for broadcast
    /// posts or a recipient public key (hex) for direct messages.
    pub fn post(me: Identity, name: &str, target: &str, text: &str) -> Self {
        Self::new(
            me,
            target.to_string(),
            name.to_string(),
            None,
            ClaimBody::Post {
                text: text.to_string(),
            },
        )
    }

    /// True if the claim carries an expiry in the past.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.exp, Some(exp) if exp < now)
    }
}

/// Error type for claim decoding failures.
#[derive(Debug)]
pub enum DecodeError {
    /// Not three dot-separated base64url segments, or bad base64.
    Structure(String),
    /// Header or payload JSON failed to parse.
    Json(String),
    /// Header declares an algorithm or type we do not speak.
    UnsupportedHeader(String),
    /// Signature did not verify against the embedded issuer key.
    Signature(SignatureError),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Structure(msg) => write!(f, "malformed claim: {msg}"),
            DecodeError::Json(msg) => write!(f, "claim payload is not valid JSON: {msg}"),
            DecodeError::UnsupportedHeader(msg) => write!(f, "unsupported claim header: {msg}"),
            DecodeError::Signature(err) => write!(f, "claim signature rejected: {err}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode and sign a claim with the given keypair.
///
/// The keypair must match `claims.iss`; the issuer field is what receivers
/// verify against.
pub fn encode_signed(claims: &Claims, keypair: &Keypair) -> anyhow::Result<String> {
    debug_assert_eq!(
        claims.iss,
        keypair.identity(),
        "claim iss must match the signing keypair"
    );

    let header = Header {
        typ: CLAIM_TYP.to_string(),
        alg: CLAIM_ALG.to_string(),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);

    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = sign_with_domain(keypair, CLAIM_SIGNATURE_DOMAIN, signing_input.as_bytes());

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Decode a claim and verify its signature against the embedded `iss` key.
///
/// Structural and semantic validation (expiry, required fields) happens in
/// [`crate::validate`]; this function only establishes authenticity.
pub fn decode_verified(raw: &str) -> Result<Claims, DecodeError> {
    let mut segments = raw.trim().split('.');
    let (header_b64, payload_b64, sig_b64) =
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => {
                return Err(DecodeError::Structure(
                    "expected three dot-separated segments".to_string(),
                ))
            }
        };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| DecodeError::Structure(format!("header base64: {e}")))?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| DecodeError::Structure(format!("payload base64: {e}")))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| DecodeError::Structure(format!("signature base64: {e}")))?;

    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    if header.alg != CLAIM_ALG || header.typ != CLAIM_TYP {
        return Err(DecodeError::UnsupportedHeader(format!(
            "typ={} alg={}",
            header.typ, header.alg
        )));
    }

    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|e| DecodeError::Json(e.to_string()))?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    verify_with_domain(
        &claims.iss,
        CLAIM_SIGNATURE_DOMAIN,
        signing_input.as_bytes(),
        &signature,
    )
    .map_err(DecodeError::Signature)?;

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::scope_permissions;

    #[test]
    fn heartbeat_roundtrip() {
        let keypair = Keypair::generate();
        let claims = Claims::heartbeat(keypair.identity(), "derek", 60, true);

        let encoded = encode_signed(&claims, &keypair).expect("encode");
        let decoded = decode_verified(&encoded).expect("decode");

        assert_eq!(decoded, claims);
        assert_eq!(decoded.body, ClaimBody::Heartbeat { newcomer: true });
        assert_eq!(decoded.sub, keypair.identity().to_hex());
    }

    #[test]
    fn post_roundtrip() {
        let keypair = Keypair::generate();
        let claims = Claims::post(keypair.identity(), "derek", "general", "Hello Portland!");

        let decoded = decode_verified(&encode_signed(&claims, &keypair).expect("encode"))
            .expect("decode");
        assert_eq!(
            decoded.body,
            ClaimBody::Post {
                text: "Hello Portland!".to_string()
            }
        );
        assert_eq!(decoded.sub, "general");
    }

    #[test]
    fn user_token_roundtrip() {
        let signing = Keypair::generate();
        let account = Keypair::generate();
        let user = Keypair::generate();

        let claims = Claims::new(
            signing.identity(),
            user.identity().to_hex(),
            "derekcol".to_string(),
            Some(now_secs() + 60),
            ClaimBody::User {
                issuer_account: account.identity(),
                max_payload: 1024,
                permissions: scope_permissions(&user.identity()),
            },
        );

        let decoded = decode_verified(&encode_signed(&claims, &signing).expect("encode"))
            .expect("decode");
        assert_eq!(decoded, claims);
    }

    #[test]
    fn token_ids_are_unique() {
        let keypair = Keypair::generate();
        let a = Claims::post(keypair.identity(), "d", "general", "same text");
        let b = Claims::post(keypair.identity(), "d", "general", "same text");
        assert_ne!(a.jti, b.jti, "claims minted back to back must get distinct ids");
    }

    #[test]
    fn decode_rejects_tampered_payload() {
        let keypair = Keypair::generate();
        let claims = Claims::post(keypair.identity(), "derek", "general", "original");
        let encoded = encode_signed(&claims, &keypair).expect("encode");

        // Swap the payload segment for one claiming different text.
        let mut tampered_claims = claims.clone();
        tampered_claims.body = ClaimBody::Post {
            text: "forged".to_string(),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&tampered_claims).expect("json"));
        let parts: Vec<&str> = encoded.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(matches!(
            decode_verified(&tampered),
            Err(DecodeError::Signature(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_verified("not a claim"),
            Err(DecodeError::Structure(_))
        ));
        assert!(matches!(
            decode_verified("a.b"),
            Err(DecodeError::Structure(_))
        ));
        assert!(matches!(
            decode_verified("!!!.???.###"),
            Err(DecodeError::Structure(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_algorithm() {
        let keypair = Keypair::generate();
        let claims = Claims::post(keypair.identity(), "derek", "general", "hi");
        let encoded = encode_signed(&claims, &keypair).expect("encode");
        let parts: Vec<&str> = encoded.split('.').collect();

        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"PLV","alg":"rsa"}"#);
        let swapped = format!("{}.{}.{}", header, parts[1], parts[2]);
        assert!(matches!(
            decode_verified(&swapped),
            Err(DecodeError::UnsupportedHeader(_))
        ));
    }

    #[test]
    fn expiry_check_uses_supplied_clock() {
        let keypair = Keypair::generate();
        let mut claims = Claims::heartbeat(keypair.identity(), "d", 60, false);

        let now = now_secs();
        assert!(!claims.is_expired_at(now));
        claims.exp = Some(now - 1);
        assert!(claims.is_expired_at(now));
        claims.exp = None;
        assert!(!claims.is_expired_at(now));
    }
}
