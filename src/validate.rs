//! # Claim Validation Gate
//!
//! Every inbound payload passes through [`validate_claim`] before any other
//! component may act on it. The gate performs, in order:
//!
//! 1. UTF-8 and codec decoding (including signature verification, see
//!    [`crate::claims::decode_verified`])
//! 2. Structural checks (issuer key usable, subject present)
//! 3. Semantic checks (expiry, freshness)
//!
//! Issues are split into **blocking** and **warning** severity. Any
//! blocking issue rejects the claim; warnings are collected on the returned
//! [`ValidatedClaim`] and tolerated. Validation failures never escape this
//! boundary as anything other than an error value — callers log and drop.

use crate::claims::{decode_verified, ClaimBody, Claims, DecodeError};
use crate::identity::now_secs;

/// Tolerated clock skew before a future `iat` draws a warning.
const MAX_CLOCK_SKEW_SECS: u64 = 300;

/// A single validation finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub description: String,
    pub blocking: bool,
}

/// Accumulated findings for one claim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationResults {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResults {
    fn add_blocking(&mut self, description: impl Into<String>) {
        self.issues.push(ValidationIssue {
            description: description.into(),
            blocking: true,
        });
    }

    fn add_warning(&mut self, description: impl Into<String>) {
        self.issues.push(ValidationIssue {
            description: description.into(),
            blocking: false,
        });
    }

    pub fn is_blocking(&self) -> bool {
        self.issues.iter().any(|issue| issue.blocking)
    }
}

impl std::fmt::Display for ValidationResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for issue in &self.issues {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            let severity = if issue.blocking { "blocking" } else { "warning" };
            write!(f, "{severity}: {}", issue.description)?;
        }
        Ok(())
    }
}

/// Why a claim was rejected at the validation gate.
#[derive(Debug)]
pub enum ClaimError {
    /// Payload was not UTF-8 text.
    NotText,
    /// Codec or signature failure.
    Decode(DecodeError),
    /// Decoded fine but carries blocking validation issues.
    Invalid(ValidationResults),
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimError::NotText => write!(f, "claim payload is not UTF-8"),
            ClaimError::Decode(err) => write!(f, "{err}"),
            ClaimError::Invalid(results) => write!(f, "claim has blocking issues: {results}"),
        }
    }
}

impl std::error::Error for ClaimError {}

/// A claim that has passed the validation gate. The only claim type the
/// presence tracker, deduplicator, and session state accept.
#[derive(Clone, Debug)]
pub struct ValidatedClaim {
    pub claims: Claims,
    /// Non-blocking findings, surfaced for logging only.
    pub warnings: Vec<ValidationIssue>,
}

/// Validate an inbound payload against the current clock.
pub fn validate_claim(raw: &[u8]) -> Result<ValidatedClaim, ClaimError> {
    validate_claim_at(raw, now_secs())
}

/// Validate an inbound payload against a supplied clock.
///
/// Split out from [`validate_claim`] so expiry behavior is testable
/// without waiting on wall time.
pub fn validate_claim_at(raw: &[u8], now: u64) -> Result<ValidatedClaim, ClaimError> {
    let text = std::str::from_utf8(raw).map_err(|_| ClaimError::NotText)?;
    let claims = decode_verified(text).map_err(ClaimError::Decode)?;

    let mut results = ValidationResults::default();
    check_structure(&claims, &mut results);
    check_semantics(&claims, now, &mut results);

    if results.is_blocking() {
        return Err(ClaimError::Invalid(results));
    }

    Ok(ValidatedClaim {
        claims,
        warnings: results.issues,
    })
}

fn check_structure(claims: &Claims, results: &mut ValidationResults) {
    if !claims.iss.is_valid() {
        results.add_blocking("issuer is not a usable public key");
    }
    if claims.sub.is_empty() {
        results.add_blocking("subject is empty");
    }
    if claims.jti.is_empty() {
        results.add_blocking("token identifier is empty");
    }
    if claims.name.is_empty() {
        results.add_warning("display name is empty");
    }

    match &claims.body {
        ClaimBody::Heartbeat { .. } => {
            // Heartbeat subjects name the originating key; a mismatch means
            // someone is announcing presence for a key they did not sign
            // with.
            if claims.sub != claims.iss.to_hex() {
                results.add_blocking("heartbeat subject does not match its issuer");
            }
            if claims.exp.is_none() {
                results.add_warning("heartbeat carries no freshness expiry");
            }
        }
        ClaimBody::Post { text } => {
            if text.is_empty() {
                results.add_warning("post has an empty body");
            }
        }
        ClaimBody::User {
            permissions,
            max_payload,
            ..
        } => {
            if permissions.publish.is_empty() || permissions.subscribe.is_empty() {
                results.add_blocking("identity token is missing allow-lists");
            }
            if *max_payload == 0 {
                results.add_blocking("identity token allows no payload");
            }
            if claims.exp.is_none() {
                results.add_blocking("identity token must be time-bounded");
            }
        }
        ClaimBody::Account { signing_keys } => {
            if signing_keys.is_empty() {
                results.add_warning("account document lists no signing keys");
            }
        }
    }
}

fn check_semantics(claims: &Claims, now: u64, results: &mut ValidationResults) {
    if claims.is_expired_at(now) {
        results.add_blocking("claim is expired");
    }
    if claims.iat > now + MAX_CLOCK_SKEW_SECS {
        results.add_warning("issue time is in the future");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::encode_signed;
    use crate::identity::Keypair;
    use crate::permissions::scope_permissions;

    fn encode(claims: &Claims, keypair: &Keypair) -> Vec<u8> {
        encode_signed(claims, keypair).expect("encode").into_bytes()
    }

    #[test]
    fn accepts_fresh_heartbeat() {
        let keypair = Keypair::generate();
        let raw = encode(&Claims::heartbeat(keypair.identity(), "derek", 60, false), &keypair);

        let validated = validate_claim(&raw).expect("fresh heartbeat must pass");
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn rejects_expired_claim_despite_valid_signature() {
        let keypair = Keypair::generate();
        let mut claims = Claims::heartbeat(keypair.identity(), "derek", 60, false);
        let now = claims.iat;
        claims.exp = Some(now.saturating_sub(10));
        let raw = encode(&claims, &keypair);

        match validate_claim_at(&raw, now) {
            Err(ClaimError::Invalid(results)) => assert!(results.is_blocking()),
            other => panic!("expected blocking rejection, got {other:?}"),
        }
    }

    #[test]
    fn rejects_heartbeat_for_foreign_subject() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut claims = Claims::heartbeat(keypair.identity(), "derek", 60, false);
        claims.sub = other.identity().to_hex();
        let raw = encode(&claims, &keypair);

        assert!(matches!(
            validate_claim(&raw),
            Err(ClaimError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_non_utf8_and_garbage() {
        assert!(matches!(
            validate_claim(&[0xFF, 0xFE, 0x00]),
            Err(ClaimError::NotText)
        ));
        assert!(matches!(
            validate_claim(b"definitely not a claim"),
            Err(ClaimError::Decode(_))
        ));
    }

    #[test]
    fn empty_name_is_tolerated_with_warning() {
        let keypair = Keypair::generate();
        let claims = Claims::post(keypair.identity(), "", "general", "hi");
        let raw = encode(&claims, &keypair);

        let validated = validate_claim(&raw).expect("warning-level issues must not block");
        assert_eq!(validated.warnings.len(), 1);
        assert!(!validated.warnings[0].blocking);
    }

    #[test]
    fn rejects_unbounded_identity_token() {
        let signing = Keypair::generate();
        let user = Keypair::generate();
        let claims = Claims::new(
            signing.identity(),
            user.identity().to_hex(),
            "derekcol".to_string(),
            None, // identity tokens must carry an expiry
            ClaimBody::User {
                issuer_account: signing.identity(),
                max_payload: 1024,
                permissions: scope_permissions(&user.identity()),
            },
        );
        let raw = encode(&claims, &signing);

        assert!(matches!(validate_claim(&raw), Err(ClaimError::Invalid(_))));
    }

    #[test]
    fn future_issue_time_is_warning_only() {
        let keypair = Keypair::generate();
        let mut claims = Claims::post(keypair.identity(), "derek", "general", "hi");
        claims.iat += 3600;
        let now = claims.iat - 3600;
        let raw = encode(&claims, &keypair);

        let validated = validate_claim_at(&raw, now).expect("skew is non-blocking");
        assert!(validated.warnings.iter().any(|i| !i.blocking));
    }
}
