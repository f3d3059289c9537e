//! # Credential Issuer
//!
//! Mints short-lived, capability-scoped identities on request. Each
//! request carries a raw desired display name; the issuer canonicalizes
//! it, generates a fresh Ed25519 keypair, scopes the allow-lists to the
//! new public key, signs a time-bounded identity token with its delegated
//! signing key, and replies with a credential bundle (token + private
//! seed).
//!
//! Issuance is stateless: nothing is persisted and no two requests share
//! state, so issuer instances scale horizontally behind a queue group —
//! exactly one instance answers each request.
//!
//! ## Trust Chain
//!
//! Tokens are signed by a *delegated* signing key listed in the account
//! document, never by the account master key. Compromise of a running
//! issuer therefore does not compromise the account root: the operator
//! rotates the delegated key and the account survives.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::claims::{decode_verified, encode_signed, ClaimBody, Claims};
use crate::identity::{format_credentials, now_secs, Identity, Keypair};
use crate::permissions::{scope_permissions, ACCESS_QUEUE_GROUP, ACCESS_REQUEST_SUBJECT};
use crate::validate::validate_claim;

/// Canonical display names are at most this many characters.
pub const MAX_NAME_LEN: usize = 8;

/// Issued identities are valid for this long.
pub const TOKEN_VALIDITY_SECS: u64 = 24 * 60 * 60;

/// Per-message payload limit granted to issued identities, in bytes.
pub const MAX_PAYLOAD_BYTES: u64 = 1024;

/// Error type for display-name canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    /// The requested name was empty or all whitespace.
    Empty,
}

impl std::fmt::Display for NameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameError::Empty => write!(f, "name can not be empty"),
        }
    }
}

impl std::error::Error for NameError {}

/// Derive the canonical display name: lowercase, first
/// whitespace-delimited token, truncated to [`MAX_NAME_LEN`] characters.
///
/// This is the only sanitization performed; uniqueness is resolved on the
/// client side. Empty input is an error, never silently defaulted.
pub fn canonical_name(raw: &str) -> Result<String, NameError> {
    let first = raw.split_whitespace().next().ok_or(NameError::Empty)?;
    Ok(first.to_lowercase().chars().take(MAX_NAME_LEN).collect())
}

/// Why an individual issuance failed. Maps onto the wire-level `-ERR`
/// replies; never crashes the service.
#[derive(Debug)]
pub enum IssueError {
    EmptyName,
    Signing(anyhow::Error),
}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueError::EmptyName => write!(f, "name can not be empty"),
            IssueError::Signing(err) => write!(f, "token signing failed: {err}"),
        }
    }
}

impl std::error::Error for IssueError {}

/// One minted credential, ready to hand back to the requester.
#[derive(Debug)]
pub struct CredentialBundle {
    /// Signed identity token text.
    pub token: String,
    /// Hex-encoded private seed. Secret.
    pub seed_hex: String,
    /// Canonical display name bound into the token.
    pub name: String,
    /// The freshly minted public key.
    pub identity: Identity,
}

impl CredentialBundle {
    /// Render as the banner-delimited bundle sent back to requesters.
    pub fn render(&self) -> String {
        format_credentials(&self.token, &self.seed_hex)
    }
}

/// The signing authority: account identity plus delegated signing keypair.
/// Read-only after construction; requests share it freely.
pub struct CredentialIssuer {
    account: Identity,
    signing: Keypair,
}

impl CredentialIssuer {
    /// Build an issuer from a validated account document and its delegated
    /// signing keypair. Fails unless the signing key is listed in the
    /// account's `signing_keys`.
    pub fn new(account_doc: &Claims, signing: Keypair) -> Result<Self> {
        let ClaimBody::Account { signing_keys } = &account_doc.body else {
            bail!("account document is not an account claim");
        };
        if account_doc.iss.to_hex() != account_doc.sub {
            bail!("account document must be self-signed");
        }
        if !signing_keys.contains(&signing.identity()) {
            bail!(
                "signing key {} is not authorized by account {}",
                signing.identity(),
                account_doc.iss
            );
        }
        Ok(Self {
            account: account_doc.iss,
            signing,
        })
    }

    /// Load and verify the account document and signing key from disk.
    /// Any problem here is a configuration error: the caller should exit.
    pub fn load_from_files(account_path: &std::path::Path, signing_key_path: &std::path::Path) -> Result<Self> {
        let account_text = std::fs::read_to_string(account_path)
            .with_context(|| format!("could not load account file {}", account_path.display()))?;
        let account_doc = validate_claim(account_text.trim().as_bytes())
            .map_err(|e| anyhow::anyhow!("could not validate account document: {e}"))?;

        let seed_text = std::fs::read_to_string(signing_key_path).with_context(|| {
            format!("could not load signing key file {}", signing_key_path.display())
        })?;
        let signing =
            Keypair::from_seed_hex(&seed_text).context("could not decode signing key seed")?;

        Self::new(&account_doc.claims, signing)
    }

    pub fn account(&self) -> Identity {
        self.account
    }

    /// The delegated signing key's public identity.
    pub fn signing_identity(&self) -> Identity {
        self.signing.identity()
    }

    /// Mint one credential for the requested display name.
    ///
    /// A fresh keypair per request, never reused; the token's allow-lists
    /// are scoped to the new public key and fixed at issuance.
    pub fn issue(&self, requested_name: &[u8]) -> Result<CredentialBundle, IssueError> {
        let requested = String::from_utf8_lossy(requested_name);
        let name = canonical_name(&requested).map_err(|_| IssueError::EmptyName)?;

        let user = Keypair::generate();
        let identity = user.identity();

        let claims = Claims::new(
            self.signing.identity(),
            identity.to_hex(),
            name.clone(),
            Some(now_secs() + TOKEN_VALIDITY_SECS),
            ClaimBody::User {
                issuer_account: self.account,
                max_payload: MAX_PAYLOAD_BYTES,
                permissions: scope_permissions(&identity),
            },
        );

        let token = encode_signed(&claims, &self.signing).map_err(IssueError::Signing)?;

        Ok(CredentialBundle {
            token,
            seed_hex: user.seed_hex(),
            name,
            identity,
        })
    }
}

/// Mint a self-signed account document authorizing `signing_keys` to issue
/// identities. Operator-side bootstrap; the result is what
/// [`CredentialIssuer::load_from_files`] expects in the account file.
pub fn mint_account_document(
    account: &Keypair,
    signing_keys: &[Identity],
    name: &str,
) -> Result<String> {
    let claims = Claims::new(
        account.identity(),
        account.identity().to_hex(),
        name.to_string(),
        None,
        ClaimBody::Account {
            signing_keys: signing_keys.to_vec(),
        },
    );
    encode_signed(&claims, account)
}

// ============================================================================
// Serve Loop
// ============================================================================

/// Reply sent when the requested name is empty.
const ERR_EMPTY_NAME: &str = "-ERR 'Name can not be empty'";
/// Reply sent when signing fails. Internal detail stays in the logs.
const ERR_INTERNAL: &str = "-ERR 'Internal Error'";

/// Serve access requests until interrupted, then drain the connection so
/// in-flight request/response exchanges complete before exit.
///
/// Each request is answered in its own task: issuance is cheap, but a slow
/// reply publish must not hold up the queue.
pub async fn serve(client: async_nats::Client, issuer: CredentialIssuer) -> Result<()> {
    let mut requests = client
        .queue_subscribe(ACCESS_REQUEST_SUBJECT, ACCESS_QUEUE_GROUP.to_string())
        .await
        .context("could not subscribe to access requests")?;

    info!(
        subject = ACCESS_REQUEST_SUBJECT,
        group = ACCESS_QUEUE_GROUP,
        account = %issuer.account(),
        signing_key = %issuer.signing_identity(),
        "serving access requests"
    );

    let issuer = Arc::new(issuer);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, draining");
                break;
            }
            maybe = requests.next() => {
                let Some(msg) = maybe else { break };
                let client = client.clone();
                let issuer = Arc::clone(&issuer);
                tokio::spawn(async move {
                    answer(client, issuer, msg).await;
                });
            }
        }
    }

    client.drain().await.context("drain failed")?;
    Ok(())
}

async fn answer(client: async_nats::Client, issuer: Arc<CredentialIssuer>, msg: async_nats::Message) {
    let Some(reply) = msg.reply else {
        debug!("access request without reply subject, ignoring");
        return;
    };

    let response = match issuer.issue(&msg.payload) {
        Ok(bundle) => {
            info!(
                name = %bundle.name,
                identity = %bundle.identity,
                requested = %String::from_utf8_lossy(&msg.payload),
                "registered"
            );
            bundle.render()
        }
        Err(IssueError::EmptyName) => ERR_EMPTY_NAME.to_string(),
        Err(IssueError::Signing(err)) => {
            error!(error = %err, "token signing failed");
            ERR_INTERNAL.to_string()
        }
    };

    if let Err(err) = client.publish(reply, Bytes::from(response)).await {
        warn!(error = %err, "failed to answer access request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::parse_credentials;
    use crate::permissions::{dm_subject, online_subject, posts_wildcard};

    fn test_issuer() -> CredentialIssuer {
        let account = Keypair::generate();
        let signing = Keypair::generate();
        let doc = mint_account_document(&account, &[signing.identity()], "demo")
            .expect("account document");
        let account_doc = decode_verified(&doc).expect("decode account document");
        CredentialIssuer::new(&account_doc, signing).expect("issuer")
    }

    #[test]
    fn canonical_name_lowers_splits_and_truncates() {
        assert_eq!(canonical_name("Alexandria Smith").unwrap(), "alexandr");
        assert_eq!(canonical_name("Derek Collison").unwrap(), "derekcol");
        assert_eq!(canonical_name("sam").unwrap(), "sam");
        assert_eq!(canonical_name("  Wally  ").unwrap(), "wally");
        assert_eq!(canonical_name(""), Err(NameError::Empty));
        assert_eq!(canonical_name("   "), Err(NameError::Empty));
    }

    #[test]
    fn issue_binds_name_expiry_and_scoped_permissions() {
        let issuer = test_issuer();
        let before = now_secs();

        let bundle = issuer.issue(b"Derek Collison").expect("issue");
        assert_eq!(bundle.name, "derekcol");

        let token = decode_verified(&bundle.token).expect("token decodes");
        assert_eq!(token.name, "derekcol");
        assert_eq!(token.sub, bundle.identity.to_hex());
        assert_eq!(token.iss, issuer.signing_identity());

        let exp = token.exp.expect("token is time-bounded");
        assert!(exp >= before + TOKEN_VALIDITY_SECS);
        assert!(exp <= now_secs() + TOKEN_VALIDITY_SECS + 5);

        let ClaimBody::User {
            issuer_account,
            max_payload,
            permissions,
        } = token.body
        else {
            panic!("expected a user token");
        };
        assert_eq!(issuer_account, issuer.account());
        assert_eq!(max_payload, MAX_PAYLOAD_BYTES);

        // Allow-lists are parameterized by the *new* key.
        assert!(permissions.publish.contains(&dm_subject(&bundle.identity)));
        assert!(permissions.subscribe.contains(&dm_subject(&bundle.identity)));
        assert!(permissions.publish.contains(&online_subject()));
        assert!(permissions.publish.contains(&posts_wildcard()));
    }

    #[test]
    fn issue_rejects_empty_name() {
        let issuer = test_issuer();
        assert!(matches!(issuer.issue(b""), Err(IssueError::EmptyName)));
        assert!(matches!(issuer.issue(b"   "), Err(IssueError::EmptyName)));
    }

    #[test]
    fn each_issuance_mints_a_fresh_key() {
        let issuer = test_issuer();
        let a = issuer.issue(b"derek").expect("issue a");
        let b = issuer.issue(b"derek").expect("issue b");
        assert_ne!(a.identity, b.identity);
        assert_ne!(a.seed_hex, b.seed_hex);
    }

    #[test]
    fn bundle_renders_parseable_credentials() {
        let issuer = test_issuer();
        let bundle = issuer.issue(b"Derek Collison").expect("issue");

        let (token, keypair) = parse_credentials(&bundle.render()).expect("bundle parses");
        assert_eq!(token, bundle.token);
        assert_eq!(keypair.identity(), bundle.identity);
    }

    #[test]
    fn issuer_refuses_unauthorized_signing_key() {
        let account = Keypair::generate();
        let authorized = Keypair::generate();
        let rogue = Keypair::generate();
        let doc = mint_account_document(&account, &[authorized.identity()], "demo")
            .expect("account document");
        let account_doc = decode_verified(&doc).expect("decode");

        assert!(CredentialIssuer::new(&account_doc, rogue).is_err());
        assert!(CredentialIssuer::new(&account_doc, authorized).is_ok());
    }
}
