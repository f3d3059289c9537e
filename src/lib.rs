//! # Palaver - Capability-Scoped Chat Identities over Pub/Sub
//!
//! Palaver issues short-lived, cryptographically signed, capability-scoped
//! identities for participants of a publish/subscribe chat network, and
//! maintains each participant's local view of presence, channel history,
//! and direct messages from a stream of self-describing signed claims.
//!
//! There is no server-side session or ACL database: authorization lives
//! inside the signed identity token itself, and every peer independently
//! validates inbound claims (signature, schema, expiry) before trusting
//! them. Peers converge on a consistent map of online users, resolve
//! handle collisions deterministically, and suppress redelivered claims.
//!
//! ## Trust Model
//!
//! - **Identity = Ed25519 public key.** Possession of the seed proves it.
//! - **Tokens are capability documents**: expiry, payload limit, and the
//!   exact publish/subscribe allow-lists, fixed at issuance.
//! - **Delegated signing**: tokens are signed by a key the account
//!   document authorizes, never by the account master key.
//! - **No unvalidated input**: every inbound payload passes the validation
//!   gate before any state transition.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, public-key identities, credential bundles |
//! | `crypto` | Domain-separated Ed25519 signing helpers |
//! | `claims` | Signed claim codec and typed claim bodies |
//! | `validate` | The mandatory validation gate |
//! | `permissions` | Subject space and allow-list scoping |
//! | `issuer` | Credential issuer service |
//! | `dedup` | Seen-token set (at-least-once absorption) |
//! | `roster` | Peer records and display-name collision resolution |
//! | `state` | Session state: logs, presence, selection |
//! | `client` | Chat client transport and terminal wiring |

pub mod claims;
pub mod client;
pub mod crypto;
pub mod dedup;
pub mod identity;
pub mod issuer;
pub mod permissions;
pub mod roster;
pub mod state;
pub mod validate;
