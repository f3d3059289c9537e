//! # Subject Space and Permission Scoping
//!
//! The entire chat protocol lives under a fixed, well-known subject prefix.
//! This module owns the subject naming scheme and computes the exact
//! publish/subscribe allow-lists baked into every issued identity token.
//!
//! Authorization is capability-style: there is no session or ACL database.
//! The allow-lists inside the signed token are the complete and final
//! statement of what an identity may do, fixed at issuance.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Subject on which the credential issuer listens for access requests.
pub const ACCESS_REQUEST_SUBJECT: &str = "chat.req.access";

/// Queue group for issuer instances. Competing-consumer delivery means
/// exactly one instance answers each request, so issuers scale
/// horizontally without coordination.
pub const ACCESS_QUEUE_GROUP: &str = "issuers";

/// Prefix under which all chat traffic flows.
const SUBJECT_PREFIX: &str = "chat.palaver.";

/// Subject used by the transport for request-reply inboxes.
pub const INBOX_WILDCARD: &str = "_INBOX.>";

/// Subject for anonymized usage reports.
pub const USAGE_SUBJECT: &str = "sys.usage.palaver";

/// Presence heartbeats are broadcast here.
pub fn online_subject() -> String {
    format!("{SUBJECT_PREFIX}online")
}

/// Wildcard covering every broadcast channel.
pub fn posts_wildcard() -> String {
    format!("{SUBJECT_PREFIX}posts.*")
}

/// Concrete subject for posting to a named channel.
pub fn post_subject(channel: &str) -> String {
    format!("{SUBJECT_PREFIX}posts.{channel}")
}

/// Personal inbox subject for direct messages to `identity`.
pub fn dm_subject(identity: &Identity) -> String {
    format!("{SUBJECT_PREFIX}dms.{}", identity.to_hex())
}

/// Publish/subscribe allow-lists embedded in an identity token.
///
/// Fixed at issuance; no runtime elevation is possible.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

/// Compute the allow-lists for a freshly minted identity.
///
/// Publish: presence, any channel post, the identity's own DM inbox, and
/// usage reports. Subscribe: the same, plus the transport's request-reply
/// inbox wildcard. No token ever grants publish access to another
/// identity's DM inbox.
pub fn scope_permissions(identity: &Identity) -> Permissions {
    Permissions {
        publish: vec![
            online_subject(),
            posts_wildcard(),
            dm_subject(identity),
            USAGE_SUBJECT.to_string(),
        ],
        subscribe: vec![
            online_subject(),
            posts_wildcard(),
            dm_subject(identity),
            INBOX_WILDCARD.to_string(),
        ],
    }
}
