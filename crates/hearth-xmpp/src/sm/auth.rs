//! Account credentials for legacy `jabber:iq:auth` logins.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::BareJid;
use sha1::{Digest, Sha1};

use crate::XmppError;

/// Credential checks and in-band account registration.
pub trait Authenticator: Send + Sync + 'static {
    /// Whether the account exists.
    fn exists(&self, user: &BareJid) -> bool;

    /// Check a plaintext password.
    fn check_password(&self, user: &BareJid, password: &str) -> bool;

    /// Check a digest login: lowercase hex SHA-1 of the stream id followed
    /// by the password.
    fn check_digest(&self, user: &BareJid, stream_id: &str, digest: &str) -> bool;

    /// Create an account. Fails with a conflict if it already exists.
    fn register(&self, user: &BareJid, password: &str) -> Result<(), XmppError>;
}

/// Compute the digest a client sends for `stream_id` and `password`.
pub fn auth_digest(stream_id: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Accounts held in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticAccounts {
    passwords: DashMap<BareJid, String>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an account.
    pub fn insert(&self, user: BareJid, password: impl Into<String>) {
        self.passwords.insert(user, password.into());
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

impl Authenticator for StaticAccounts {
    fn exists(&self, user: &BareJid) -> bool {
        self.passwords.contains_key(user)
    }

    fn check_password(&self, user: &BareJid, password: &str) -> bool {
        self.passwords
            .get(user)
            .is_some_and(|stored| stored.value() == password)
    }

    fn check_digest(&self, user: &BareJid, stream_id: &str, digest: &str) -> bool {
        self.passwords
            .get(user)
            .is_some_and(|stored| auth_digest(stream_id, stored.value()).eq_ignore_ascii_case(digest.trim()))
    }

    fn register(&self, user: &BareJid, password: &str) -> Result<(), XmppError> {
        match self.passwords.entry(user.clone()) {
            Entry::Occupied(_) => Err(XmppError::conflict(Some(format!("{} already exists", user)))),
            Entry::Vacant(entry) => {
                entry.insert(password.to_string());
                Ok(())
            }
        }
    }
}
