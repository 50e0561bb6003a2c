//! Credentials and the server-side user directory.
//!
//! Clients present [`Credentials`] to [`Manager::connect`](crate::Manager::connect);
//! servers look identifiers up in a [`UserDirectory`]. The directory only
//! ever holds SRP verifiers, never secrets.

use dashmap::DashMap;
use std::fmt;
use tether_crypto::Authenticator;

/// Disconnect reason sent when a server requires authentication and the
/// client connected without it.
pub const AUTHENTICATION_REQUIRED: &str = "authentication required";

/// Disconnect reason sent when SRP verification fails or the user is unknown.
pub const AUTHENTICATION_FAILED: &str = "authentication failed";

/// Client log-in or sign-up credentials.
#[derive(Clone)]
pub struct Credentials {
    /// User identifier
    pub identifier: String,
    /// User secret; never sent
    pub secret: String,
    /// Register a new verifier before authenticating
    pub register: bool,
}

impl Credentials {
    /// Log in as an existing user.
    pub fn login(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
            register: false,
        }
    }

    /// Sign up as a new user.
    pub fn register(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            register: true,
            ..Self::login(identifier, secret)
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .field("register", &self.register)
            .finish()
    }
}

/// Authenticated user attached to a secure connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Authenticated identifier
    pub identifier: String,
    /// Server-held profile bytes, if any
    pub profile: Option<Vec<u8>>,
}

/// A stored user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Serialized verifier from [`Authenticator::create_verifier`]
    pub verifier: Vec<u8>,
    /// Opaque profile surfaced as [`User::profile`]
    pub profile: Option<Vec<u8>>,
}

/// Server-side verifier store.
pub trait UserDirectory: Send + Sync + 'static {
    /// Look up an identifier.
    fn lookup(&self, identifier: &str) -> Option<UserRecord>;

    /// Store a new verifier. `Err(reason)` is sent to the client.
    fn register(&self, identifier: &str, verifier: Vec<u8>) -> Result<(), String>;
}

/// In-memory [`UserDirectory`].
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashMap<String, UserRecord>,
}

impl MemoryUserDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a user from an existing verifier.
    pub fn insert(&self, identifier: impl Into<String>, record: UserRecord) {
        self.users.insert(identifier.into(), record);
    }

    /// Provision a user from a secret, creating the verifier here.
    ///
    /// # Errors
    ///
    /// Returns the verifier creation failure.
    pub fn insert_secret(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<(), tether_crypto::CryptoError> {
        let verifier = Authenticator::create_verifier(identifier, secret)?;
        self.insert(
            identifier,
            UserRecord {
                verifier,
                profile: None,
            },
        );
        Ok(())
    }

    /// Number of users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Returns true if no users are stored.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn lookup(&self, identifier: &str) -> Option<UserRecord> {
        self.users.get(identifier).map(|entry| entry.value().clone())
    }

    fn register(&self, identifier: &str, verifier: Vec<u8>) -> Result<(), String> {
        match self.users.entry(identifier.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(format!("identifier {identifier} already registered"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(UserRecord {
                    verifier,
                    profile: None,
                });
                Ok(())
            }
        }
    }
}
