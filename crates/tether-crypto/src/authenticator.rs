//! Authenticator surface used by the connection handshake.
//!
//! Every value exchanged with the peer is an opaque byte string produced
//! here (bincode-encoded), so the networking layer only ever moves blobs.

use crate::encryptor::Encryptor;
use crate::random::random_array;
use crate::srp::{self, Ephemeral};
use crate::{CryptoError, SALT_SIZE};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct VerifierRecord {
    salt: Vec<u8>,
    verifier: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SessionData {
    salt: Vec<u8>,
    server_public: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SessionResponse {
    client_public: Vec<u8>,
    proof: Vec<u8>,
}

/// SRP-6a authenticator.
///
/// ```text
/// let verifier = Authenticator::create_verifier("alice", "secret")?;       // sign-up
/// let session = Authenticator::create_session("alice", &verifier)?;         // server
/// let (client_enc, response) =
///     Authenticator::create_encryptor(session.data(), "alice", "secret")?;  // client
/// let server_enc = session.create_encryptor(&response)?;                    // server
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Authenticator;

impl Authenticator {
    /// Create the server-side verifier for `identifier`/`secret` with a fresh salt.
    ///
    /// # Errors
    ///
    /// Returns an error if randomness or serialization fails.
    pub fn create_verifier(identifier: &str, secret: &str) -> Result<Vec<u8>, CryptoError> {
        let salt = random_array::<SALT_SIZE>()?.to_vec();
        let verifier = srp::verifier(identifier, secret, &salt);
        Ok(bincode::serialize(&VerifierRecord { salt, verifier })?)
    }

    /// Start a server session against a stored verifier.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] if `verifier` is malformed.
    pub fn create_session(identifier: &str, verifier: &[u8]) -> Result<ServerSession, CryptoError> {
        let record: VerifierRecord = bincode::deserialize(verifier)?;
        let ephemeral = Ephemeral::server(&record.verifier)?;
        let data = bincode::serialize(&SessionData {
            salt: record.salt.clone(),
            server_public: ephemeral.public().to_vec(),
        })?;
        Ok(ServerSession {
            identifier: identifier.to_string(),
            record,
            ephemeral,
            data,
        })
    }

    /// Client side: answer a server session, producing the session encryptor
    /// and the response bytes to send back.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidMessage`] for malformed session data and
    /// [`CryptoError::Authentication`] for a degenerate server ephemeral.
    pub fn create_encryptor(
        session: &[u8],
        identifier: &str,
        secret: &str,
    ) -> Result<(Encryptor, Vec<u8>), CryptoError> {
        let data: SessionData = bincode::deserialize(session)?;
        let ephemeral = Ephemeral::client()?;
        let client = srp::client_session(
            identifier,
            secret,
            &data.salt,
            &ephemeral,
            &data.server_public,
        )?;
        let response = bincode::serialize(&SessionResponse {
            client_public: ephemeral.public().to_vec(),
            proof: client.proof.to_vec(),
        })?;
        Ok((Encryptor::new(client.key.as_slice())?, response))
    }

    /// Run the whole exchange in-process and report whether `secret` matches.
    pub fn verify(identifier: &str, secret: &str, verifier: &[u8]) -> bool {
        let attempt = || -> Result<bool, CryptoError> {
            let session = Self::create_session(identifier, verifier)?;
            let (client, response) = Self::create_encryptor(session.data(), identifier, secret)?;
            let server = session.create_encryptor(&response)?;
            Ok(client.fingerprint() == server.fingerprint())
        };
        attempt().unwrap_or(false)
    }
}

/// Server half of an in-progress SRP exchange.
pub struct ServerSession {
    identifier: String,
    record: VerifierRecord,
    ephemeral: Ephemeral,
    data: Vec<u8>,
}

impl ServerSession {
    /// Bytes to send to the client (salt and server ephemeral).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Identifier this session authenticates.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Verify the client's response and derive the session encryptor.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Authentication`] if the client proof does not
    /// match, or [`CryptoError::InvalidMessage`] for a malformed response.
    pub fn create_encryptor(self, response: &[u8]) -> Result<Encryptor, CryptoError> {
        let response: SessionResponse = bincode::deserialize(response)?;
        let key = srp::server_session(
            &self.identifier,
            &self.record.salt,
            &self.record.verifier,
            &self.ephemeral,
            &response.client_public,
            &response.proof,
        )?;
        Encryptor::new(key.as_slice())
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_correct_secret() {
        let verifier = Authenticator::create_verifier("alice", "hunter2").unwrap();
        assert!(Authenticator::verify("alice", "hunter2", &verifier));
    }

    #[test]
    fn test_verify_wrong_secret() {
        let verifier = Authenticator::create_verifier("alice", "hunter2").unwrap();
        assert!(!Authenticator::verify("alice", "hunter3", &verifier));
    }

    #[test]
    fn test_verify_wrong_identifier() {
        let verifier = Authenticator::create_verifier("alice", "hunter2").unwrap();
        assert!(!Authenticator::verify("mallory", "hunter2", &verifier));
    }

    #[test]
    fn test_verify_malformed_verifier() {
        assert!(!Authenticator::verify("alice", "hunter2", &[1, 2, 3]));
    }

    #[test]
    fn test_encryptors_interoperate() {
        let verifier = Authenticator::create_verifier("bob", "pw").unwrap();
        let session = Authenticator::create_session("bob", &verifier).unwrap();
        assert_eq!(session.identifier(), "bob");

        let (client, response) =
            Authenticator::create_encryptor(session.data(), "bob", "pw").unwrap();
        let server = session.create_encryptor(&response).unwrap();

        let sealed = client.encrypt(b"ping").unwrap();
        assert_eq!(server.decrypt(&sealed).unwrap(), b"ping");
        let sealed = server.encrypt(b"pong").unwrap();
        assert_eq!(client.decrypt(&sealed).unwrap(), b"pong");
    }

    #[test]
    fn test_forged_response_rejected() {
        let verifier = Authenticator::create_verifier("bob", "pw").unwrap();
        let session = Authenticator::create_session("bob", &verifier).unwrap();
        let (_, mut response) =
            Authenticator::create_encryptor(session.data(), "bob", "pw").unwrap();
        let last = response.len() - 1;
        response[last] ^= 0xFF;

        let err = session.create_encryptor(&response).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_verifiers_are_salted() {
        let a = Authenticator::create_verifier("alice", "pw").unwrap();
        let b = Authenticator::create_verifier("alice", "pw").unwrap();
        assert_ne!(a, b);
    }
}
