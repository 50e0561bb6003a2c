//! SRP-6a over the RFC 5054 2048-bit group with SHA-256.
//!
//! Notation follows RFC 5054:
//!
//! ```text
//! k  = H(N | PAD(g))
//! x  = H(s | H(I | ":" | P))
//! v  = g^x % N
//! A  = g^a % N
//! B  = (k*v + g^b) % N
//! u  = H(PAD(A) | PAD(B))
//! S  = (B - k*g^x)^(a + u*x) % N      (client)
//! S  = (A * v^u)^b % N                (server)
//! K  = H(PAD(S))
//! M1 = H(H(N) xor H(PAD(g)) | H(I) | s | PAD(A) | PAD(B) | K)
//! ```
//!
//! All public values travel as big-endian byte strings padded to the
//! group size.

use crate::random::random_array;
use crate::{CryptoError, EPHEMERAL_SECRET_SIZE, KEY_SIZE};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// RFC 5054 Appendix A, 2048-bit group prime.
const PRIME_HEX: &str = concat!(
    "AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050",
    "A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50",
    "E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B8",
    "55F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773B",
    "CA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748",
    "544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6",
    "AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB6",
    "94B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73",
);

/// Group generator
pub const GENERATOR: u32 = 2;

/// Size of padded group elements in bytes
pub const GROUP_SIZE: usize = 256;

/// SRP group parameters
pub struct Group {
    /// Safe prime modulus
    pub n: BigUint,
    /// Generator
    pub g: BigUint,
    /// Multiplier `k = H(N | PAD(g))`
    pub k: BigUint,
}

/// The shared 2048-bit group, parsed on first use.
pub fn group() -> &'static Group {
    static GROUP: OnceLock<Group> = OnceLock::new();
    GROUP.get_or_init(|| {
        let n = BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16)
            .expect("RFC 5054 prime is valid hex");
        let g = BigUint::from(GENERATOR);
        let k = BigUint::from_bytes_be(&hash(&[&pad(&n), &pad(&g)]));
        Group { n, g, k }
    })
}

/// Left-pad a group element to [`GROUP_SIZE`] bytes.
pub fn pad(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= GROUP_SIZE {
        return bytes;
    }
    let mut out = vec![0u8; GROUP_SIZE - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Password-derived private key `x`.
pub fn private_key(identifier: &str, secret: &str, salt: &[u8]) -> BigUint {
    let inner = Zeroizing::new(hash(&[identifier.as_bytes(), b":", secret.as_bytes()]));
    BigUint::from_bytes_be(&hash(&[salt, inner.as_slice()]))
}

/// Compute the padded verifier `v = g^x % N`.
pub fn verifier(identifier: &str, secret: &str, salt: &[u8]) -> Vec<u8> {
    let grp = group();
    let x = private_key(identifier, secret, salt);
    pad(&grp.g.modpow(&x, &grp.n))
}

/// A one-time key pair generated per handshake attempt.
pub struct Ephemeral {
    secret: Zeroizing<[u8; EPHEMERAL_SECRET_SIZE]>,
    public: Vec<u8>,
}

impl Ephemeral {
    /// Client ephemeral: `A = g^a % N`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn client() -> Result<Self, CryptoError> {
        let grp = group();
        let secret = Zeroizing::new(random_array::<EPHEMERAL_SECRET_SIZE>()?);
        let a = BigUint::from_bytes_be(secret.as_slice());
        let public = pad(&grp.g.modpow(&a, &grp.n));
        Ok(Self { secret, public })
    }

    /// Server ephemeral: `B = (k*v + g^b) % N`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn server(verifier: &[u8]) -> Result<Self, CryptoError> {
        let grp = group();
        let secret = Zeroizing::new(random_array::<EPHEMERAL_SECRET_SIZE>()?);
        let b = BigUint::from_bytes_be(secret.as_slice());
        let v = BigUint::from_bytes_be(verifier);
        let public = pad(&((&grp.k * v + grp.g.modpow(&b, &grp.n)) % &grp.n));
        Ok(Self { secret, public })
    }

    /// Public half of the ephemeral pair.
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    fn exponent(&self) -> BigUint {
        BigUint::from_bytes_be(self.secret.as_slice())
    }
}

/// Key material produced by the client side of the exchange.
pub struct ClientProof {
    /// Shared session key `K`
    pub key: Zeroizing<[u8; KEY_SIZE]>,
    /// Client proof `M1`
    pub proof: [u8; 32],
}

fn scrambler(client_public: &[u8], server_public: &[u8]) -> BigUint {
    BigUint::from_bytes_be(&hash(&[client_public, server_public]))
}

fn proof(
    identifier: &str,
    salt: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    key: &[u8],
) -> [u8; 32] {
    let grp = group();
    let hn = hash(&[&pad(&grp.n)]);
    let hg = hash(&[&pad(&grp.g)]);
    let mut mixed = [0u8; 32];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = hn[i] ^ hg[i];
    }
    let hi = hash(&[identifier.as_bytes()]);
    hash(&[&mixed, &hi, salt, client_public, server_public, key])
}

/// Client side: derive `K` and `M1` from the server's salt and public ephemeral.
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] if the server ephemeral is
/// degenerate (`B % N == 0`) or the scrambler is zero.
pub fn client_session(
    identifier: &str,
    secret: &str,
    salt: &[u8],
    ephemeral: &Ephemeral,
    server_public: &[u8],
) -> Result<ClientProof, CryptoError> {
    let grp = group();
    let b_pub = BigUint::from_bytes_be(server_public) % &grp.n;
    if b_pub.bits() == 0 {
        return Err(CryptoError::Authentication("degenerate server ephemeral"));
    }
    let server_public = pad(&b_pub);

    let u = scrambler(&ephemeral.public, &server_public);
    if u.bits() == 0 {
        return Err(CryptoError::Authentication("degenerate scrambler"));
    }

    let x = private_key(identifier, secret, salt);
    let kgx = (&grp.k * grp.g.modpow(&x, &grp.n)) % &grp.n;
    let base = (b_pub + &grp.n - kgx) % &grp.n;
    let exp = ephemeral.exponent() + &u * &x;
    let shared = base.modpow(&exp, &grp.n);

    let key = Zeroizing::new(hash(&[&pad(&shared)]));
    let proof = proof(identifier, salt, &ephemeral.public, &server_public, key.as_slice());
    Ok(ClientProof { key, proof })
}

/// Server side: verify `M1` and derive `K`.
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] if the client ephemeral is
/// degenerate (`A % N == 0`) or the proof does not match.
pub fn server_session(
    identifier: &str,
    salt: &[u8],
    verifier: &[u8],
    ephemeral: &Ephemeral,
    client_public: &[u8],
    client_proof: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let grp = group();
    let a_pub = BigUint::from_bytes_be(client_public) % &grp.n;
    if a_pub.bits() == 0 {
        return Err(CryptoError::Authentication("degenerate client ephemeral"));
    }
    let client_public = pad(&a_pub);

    let u = scrambler(&client_public, &ephemeral.public);
    let v = BigUint::from_bytes_be(verifier);
    let base = (&a_pub * v.modpow(&u, &grp.n)) % &grp.n;
    let shared = base.modpow(&ephemeral.exponent(), &grp.n);

    let key = Zeroizing::new(hash(&[&pad(&shared)]));
    let expected = proof(identifier, salt, &client_public, &ephemeral.public, key.as_slice());
    if !bool::from(expected.as_slice().ct_eq(client_proof)) {
        return Err(CryptoError::Authentication("client proof mismatch"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"0123456789abcdef";

    #[test]
    fn test_group_parameters() {
        let grp = group();
        assert_eq!(grp.n.bits(), 2048);
        assert_eq!(grp.g, BigUint::from(2u32));
        assert!(grp.k.bits() > 0);
    }

    #[test]
    fn test_pad_length() {
        assert_eq!(pad(&BigUint::from(1u32)).len(), GROUP_SIZE);
        assert_eq!(pad(&group().n).len(), GROUP_SIZE);
    }

    #[test]
    fn test_verifier_deterministic_per_salt() {
        let v1 = verifier("alice", "secret", SALT);
        let v2 = verifier("alice", "secret", SALT);
        let v3 = verifier("alice", "secret", b"another salt....");
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
    }

    #[test]
    fn test_shared_key_agreement() {
        let v = verifier("alice", "secret", SALT);
        let server = Ephemeral::server(&v).unwrap();
        let client = Ephemeral::client().unwrap();

        let client_side =
            client_session("alice", "secret", SALT, &client, server.public()).unwrap();
        let server_key = server_session(
            "alice",
            SALT,
            &v,
            &server,
            client.public(),
            &client_side.proof,
        )
        .unwrap();

        assert_eq!(client_side.key.as_slice(), server_key.as_slice());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let v = verifier("alice", "secret", SALT);
        let server = Ephemeral::server(&v).unwrap();
        let client = Ephemeral::client().unwrap();

        let client_side =
            client_session("alice", "not-the-secret", SALT, &client, server.public()).unwrap();
        let result = server_session(
            "alice",
            SALT,
            &v,
            &server,
            client.public(),
            &client_side.proof,
        );
        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn test_degenerate_client_ephemeral_rejected() {
        let v = verifier("alice", "secret", SALT);
        let server = Ephemeral::server(&v).unwrap();
        let zero = vec![0u8; GROUP_SIZE];
        let result = server_session("alice", SALT, &v, &server, &zero, &[0u8; 32]);
        assert!(matches!(result, Err(CryptoError::Authentication(_))));

        let n = pad(&group().n);
        let result = server_session("alice", SALT, &v, &server, &n, &[0u8; 32]);
        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn test_degenerate_server_ephemeral_rejected() {
        let client = Ephemeral::client().unwrap();
        let zero = vec![0u8; GROUP_SIZE];
        let result = client_session("alice", "secret", SALT, &client, &zero);
        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }
}
