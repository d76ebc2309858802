use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::Did;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid PEM private key: {0}")]
    InvalidPem(String),
    #[error("only named DIDs can wrap a key identity, got {0}")]
    NotWrappable(Did),
}

/// A signing identity: an Ed25519 keypair together with the DID it
/// presents itself as.
///
/// A service may operate under a named `did:web` identifier while
/// signing with its underlying key; [`Identity::wrap`] produces such a
/// wrapped identity and [`Identity::key_did`] recovers the key-bound
/// form.
#[derive(Debug, Clone)]
pub struct Identity {
    did: Did,
    keypair: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_keypair(SigningKey::generate(&mut OsRng))
    }

    /// Create an identity from an existing signing key.
    pub fn from_keypair(keypair: SigningKey) -> Self {
        let pubkey = keypair.verifying_key().to_bytes();
        Self {
            did: Did::from_pubkey(&pubkey),
            keypair,
        }
    }

    /// Create an identity from raw 32-byte Ed25519 secret key bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_keypair(SigningKey::from_bytes(secret))
    }

    /// Parse a PKCS#8 PEM-encoded Ed25519 private key.
    pub fn from_pem(pem: &str) -> Result<Self, IdentityError> {
        let keypair = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| IdentityError::InvalidPem(e.to_string()))?;
        Ok(Self::from_keypair(keypair))
    }

    /// Export the key as a PKCS#8 PEM string.
    pub fn to_pem(&self) -> Result<String, IdentityError> {
        use ed25519_dalek::pkcs8::EncodePrivateKey;
        self.keypair
            .to_pkcs8_pem(Default::default())
            .map(|z| z.to_string())
            .map_err(|e| IdentityError::InvalidPem(e.to_string()))
    }

    /// Present this identity under a named DID while keeping the key.
    pub fn wrap(self, did: Did) -> Result<Self, IdentityError> {
        if did.is_key() {
            return Err(IdentityError::NotWrappable(did));
        }
        Ok(Self {
            did,
            keypair: self.keypair,
        })
    }

    /// The DID this identity presents itself as.
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// The key-bound DID derived from the underlying keypair.
    pub fn key_did(&self) -> Did {
        Did::from_pubkey(&self.pubkey())
    }

    /// Whether this identity presents a named DID over its key.
    pub fn is_wrapped(&self) -> bool {
        !self.did.is_key()
    }

    /// The 32-byte Ed25519 public key.
    pub fn pubkey(&self) -> [u8; 32] {
        self.keypair.verifying_key().to_bytes()
    }

    /// Sign data with this identity's private key.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.keypair.sign(data).to_bytes()
    }

    /// Verify a signature against a public key.
    pub fn verify(pubkey: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(pubkey) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        verifying_key
            .verify(data, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_sign_verify() {
        let id = Identity::generate();
        let data = b"egress batch";
        let sig = id.sign(data);
        assert!(Identity::verify(&id.pubkey(), data, &sig));
        assert!(!Identity::verify(&id.pubkey(), b"other data", &sig));
    }

    #[test]
    fn wrong_pubkey_fails() {
        let a = Identity::generate();
        let b = Identity::generate();
        let sig = a.sign(b"data");
        assert!(!Identity::verify(&b.pubkey(), b"data", &sig));
    }

    #[test]
    fn bad_signature_length_fails() {
        let id = Identity::generate();
        assert!(!Identity::verify(&id.pubkey(), b"data", &[0u8; 10]));
    }

    #[test]
    fn pem_roundtrip() {
        let id = Identity::generate();
        let pem = id.to_pem().unwrap();
        let restored = Identity::from_pem(&pem).unwrap();
        assert_eq!(restored.pubkey(), id.pubkey());
        assert_eq!(restored.did(), id.did());
    }

    #[test]
    fn invalid_pem_rejected() {
        assert!(Identity::from_pem("not a pem").is_err());
    }

    #[test]
    fn wrap_requires_named_did() {
        let id = Identity::generate();
        let key_did = id.key_did();
        assert!(id.clone().wrap(key_did.clone()).is_err());

        let wrapped = id.wrap(Did::web("tollgate.network")).unwrap();
        assert!(wrapped.is_wrapped());
        assert_eq!(wrapped.did(), &Did::web("tollgate.network"));
        assert_eq!(wrapped.key_did(), key_did);
    }
}
