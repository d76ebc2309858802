use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_PREFIX: &str = "did:key:";
const WEB_PREFIX: &str = "did:web:";

#[derive(Debug, Error)]
pub enum DidError {
    #[error("invalid DID format: {0}")]
    InvalidFormat(String),
    #[error("invalid base58 encoding: {0}")]
    InvalidBase58(#[from] bs58::decode::Error),
    #[error("invalid public key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}

/// A principal identifier.
///
/// Two forms are recognized: a key-bound form carrying an Ed25519 public
/// key (`did:key:<base58_pubkey>`) that can verify signatures directly,
/// and a named form (`did:web:<domain>`) that must be resolved to a
/// key-bound DID before signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Did {
    Key([u8; 32]),
    Web(String),
}

impl Did {
    /// Create a key-bound DID from a 32-byte Ed25519 public key.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        Self::Key(*pubkey)
    }

    /// Create a named DID from a domain name.
    pub fn web(domain: impl Into<String>) -> Self {
        Self::Web(domain.into())
    }

    /// The public key bound to this DID, if it is key-bound.
    pub fn to_pubkey(&self) -> Option<[u8; 32]> {
        match self {
            Self::Key(pk) => Some(*pk),
            Self::Web(_) => None,
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Self::Key(_))
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(pk) => write!(f, "{KEY_PREFIX}{}", bs58::encode(pk).into_string()),
            Self::Web(domain) => write!(f, "{WEB_PREFIX}{domain}"),
        }
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(encoded) = s.strip_prefix(KEY_PREFIX) {
            if encoded.is_empty() {
                return Err(DidError::InvalidFormat("missing key portion".into()));
            }
            let bytes = bs58::decode(encoded).into_vec()?;
            if bytes.len() != 32 {
                return Err(DidError::InvalidKeyLength(bytes.len()));
            }
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&bytes);
            Ok(Self::Key(pk))
        } else if let Some(domain) = s.strip_prefix(WEB_PREFIX) {
            if domain.is_empty() {
                return Err(DidError::InvalidFormat("missing domain portion".into()));
            }
            Ok(Self::Web(domain.to_string()))
        } else {
            Err(DidError::InvalidFormat(format!(
                "must start with '{KEY_PREFIX}' or '{WEB_PREFIX}'"
            )))
        }
    }
}

impl TryFrom<String> for Did {
    type Error = DidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.to_string()
    }
}
