use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const CID_VERSION: u8 = 0x01;
const TEXT_PREFIX: char = 'z';

#[derive(Debug, Error)]
pub enum CidError {
    #[error("invalid CID format: {0}")]
    InvalidFormat(String),
    #[error("invalid base58 encoding: {0}")]
    InvalidBase58(#[from] bs58::decode::Error),
    #[error("unsupported codec byte: {0:#04x}")]
    UnsupportedCodec(u8),
    #[error("invalid CID length: {0}")]
    InvalidLength(usize),
}

/// Codec of the bytes a CID addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Codec {
    /// CBOR structural node.
    Cbor,
    /// Opaque byte leaf.
    Raw,
}

impl Codec {
    fn byte(self) -> u8 {
        match self {
            Self::Cbor => 0x51,
            Self::Raw => 0x55,
        }
    }

    fn from_byte(b: u8) -> Result<Self, CidError> {
        match b {
            0x51 => Ok(Self::Cbor),
            0x55 => Ok(Self::Raw),
            other => Err(CidError::UnsupportedCodec(other)),
        }
    }
}

/// A content identifier: the SHA-256 digest of a block's bytes, tagged
/// with the codec of those bytes.
///
/// Text form is `z` followed by the base58 encoding of
/// `version ‖ codec ‖ digest`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    codec: Codec,
    digest: [u8; 32],
}

impl Cid {
    /// Compute the CID of a byte sequence.
    pub fn of(codec: Codec, data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self {
            codec,
            digest: digest.into(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = Vec::with_capacity(34);
        bytes.push(CID_VERSION);
        bytes.push(self.codec.byte());
        bytes.extend_from_slice(&self.digest);
        write!(f, "{TEXT_PREFIX}{}", bs58::encode(bytes).into_string())
    }
}

// Cids appear in log fields and error messages constantly; Debug output
// matching Display keeps those readable.
impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(TEXT_PREFIX)
            .ok_or_else(|| CidError::InvalidFormat(format!("must start with '{TEXT_PREFIX}'")))?;
        let bytes = bs58::decode(encoded).into_vec()?;
        if bytes.len() != 34 {
            return Err(CidError::InvalidLength(bytes.len()));
        }
        if bytes[0] != CID_VERSION {
            return Err(CidError::InvalidFormat(format!(
                "unsupported version byte {:#04x}",
                bytes[0]
            )));
        }
        let codec = Codec::from_byte(bytes[1])?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[2..]);
        Ok(Self { codec, digest })
    }
}

impl TryFrom<String> for Cid {
    type Error = CidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let cid = Cid::of(Codec::Cbor, b"some structural node");
        let parsed: Cid = cid.to_string().parse().unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn codec_distinguishes_cids() {
        let cbor = Cid::of(Codec::Cbor, b"data");
        let raw = Cid::of(Codec::Raw, b"data");
        assert_ne!(cbor, raw);
        assert_eq!(cbor.digest(), raw.digest());
    }

    #[test]
    fn content_determines_digest() {
        assert_eq!(Cid::of(Codec::Raw, b"a"), Cid::of(Codec::Raw, b"a"));
        assert_ne!(Cid::of(Codec::Raw, b"a"), Cid::of(Codec::Raw, b"b"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Cid>().is_err());
        assert!("not-a-cid".parse::<Cid>().is_err());
        assert!("z0OIl".parse::<Cid>().is_err());
        // valid base58 but wrong length
        let short = format!("z{}", bs58::encode(&[1u8, 0x51]).into_string());
        assert!(short.parse::<Cid>().is_err());
    }

    #[test]
    fn parse_rejects_unknown_codec() {
        let mut bytes = vec![1u8, 0x99];
        bytes.extend_from_slice(&[0u8; 32]);
        let s = format!("z{}", bs58::encode(&bytes).into_string());
        assert!(matches!(
            s.parse::<Cid>(),
            Err(CidError::UnsupportedCodec(0x99))
        ));
    }
}
