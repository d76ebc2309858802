use serde::Serialize;

use crate::cid::{Cid, Codec};
use crate::Result;

/// A content-addressed block: bytes plus the CID that names them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Encode a value as a CBOR structural block.
    pub fn cbor<T: Serialize>(value: &T) -> Result<Self> {
        let data = serde_cbor::to_vec(value)?;
        Ok(Self {
            cid: Cid::of(Codec::Cbor, &data),
            data,
        })
    }

    /// Wrap opaque bytes as a raw leaf block.
    pub fn raw(data: Vec<u8>) -> Self {
        Self {
            cid: Cid::of(Codec::Raw, &data),
            data,
        }
    }

    /// Reconstruct a block from stored parts, verifying the digest.
    pub fn verified(cid: Cid, data: Vec<u8>) -> Result<Self> {
        if Cid::of(cid.codec(), &data) != cid {
            return Err(crate::CapabilityError::DigestMismatch(cid));
        }
        Ok(Self { cid, data })
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
