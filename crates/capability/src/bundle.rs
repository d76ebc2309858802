//! Self-describing content-addressed bundles.
//!
//! A bundle is the transport unit of the host protocol: a CBOR envelope
//! of root CIDs plus the blocks they reference. POST bodies, receipt
//! responses, batch payloads from storage nodes, and archived
//! delegations all travel as bundles. Decoding verifies every block's
//! digest against its claimed CID.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::cid::Cid;
use crate::Result;

#[derive(Serialize, Deserialize)]
struct BundleRepr {
    roots: Vec<Cid>,
    blocks: Vec<(Cid, Vec<u8>)>,
}

/// A decoded bundle: roots and the blocks that back them.
#[derive(Debug, Clone, Default)]
pub struct Bundle {
    pub roots: Vec<Cid>,
    pub blocks: Vec<Block>,
}

impl Bundle {
    pub fn new(roots: Vec<Cid>, blocks: Vec<Block>) -> Self {
        Self { roots, blocks }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let repr = BundleRepr {
            roots: self.roots.clone(),
            blocks: self
                .blocks
                .iter()
                .map(|b| (b.cid(), b.data().to_vec()))
                .collect(),
        };
        Ok(serde_cbor::to_vec(&repr)?)
    }

    /// Decode from wire bytes, verifying each block digest.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let repr: BundleRepr = serde_cbor::from_slice(bytes)?;
        let mut blocks = Vec::with_capacity(repr.blocks.len());
        for (cid, data) in repr.blocks {
            blocks.push(Block::verified(cid, data)?);
        }
        Ok(Self {
            roots: repr.roots,
            blocks,
        })
    }

    /// Find a block by CID.
    pub fn get(&self, cid: &Cid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.cid() == *cid)
    }
}
