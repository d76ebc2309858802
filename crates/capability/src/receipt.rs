//! Signed receipts: the outcome of an invocation, plus forked effects.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;

use tollgate_identity::{Did, Identity};

use crate::block::Block;
use crate::bundle::Bundle;
use crate::cid::Cid;
use crate::delegation::Delegation;
use crate::invocation::Invocation;
use crate::{CapabilityError, Result};

/// The outcome carried by a receipt: a typed success or a typed error,
/// both opaque CBOR at the envelope level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Out {
    Ok(Value),
    Err(Value),
}

impl Out {
    pub fn ok<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Ok(
            serde_cbor::value::to_value(value).map_err(|e| CapabilityError::Encode(e.to_string()))?,
        ))
    }

    pub fn err<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Err(
            serde_cbor::value::to_value(value).map_err(|e| CapabilityError::Encode(e.to_string()))?,
        ))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// The invocation this receipt is for.
    pub ran: Cid,
    pub out: Out,
    /// Forked effect invocations, advertisory only.
    pub fx: Vec<Cid>,
    pub iss: Did,
    pub prf: Vec<Cid>,
}

#[derive(Serialize, Deserialize)]
struct ReceiptRepr {
    payload: ReceiptPayload,
    signature: Vec<u8>,
}

/// An issued, signed statement of an invocation's outcome.
///
/// The blocks of the ran invocation and of any forked effects are
/// attached, so a receipt archives into a self-contained bundle.
#[derive(Debug, Clone)]
pub struct Receipt {
    payload: ReceiptPayload,
    signature: Vec<u8>,
    root: Block,
    attached: BTreeMap<Cid, Block>,
}

impl Receipt {
    /// Issue a receipt for `ran`, signed by `issuer`, declaring `fx` as
    /// forked effects.
    pub fn issue(issuer: &Identity, out: Out, ran: &Invocation, fx: Vec<Invocation>) -> Result<Self> {
        let payload = ReceiptPayload {
            ran: ran.link(),
            out,
            fx: fx.iter().map(|inv| inv.link()).collect(),
            iss: issuer.did().clone(),
            prf: vec![],
        };
        let payload_bytes =
            serde_cbor::to_vec(&payload).map_err(|e| CapabilityError::Encode(e.to_string()))?;
        let signature = issuer.sign(&payload_bytes).to_vec();
        let root = Block::cbor(&ReceiptRepr {
            payload: payload.clone(),
            signature: signature.clone(),
        })?;

        let mut attached = BTreeMap::new();
        for block in ran.blocks() {
            attached.insert(block.cid(), block.clone());
        }
        for inv in &fx {
            for block in inv.blocks() {
                attached.insert(block.cid(), block.clone());
            }
        }
        attached.remove(&root.cid());

        Ok(Self {
            payload,
            signature,
            root,
            attached,
        })
    }

    /// Materialize a receipt rooted at `root` out of a block store.
    pub fn from_blocks(root: &Cid, blocks: &BTreeMap<Cid, Block>) -> Result<Self> {
        let root_block = blocks
            .get(root)
            .ok_or(CapabilityError::MissingBlock(*root))?
            .clone();
        let repr: ReceiptRepr = serde_cbor::from_slice(root_block.data())?;
        let mut attached = blocks.clone();
        attached.remove(root);
        Ok(Self {
            payload: repr.payload,
            signature: repr.signature,
            root: root_block,
            attached,
        })
    }

    pub fn link(&self) -> Cid {
        self.root.cid()
    }

    pub fn issuer(&self) -> &Did {
        &self.payload.iss
    }

    pub fn ran(&self) -> Cid {
        self.payload.ran
    }

    pub fn out(&self) -> &Out {
        &self.payload.out
    }

    pub fn fx_links(&self) -> &[Cid] {
        &self.payload.fx
    }

    pub fn root(&self) -> &Block {
        &self.root
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.attached.values().chain(std::iter::once(&self.root))
    }

    /// Verify the payload signature against an Ed25519 public key.
    pub fn verify_signature(&self, pubkey: &[u8; 32]) -> bool {
        match serde_cbor::to_vec(&self.payload) {
            Ok(bytes) => Identity::verify(pubkey, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Decode the outcome under typed success/error schemas.
    pub fn typed_out<O, E>(&self) -> Result<std::result::Result<O, E>>
    where
        O: DeserializeOwned,
        E: DeserializeOwned,
    {
        match &self.payload.out {
            Out::Ok(v) => serde_cbor::value::from_value(v.clone())
                .map(Ok)
                .map_err(|e| CapabilityError::Decode(e.to_string())),
            Out::Err(v) => serde_cbor::value::from_value(v.clone())
                .map(Err)
                .map_err(|e| CapabilityError::Decode(e.to_string())),
        }
    }

    /// The ran invocation, which must be attached inline.
    pub fn ran_invocation(&self) -> Result<Invocation> {
        Delegation::from_blocks(&self.payload.ran, &self.attached)
    }

    /// The forked effect invocations.
    pub fn fx_invocations(&self) -> Result<Vec<Invocation>> {
        self.payload
            .fx
            .iter()
            .map(|cid| Delegation::from_blocks(cid, &self.attached))
            .collect()
    }

    /// Serialize to a self-contained bundle.
    pub fn archive(&self) -> Result<Vec<u8>> {
        Bundle::new(vec![self.link()], self.blocks().cloned().collect()).encode()
    }

    /// Reconstruct a receipt from its archived bundle.
    pub fn extract(bytes: &[u8]) -> Result<Self> {
        let bundle = Bundle::decode(bytes)?;
        let root = *bundle.roots.first().ok_or(CapabilityError::MissingRoot)?;
        let map: BTreeMap<Cid, Block> = bundle.blocks.into_iter().map(|b| (b.cid(), b)).collect();
        Self::from_blocks(&root, &map)
    }
}
