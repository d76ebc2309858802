//! Signed capability delegations.
//!
//! A delegation is a signed, optionally-expiring statement of the form
//! "issuer grants capability to audience, with proofs". The signature
//! covers the CBOR encoding of the payload; proof delegations travel as
//! attached blocks so a delegation archives into a self-contained
//! bundle.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;

use tollgate_identity::{Did, Identity};

use crate::block::Block;
use crate::bundle::Bundle;
use crate::cid::Cid;
use crate::{CapabilityError, Result};

/// An `(ability, resource, caveats)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Hierarchical dotted ability, e.g. `space/egress/track`.
    pub can: String,
    /// The resource the ability applies to.
    pub with: Did,
    /// Ability-specific caveats as a CBOR value; `Null` means
    /// unconstrained.
    pub nb: Value,
}

impl Capability {
    pub fn new<C: Serialize>(can: impl Into<String>, with: Did, caveats: &C) -> Result<Self> {
        Ok(Self {
            can: can.into(),
            with,
            nb: serde_cbor::value::to_value(caveats)
                .map_err(|e| CapabilityError::Encode(e.to_string()))?,
        })
    }

    /// A capability with no caveats.
    pub fn bare(can: impl Into<String>, with: Did) -> Self {
        Self {
            can: can.into(),
            with,
            nb: Value::Null,
        }
    }

    /// Decode the caveats into a typed struct.
    pub fn caveats<C: DeserializeOwned>(&self) -> Result<C> {
        serde_cbor::value::from_value(self.nb.clone())
            .map_err(|e| CapabilityError::Decode(e.to_string()))
    }

    pub fn is_unconstrained(&self) -> bool {
        self.nb == Value::Null
    }
}

// Payloads carry no nonce: an envelope's identity is fully determined
// by its content, so resubmitting the same statement yields the same
// CID. The consolidation engine's idempotent replay depends on this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationPayload {
    pub iss: Did,
    pub aud: Did,
    pub att: Vec<Capability>,
    pub prf: Vec<Cid>,
    pub exp: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct DelegationRepr {
    payload: DelegationPayload,
    signature: Vec<u8>,
}

/// A signed capability grant with its proof chain attached.
#[derive(Debug, Clone)]
pub struct Delegation {
    payload: DelegationPayload,
    signature: Vec<u8>,
    root: Block,
    attached: BTreeMap<Cid, Block>,
}

impl Delegation {
    /// Issue a delegation of `capabilities` to `audience`, carrying
    /// `proofs` as the chain back to the resource owner.
    pub fn delegate(
        issuer: &Identity,
        audience: &Did,
        capabilities: Vec<Capability>,
        proofs: Vec<Delegation>,
        expiration: Option<u64>,
    ) -> Result<Self> {
        let payload = DelegationPayload {
            iss: issuer.did().clone(),
            aud: audience.clone(),
            att: capabilities,
            prf: proofs.iter().map(|p| p.link()).collect(),
            exp: expiration,
        };
        let payload_bytes =
            serde_cbor::to_vec(&payload).map_err(|e| CapabilityError::Encode(e.to_string()))?;
        let signature = issuer.sign(&payload_bytes).to_vec();
        let root = Block::cbor(&DelegationRepr {
            payload: payload.clone(),
            signature: signature.clone(),
        })?;

        let mut attached = BTreeMap::new();
        for proof in &proofs {
            for block in proof.blocks() {
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

    /// Materialize a delegation rooted at `root` out of a block store.
    pub fn from_blocks(root: &Cid, blocks: &BTreeMap<Cid, Block>) -> Result<Self> {
        let root_block = blocks
            .get(root)
            .ok_or(CapabilityError::MissingBlock(*root))?
            .clone();
        let repr: DelegationRepr = serde_cbor::from_slice(root_block.data())?;
        let mut attached = blocks.clone();
        attached.remove(root);
        Ok(Self {
            payload: repr.payload,
            signature: repr.signature,
            root: root_block,
            attached,
        })
    }

    /// The content id of this delegation's root block.
    pub fn link(&self) -> Cid {
        self.root.cid()
    }

    pub fn issuer(&self) -> &Did {
        &self.payload.iss
    }

    pub fn audience(&self) -> &Did {
        &self.payload.aud
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.payload.att
    }

    pub fn proof_links(&self) -> &[Cid] {
        &self.payload.prf
    }

    pub fn expiration(&self) -> Option<u64> {
        self.payload.exp
    }

    pub fn root(&self) -> &Block {
        &self.root
    }

    /// Attach an extra block (e.g. the blocks of a referenced
    /// invocation) so it travels with this delegation's archive.
    pub fn attach(&mut self, block: Block) {
        if block.cid() != self.root.cid() {
            self.attached.insert(block.cid(), block);
        }
    }

    /// All blocks of this delegation: attachments plus the root.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.attached.values().chain(std::iter::once(&self.root))
    }

    /// The attached block store, keyed by CID.
    pub fn block_map(&self) -> &BTreeMap<Cid, Block> {
        &self.attached
    }

    /// Materialize the proof delegations referenced by `prf`.
    pub fn proofs(&self) -> Result<Vec<Delegation>> {
        self.payload
            .prf
            .iter()
            .map(|cid| Self::from_blocks(cid, &self.attached))
            .collect()
    }

    /// Verify the payload signature against an Ed25519 public key.
    pub fn verify_signature(&self, pubkey: &[u8; 32]) -> bool {
        match serde_cbor::to_vec(&self.payload) {
            Ok(bytes) => Identity::verify(pubkey, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Serialize to a self-contained bundle.
    pub fn archive(&self) -> Result<Vec<u8>> {
        Bundle::new(vec![self.link()], self.blocks().cloned().collect()).encode()
    }

    /// Reconstruct a delegation from its archived bundle.
    pub fn extract(bytes: &[u8]) -> Result<Self> {
        let bundle = Bundle::decode(bytes)?;
        let root = *bundle.roots.first().ok_or(CapabilityError::MissingRoot)?;
        let map: BTreeMap<Cid, Block> = bundle.blocks.into_iter().map(|b| (b.cid(), b)).collect();
        Self::from_blocks(&root, &map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retrieve_cap(space: &Did) -> Capability {
        Capability::bare("space/content/retrieve", space.clone())
    }

    #[test]
    fn delegate_and_verify() {
        let space = Identity::generate();
        let alice = Identity::generate();

        let dlg = Delegation::delegate(
            &space,
            alice.did(),
            vec![retrieve_cap(space.did())],
            vec![],
            None,
        )
        .unwrap();

        assert_eq!(dlg.issuer(), space.did());
        assert_eq!(dlg.audience(), alice.did());
        assert!(dlg.verify_signature(&space.pubkey()));
        assert!(!dlg.verify_signature(&alice.pubkey()));
    }

    #[test]
    fn archive_extract_roundtrip() {
        let space = Identity::generate();
        let alice = Identity::generate();
        let node = Identity::generate();

        let prf = Delegation::delegate(
            &space,
            alice.did(),
            vec![retrieve_cap(space.did())],
            vec![],
            None,
        )
        .unwrap();

        let inv = Delegation::delegate(
            &alice,
            node.did(),
            vec![retrieve_cap(space.did())],
            vec![prf.clone()],
            None,
        )
        .unwrap();

        let bytes = inv.archive().unwrap();
        let restored = Delegation::extract(&bytes).unwrap();

        assert_eq!(restored.link(), inv.link());
        assert_eq!(restored.issuer(), alice.did());
        assert!(restored.verify_signature(&alice.pubkey()));

        let proofs = restored.proofs().unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].link(), prf.link());
        assert!(proofs[0].verify_signature(&space.pubkey()));
    }

    #[test]
    fn missing_proof_block_is_an_error() {
        let space = Identity::generate();
        let alice = Identity::generate();

        let prf = Delegation::delegate(
            &space,
            alice.did(),
            vec![retrieve_cap(space.did())],
            vec![],
            None,
        )
        .unwrap();

        let payload = DelegationPayload {
            iss: alice.did().clone(),
            aud: space.did().clone(),
            att: vec![retrieve_cap(space.did())],
            prf: vec![prf.link()],
            exp: None,
        };
        let signature = alice.sign(&serde_cbor::to_vec(&payload).unwrap()).to_vec();
        let root = Block::cbor(&DelegationRepr {
            payload: payload.clone(),
            signature: signature.clone(),
        })
        .unwrap();
        let dangling = Delegation {
            payload,
            signature,
            root,
            attached: BTreeMap::new(),
        };

        assert!(matches!(
            dangling.proofs(),
            Err(CapabilityError::MissingBlock(_))
        ));
    }

    #[test]
    fn typed_caveats_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Caveats {
            limit: u64,
        }

        let space = Identity::generate();
        let cap =
            Capability::new("space/content/retrieve", space.did().clone(), &Caveats { limit: 9 })
                .unwrap();
        assert!(!cap.is_unconstrained());
        assert_eq!(cap.caveats::<Caveats>().unwrap(), Caveats { limit: 9 });
    }
}
