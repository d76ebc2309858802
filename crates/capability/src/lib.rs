//! Tollgate Capability
//!
//! The host protocol substrate for the Tollgate egress accounting
//! service: content-addressed blocks and bundles, signed capability
//! delegations, invocations, receipts, and the in-process ability
//! dispatcher shared by the HTTP transport and the consolidation
//! engine.
//!
//! Wire encoding is CBOR for structural nodes and raw bytes for opaque
//! leaves; block hashing is SHA-256.

pub mod abilities;
pub mod block;
pub mod bundle;
pub mod cid;
pub mod delegation;
pub mod dispatch;
pub mod invocation;
pub mod receipt;

pub use block::Block;
pub use bundle::Bundle;
pub use cid::{Cid, Codec};
pub use delegation::{Capability, Delegation, DelegationPayload};
pub use dispatch::{AbilityHandler, DispatchError, DispatchServer, HandlerOutput};
pub use invocation::{invoke, Invocation};
pub use receipt::{Out, Receipt, ReceiptPayload};

use thiserror::Error;

use crate::cid::CidError;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("cbor encoding failed: {0}")]
    Encode(String),
    #[error("cbor decoding failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Cid(#[from] CidError),
    #[error("block {0} digest does not match its content")]
    DigestMismatch(Cid),
    #[error("block {0} is not present in the archive")]
    MissingBlock(Cid),
    #[error("bundle has no root block")]
    MissingRoot,
}

impl From<serde_cbor::Error> for CapabilityError {
    fn from(e: serde_cbor::Error) -> Self {
        // serde_cbor uses one error type for both directions; the message
        // distinguishes them well enough for logs.
        CapabilityError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CapabilityError>;
