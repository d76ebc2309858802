//! In-process ability dispatch.
//!
//! Both the HTTP transport and the consolidation engine drive the same
//! dispatcher, so every side-effectful action in the system produces a
//! signed receipt, whether it arrived over the network or was
//! synthesized locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use tollgate_identity::{Identity, PrincipalResolver};

use crate::block::Block;
use crate::bundle::Bundle;
use crate::cid::Cid;
use crate::delegation::Delegation;
use crate::invocation::Invocation;
use crate::receipt::{Out, Receipt};
use crate::CapabilityError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for ability '{0}'")]
    UnknownAbility(String),
    #[error("invocation carries no capability")]
    NoCapability,
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("{0}")]
    Handler(String),
}

/// What a handler returns: the typed outcome plus any forked effect
/// invocations to advertise in the receipt.
pub struct HandlerOutput {
    pub out: Out,
    pub fx: Vec<Invocation>,
}

impl HandlerOutput {
    pub fn ok(out: Out) -> Self {
        Self { out, fx: vec![] }
    }
}

/// Implemented by services that execute invocations of one ability.
///
/// Returning `Err` signals a transport-level failure (no receipt is
/// issued); typed domain errors belong inside `HandlerOutput::out`.
#[async_trait]
pub trait AbilityHandler: Send + Sync {
    async fn handle(&self, invocation: Invocation) -> Result<HandlerOutput, DispatchError>;
}

/// Dispatches invocations by ability and signs the resulting receipts.
pub struct DispatchServer {
    id: Arc<Identity>,
    resolver: Option<Arc<PrincipalResolver>>,
    methods: HashMap<String, Arc<dyn AbilityHandler>>,
}

impl DispatchServer {
    pub fn new(id: Arc<Identity>) -> Self {
        Self {
            id,
            resolver: None,
            methods: HashMap::new(),
        }
    }

    /// Resolve named issuer DIDs through `resolver` when verifying
    /// invocation envelopes.
    pub fn with_resolver(mut self, resolver: Arc<PrincipalResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn register(&mut self, ability: impl Into<String>, handler: Arc<dyn AbilityHandler>) {
        self.methods.insert(ability.into(), handler);
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// Check the envelope signature before any handler runs.
    fn verify_invocation(&self, invocation: &Invocation) -> Result<(), DispatchError> {
        let issuer = invocation.issuer();
        let pubkey = if issuer == self.id.did() {
            // Self-issued invocations (the consolidation loopback)
            // verify against our own key even under a named DID.
            self.id.pubkey()
        } else if let Some(pubkey) = issuer.to_pubkey() {
            pubkey
        } else {
            self.resolver
                .as_ref()
                .and_then(|r| r.resolve(issuer).ok())
                .and_then(|did| did.to_pubkey())
                .ok_or_else(|| {
                    DispatchError::InvalidInvocation(format!("unable to resolve issuer {issuer}"))
                })?
        };

        if !invocation.verify_signature(&pubkey) {
            return Err(DispatchError::InvalidInvocation(
                "invocation signature is invalid".into(),
            ));
        }
        Ok(())
    }

    /// Execute invocations and issue a signed receipt for each.
    pub async fn execute(
        &self,
        invocations: Vec<Invocation>,
    ) -> Result<Vec<Receipt>, DispatchError> {
        let mut receipts = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            self.verify_invocation(&invocation)?;

            let ability = invocation
                .capabilities()
                .first()
                .ok_or(DispatchError::NoCapability)?
                .can
                .clone();
            let handler = self
                .methods
                .get(&ability)
                .ok_or_else(|| DispatchError::UnknownAbility(ability.clone()))?;

            debug!(ability = %ability, invocation = %invocation.link(), "dispatching invocation");

            let output = handler.handle(invocation.clone()).await?;
            let receipt = Receipt::issue(&self.id, output.out, &invocation, output.fx)?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// Transport entry point: a request bundle of invocations in, a
    /// response bundle of receipts out.
    pub async fn request(&self, body: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let bundle = Bundle::decode(body)?;
        let store: BTreeMap<Cid, Block> = bundle
            .blocks
            .into_iter()
            .map(|b| (b.cid(), b))
            .collect();

        let mut invocations = Vec::with_capacity(bundle.roots.len());
        for root in &bundle.roots {
            invocations.push(Delegation::from_blocks(root, &store)?);
        }

        let receipts = self.execute(invocations).await?;

        let roots = receipts.iter().map(|r| r.link()).collect();
        let mut blocks: BTreeMap<Cid, Block> = BTreeMap::new();
        for receipt in &receipts {
            for block in receipt.blocks() {
                blocks.insert(block.cid(), block.clone());
            }
        }
        Ok(Bundle::new(roots, blocks.into_values().collect()).encode()?)
    }
}
