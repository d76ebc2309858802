//! Tollgate Validator
//!
//! Authorizes retrieval capabilities by walking an invocation's
//! delegation chain back to the resource owner, or to a delegation
//! attested by a trusted authority on the service's behalf.
//!
//! Expiration is deliberately not enforced: tracked receipts carry
//! their own temporal ordering via the batch's receipt time. The
//! revocation probe is part of the context but always answers "not
//! revoked" in this service.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use tollgate_capability::abilities::{AttestCaveats, ATTEST};
use tollgate_capability::{Capability, Cid, Delegation, Invocation};
use tollgate_identity::{Did, PrincipalResolver};

/// Delegation chains deeper than this are rejected outright.
const MAX_CHAIN_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unable to resolve {0} to a key-bound DID")]
    UnresolvedDid(Did),
    #[error("invalid signature by {0}")]
    SignatureInvalid(Did),
    #[error("claimed caveats do not match the delegated caveats")]
    CaveatsMismatch,
    #[error("delegation audience {actual} does not match issuer {expected}")]
    AudienceMismatch { expected: Did, actual: Did },
    #[error("{0}")]
    PrincipalAlignment(String),
}

/// Everything needed to authorize one capability claim.
pub struct ValidationContext {
    /// The service's own identifier, as presented (the subject of
    /// authority attestations).
    authority: Did,
    /// The ability being claimed, e.g. `space/content/retrieve`.
    ability: String,
    resolver: Arc<PrincipalResolver>,
    /// Delegations the service issued at startup granting trusted
    /// authorities the right to attest arbitrary delegations on its
    /// behalf. Value-owned by the context.
    authority_proofs: Vec<Delegation>,
    /// Revocation probe; always "not revoked" here.
    revoked: Arc<dyn Fn(&Cid) -> bool + Send + Sync>,
}

impl ValidationContext {
    pub fn new(
        authority: Did,
        ability: impl Into<String>,
        resolver: Arc<PrincipalResolver>,
        authority_proofs: Vec<Delegation>,
    ) -> Self {
        Self {
            authority,
            ability: ability.into(),
            resolver,
            authority_proofs,
            revoked: Arc::new(|_| false),
        }
    }

    /// The DIDs allowed to attest delegations on the service's behalf.
    fn trusted_authorities(&self) -> HashSet<Did> {
        self.authority_proofs
            .iter()
            .filter(|p| {
                p.issuer() == &self.authority
                    && p.capabilities()
                        .iter()
                        .any(|c| c.can == ATTEST && c.with == self.authority)
            })
            .map(|p| p.audience().clone())
            .collect()
    }
}

/// Walk the proof chain of `invocation` and return the authorized
/// capability, or the first failure encountered on the best path.
pub fn access(
    invocation: &Invocation,
    ctx: &ValidationContext,
) -> Result<Capability, ValidationError> {
    let caps = invocation.capabilities();
    if caps.len() != 1 {
        return Err(ValidationError::PrincipalAlignment(format!(
            "expected exactly one capability, got {}",
            caps.len()
        )));
    }
    let claimed = caps[0].clone();
    if claimed.can != ctx.ability {
        return Err(ValidationError::PrincipalAlignment(format!(
            "invocation claims '{}', expected '{}'",
            claimed.can, ctx.ability
        )));
    }

    verify_link_signature(invocation, ctx)?;

    let owner = claimed.with.clone();

    // A principal may always act on its own resources.
    if invocation.issuer() == &owner {
        return Ok(claimed);
    }

    let attested = collect_attestations(invocation, ctx);
    walk(invocation, &claimed, &owner, ctx, &attested, 0)
}

fn walk(
    delegation: &Delegation,
    claimed: &Capability,
    owner: &Did,
    ctx: &ValidationContext,
    attested: &HashSet<Cid>,
    depth: usize,
) -> Result<Capability, ValidationError> {
    if depth >= MAX_CHAIN_DEPTH {
        return Err(ValidationError::PrincipalAlignment(
            "delegation chain too deep".into(),
        ));
    }

    let proofs = delegation
        .proofs()
        .map_err(|e| ValidationError::PrincipalAlignment(format!("unreadable proof: {e}")))?;

    let mut last_err = ValidationError::PrincipalAlignment(format!(
        "no proof path from {} to resource owner {}",
        delegation.issuer(),
        owner
    ));

    for proof in proofs {
        // Attestation delegations are consumed by collect_attestations,
        // not walked as capability links.
        if proof.capabilities().iter().any(|c| c.can == ATTEST) {
            continue;
        }

        if (ctx.revoked)(&proof.link()) {
            last_err =
                ValidationError::PrincipalAlignment(format!("delegation {} is revoked", proof.link()));
            continue;
        }

        match check_link(&proof, delegation, claimed, ctx) {
            Err(e) => last_err = e,
            Ok(()) => {
                if proof.issuer() == owner {
                    trace!(owner = %owner, "chain terminates at resource owner");
                    return Ok(claimed.clone());
                }
                if attested.contains(&proof.link()) {
                    trace!(delegation = %proof.link(), "chain terminates at attested delegation");
                    return Ok(claimed.clone());
                }
                match walk(&proof, claimed, owner, ctx, attested, depth + 1) {
                    Ok(cap) => return Ok(cap),
                    Err(e) => last_err = e,
                }
            }
        }
    }

    Err(last_err)
}

/// Check one chain link: `proof` must be addressed to the child's
/// issuer, must delegate the claimed capability, and must be signed by
/// its own issuer.
fn check_link(
    proof: &Delegation,
    child: &Delegation,
    claimed: &Capability,
    ctx: &ValidationContext,
) -> Result<(), ValidationError> {
    if proof.audience() != child.issuer() {
        return Err(ValidationError::AudienceMismatch {
            expected: child.issuer().clone(),
            actual: proof.audience().clone(),
        });
    }

    let mut matched = false;
    let mut caveat_failure = false;
    for cap in proof.capabilities() {
        if cap.can != claimed.can && cap.can != "*" {
            continue;
        }
        if cap.with != claimed.with {
            continue;
        }
        if cap.is_unconstrained() || cap.nb == claimed.nb {
            matched = true;
            break;
        }
        caveat_failure = true;
    }
    if !matched {
        if caveat_failure {
            return Err(ValidationError::CaveatsMismatch);
        }
        return Err(ValidationError::PrincipalAlignment(format!(
            "proof by {} does not delegate '{}' on {}",
            proof.issuer(),
            claimed.can,
            claimed.with
        )));
    }

    verify_link_signature(proof, ctx)
}

fn verify_link_signature(
    delegation: &Delegation,
    ctx: &ValidationContext,
) -> Result<(), ValidationError> {
    let issuer = delegation.issuer();
    let key_did = ctx
        .resolver
        .resolve(issuer)
        .map_err(|_| ValidationError::UnresolvedDid(issuer.clone()))?;
    let pubkey = key_did
        .to_pubkey()
        .ok_or_else(|| ValidationError::UnresolvedDid(issuer.clone()))?;
    if !delegation.verify_signature(&pubkey) {
        return Err(ValidationError::SignatureInvalid(issuer.clone()));
    }
    Ok(())
}

/// Gather the set of delegation CIDs attested by trusted authorities,
/// scanning every delegation reachable from the invocation.
fn collect_attestations(invocation: &Invocation, ctx: &ValidationContext) -> HashSet<Cid> {
    let trusted = ctx.trusted_authorities();
    let mut attested = HashSet::new();
    let mut stack = vec![invocation.clone()];
    let mut seen = HashSet::new();

    while let Some(delegation) = stack.pop() {
        if !seen.insert(delegation.link()) {
            continue;
        }
        let Ok(proofs) = delegation.proofs() else {
            continue;
        };
        for proof in proofs {
            for cap in proof.capabilities() {
                if cap.can != ATTEST || cap.with != ctx.authority {
                    continue;
                }
                if !trusted.contains(proof.issuer()) {
                    continue;
                }
                if verify_link_signature(&proof, ctx).is_err() {
                    continue;
                }
                if let Ok(caveats) = cap.caveats::<AttestCaveats>() {
                    attested.insert(caveats.proof);
                }
            }
            stack.push(proof);
        }
    }

    attested
}
