//! Invocations: leaf delegations addressed to their executor.

use tollgate_identity::{Did, Identity};

use crate::delegation::{Capability, Delegation};
use crate::Result;

/// An invocation is a delegation whose audience is the executor; it
/// carries the chain of proof delegations back to the resource owner.
pub type Invocation = Delegation;

/// Build an invocation of `capability` addressed to `executor`.
///
/// Invocations do not expire; temporal ordering comes from the
/// surrounding protocol (batch receipt times), not the envelope.
pub fn invoke(
    issuer: &Identity,
    executor: &Did,
    capability: Capability,
    proofs: Vec<Delegation>,
) -> Result<Invocation> {
    Delegation::delegate(issuer, executor, vec![capability], proofs, None)
}
