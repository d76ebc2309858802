//! Tollgate Identity
//!
//! Principal identifiers and signing identities for the Tollgate egress
//! accounting service. Every actor in the system (the service itself,
//! storage nodes, customer accounts, storage spaces) is named by a
//! [`Did`]. Key-bound DIDs can verify signatures directly; named DIDs
//! are resolved to key-bound ones via a [`PrincipalResolver`].

pub mod did;
pub mod identity;
pub mod resolver;

pub use did::{Did, DidError};
pub use identity::{Identity, IdentityError};
pub use resolver::{PrincipalResolver, ResolveError};
