use std::collections::HashMap;

use thiserror::Error;

use crate::{Did, DidError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unable to resolve {0}: not found in mapping")]
    Unresolved(Did),
}

/// Maps named DIDs to their key-bound form.
///
/// The mapping is closed: it is fixed when the resolver is constructed
/// at startup. Resolution is a pure lookup, so results are cacheable
/// for the lifetime of the process.
#[derive(Debug, Default, Clone)]
pub struct PrincipalResolver {
    mapping: HashMap<Did, Did>,
}

impl PrincipalResolver {
    pub fn new(pairs: impl IntoIterator<Item = (Did, Did)>) -> Self {
        Self {
            mapping: pairs.into_iter().collect(),
        }
    }

    /// Build a resolver from string pairs, failing on any unparseable DID.
    pub fn from_strings<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, DidError> {
        let mut mapping = HashMap::new();
        for (named, key) in pairs {
            mapping.insert(named.parse()?, key.parse()?);
        }
        Ok(Self { mapping })
    }

    /// Resolve a DID to its key-bound form.
    ///
    /// Key-bound DIDs resolve to themselves; named DIDs are looked up in
    /// the mapping.
    pub fn resolve(&self, did: &Did) -> Result<Did, ResolveError> {
        if did.is_key() {
            return Ok(did.clone());
        }
        self.mapping
            .get(did)
            .cloned()
            .ok_or_else(|| ResolveError::Unresolved(did.clone()))
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}
