//! Fixed principal mapping for the production network.
//!
//! Named service identifiers resolve to the key-bound DIDs listed
//! here; the mapping is closed once the resolver is built at startup.

use tollgate_identity::{DidError, PrincipalResolver};

const PRINCIPAL_MAPPING: &[(&str, &str)] = &[
    (
        "did:web:registrar.tollgate.network",
        "did:key:6ip65UzAByXUEh95BFN4MBRTP3B8EbTT3KTSpLGMcShq",
    ),
    (
        "did:web:staging.registrar.tollgate.network",
        "did:key:EbeM6rNhWYdU4EuXGi7VA9HcSCaiuL5fHxqc6CNdTHNr",
    ),
    (
        "did:web:indexer.tollgate.network",
        "did:key:CgU24o8VpJ1N5WSNz2LmCNNHHQfmecQUhLof4FCKWs3g",
    ),
    (
        "did:web:staging.indexer.tollgate.network",
        "did:key:GxpH6RQteJPtB97hssShWbxcV38VjLq6arDdTMMNAYDc",
    ),
    (
        "did:web:up.tollgate.network",
        "did:key:9SDZa3qzQU8WBYjagcmDLF7ipTAWvFjZoQRkzpeHsgcR",
    ),
    (
        "did:web:staging.up.tollgate.network",
        "did:key:3no11BMF5VLFSU7qjwMtfS77siYbRtsRcBkSh5hRxUyQ",
    ),
];

pub fn preset_resolver() -> Result<PrincipalResolver, DidError> {
    PrincipalResolver::from_strings(PRINCIPAL_MAPPING.iter().copied())
}
