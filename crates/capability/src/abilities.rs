//! Ability names and typed caveat/result structs for the egress
//! accounting protocol.

use serde::{Deserialize, Serialize};

use tollgate_identity::Did;

use crate::cid::Cid;

/// A storage node asks the service to track a batch of retrieval
/// receipts for egress accounting.
pub const TRACK: &str = "space/egress/track";

/// The service consolidates a tracked batch: fetch, validate, sum.
pub const CONSOLIDATE: &str = "space/egress/consolidate";

/// A retrieval served by a storage node out of a space.
pub const RETRIEVE: &str = "space/content/retrieve";

/// A customer account asks for its egress statistics.
pub const ACCOUNT_GET: &str = "account/egress/get";

/// A trusted authority attests a delegation on the service's behalf.
pub const ATTEST: &str = "ucan/attest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackCaveats {
    /// Content id of the receipt bundle held by the node.
    pub receipts: Cid,
    /// URL with a `{cid}` (or `:cid`) placeholder for fetching batches.
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackOk {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackError {
    pub message: String,
}

impl TrackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidateCaveats {
    /// The track invocation that caused this consolidation.
    pub cause: Cid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidateOk {
    pub total_egress: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidateError {
    pub message: String,
}

impl ConsolidateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Inclusive byte range of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered: `end - start + 1`.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveCaveats {
    /// Content id of the blob served.
    pub blob: Cid,
    pub range: ByteRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrieveOk {}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodCaveat {
    /// Unix seconds, UTC.
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetCaveats {
    pub spaces: Option<Vec<Did>>,
    pub period: Option<PeriodCaveat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    /// Calendar date, `YYYY-MM-DD`, UTC.
    pub date: String,
    pub egress: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceEgressEntry {
    pub space: Did,
    pub total: u64,
    pub daily: Vec<DailyEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOk {
    pub total: u64,
    pub spaces: Vec<SpaceEgressEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetError {
    /// One of `AccountNotFound`, `SpaceUnauthorized`,
    /// `PeriodNotAcceptable`.
    pub name: String,
    pub message: String,
}

impl GetError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestCaveats {
    /// The delegation being attested, by content id.
    pub proof: Cid,
}
