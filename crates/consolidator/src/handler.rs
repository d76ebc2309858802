//! The `space/egress/consolidate` handler: fetch a tracked batch from
//! the submitting node, validate each retrieval receipt, and sum the
//! authorized bytes per space.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use tollgate_capability::abilities::{
    ConsolidateCaveats, ConsolidateOk, RetrieveCaveats, RetrieveOk, TrackCaveats, RETRIEVE,
};
use tollgate_capability::{
    AbilityHandler, Bundle, Capability, CapabilityError, Cid, Delegation, DispatchError,
    HandlerOutput, Invocation, Out, Receipt,
};
use tollgate_identity::Did;
use tollgate_tables::{ConsumerTable, SpaceStatsTable};
use tollgate_validator::{access, ValidationContext};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct ConsolidateHandler {
    client: reqwest::Client,
    space_stats: Arc<dyn SpaceStatsTable>,
    consumers: Arc<dyn ConsumerTable>,
    known_providers: Vec<Did>,
    validation: ValidationContext,
}

impl ConsolidateHandler {
    pub(crate) fn new(
        space_stats: Arc<dyn SpaceStatsTable>,
        consumers: Arc<dyn ConsumerTable>,
        known_providers: Vec<Did>,
        validation: ValidationContext,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client"),
            space_stats,
            consumers,
            known_providers,
            validation,
        }
    }

    /// GET the batch from the node's endpoint and split it into
    /// receipts. Each block of the returned bundle is an archived
    /// receipt; extraction failures are surfaced per item so one bad
    /// block does not discard the batch.
    async fn fetch_receipts(
        &self,
        endpoint: &str,
        batch: &Cid,
    ) -> Result<Vec<Result<Receipt, CapabilityError>>, String> {
        let batch_str = batch.to_string();
        let url = percent_decode(endpoint)
            .replace("{cid}", &batch_str)
            .replace(":cid", &batch_str);

        debug!(url = %url, "fetching receipts");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("fetching receipts from {url}: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status code: {}", status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| format!("reading receipt batch body: {e}"))?;

        let bundle =
            Bundle::decode(&body).map_err(|e| format!("decoding receipt batch: {e}"))?;

        Ok(bundle
            .blocks
            .into_iter()
            .map(|block| Receipt::extract(block.data()))
            .collect())
    }

    /// Ordered validation of one retrieval receipt; the first failing
    /// step wins.
    async fn validate_retrieval_receipt(
        &self,
        requester: &Did,
        receipt: &Receipt,
    ) -> Result<Capability, String> {
        if !receipt.out().is_ok() {
            return Err("receipt is a failure receipt".into());
        }

        receipt
            .typed_out::<RetrieveOk, serde_cbor::Value>()
            .map_err(|e| format!("receipt is not a space/content/retrieve receipt: {e}"))?;

        if receipt.issuer() != requester {
            return Err("receipt is not issued by the requester node".into());
        }

        let pubkey = requester
            .to_pubkey()
            .ok_or_else(|| format!("requester node {requester} is not key-bound"))?;
        if !receipt.verify_signature(&pubkey) {
            return Err("receipt signature is invalid".into());
        }

        let invocation = receipt
            .ran_invocation()
            .map_err(|_| "original retrieve invocation must be attached to the receipt".to_string())?;

        if invocation.capabilities().len() != 1 {
            return Err("expected exactly one capability in the invocation".into());
        }
        let cap = &invocation.capabilities()[0];
        if cap.can != RETRIEVE {
            return Err(format!(
                "original invocation is not a {RETRIEVE} invocation, but a {} one",
                cap.can
            ));
        }

        // The space must be provisioned with a provider we bill for.
        let consumer = self
            .consumers
            .get(&cap.with)
            .await
            .map_err(|e| format!("failed to get consumer: {e}"))?;
        if !self.known_providers.contains(&consumer.provider) {
            return Err(format!("unknown space provider {}", consumer.provider));
        }

        access(&invocation, &self.validation)
            .map_err(|e| format!("invalid delegation chain: {e}"))
    }
}

#[async_trait]
impl AbilityHandler for ConsolidateHandler {
    async fn handle(&self, invocation: Invocation) -> Result<HandlerOutput, DispatchError> {
        let cap = invocation
            .capabilities()
            .first()
            .ok_or(DispatchError::NoCapability)?;
        let caveats: ConsolidateCaveats = cap
            .caveats()
            .map_err(|e| DispatchError::Handler(format!("reading consolidate caveats: {e}")))?;

        // The original track invocation travels as attached blocks.
        let track_inv = Delegation::from_blocks(&caveats.cause, invocation.block_map())
            .map_err(|e| {
                DispatchError::Handler(format!("fetching attached track invocation: {e}"))
            })?;
        let requester = track_inv.issuer().clone();

        let track_cap = track_inv.capabilities().first().ok_or_else(|| {
            DispatchError::Handler("track invocation carries no capability".into())
        })?;
        let track_caveats: TrackCaveats = track_cap
            .caveats()
            .map_err(|e| DispatchError::Handler(format!("reading track caveats: {e}")))?;

        let receipts = self
            .fetch_receipts(&track_caveats.endpoint, &track_caveats.receipts)
            .await
            .map_err(|e| DispatchError::Handler(format!("fetching receipts: {e}")))?;

        let mut total_egress = 0u64;
        for item in receipts {
            let receipt = match item {
                Ok(receipt) => receipt,
                Err(e) => {
                    error!(error = %e, "failed to extract receipt from batch");
                    continue;
                }
            };

            let cap = match self.validate_retrieval_receipt(&requester, &receipt).await {
                Ok(cap) => cap,
                Err(e) => {
                    warn!(receipt = %receipt.link(), reason = %e, "invalid receipt");
                    continue;
                }
            };

            let (space, size) = match extract_properties(&cap) {
                Ok(properties) => properties,
                Err(e) => {
                    warn!(receipt = %receipt.link(), reason = %e, "failed to extract size from receipt");
                    continue;
                }
            };

            // The per-node total still accrues when the counter write
            // fails; the daily counter is display-oriented.
            if let Err(e) = self.space_stats.record(&space, size).await {
                error!(space = %space, error = %e, "failed to record space stats");
            }

            total_egress += size;
        }

        Ok(HandlerOutput::ok(Out::ok(&ConsolidateOk { total_egress })?))
    }
}

/// The space and byte count a validated retrieval capability accounts
/// for.
fn extract_properties(cap: &Capability) -> Result<(Did, u64), String> {
    let caveats: RetrieveCaveats = cap
        .caveats()
        .map_err(|e| format!("reading retrieve caveats: {e}"))?;
    Ok((cap.with.clone(), caveats.range.size()))
}

/// Decode `%XX` escapes so endpoints submitted in percent-encoded form
/// still match the `{cid}` placeholder. Invalid escapes pass through.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| input.to_string())
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
