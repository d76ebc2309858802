//! The invocation pipeline's service methods.
//!
//! Every handler's return value, including typed domain errors, is
//! wrapped into a signed receipt by the dispatcher; only transport
//! failures surface as HTTP errors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;

use tollgate_capability::abilities::{
    ConsolidateCaveats, DailyEntry, GetCaveats, GetError, GetOk, SpaceEgressEntry, TrackCaveats,
    TrackError, TrackOk, ACCOUNT_GET, CONSOLIDATE, TRACK,
};
use tollgate_capability::{
    invoke, AbilityHandler, Capability, DispatchError, DispatchServer, HandlerOutput, Invocation,
    Out,
};
use tollgate_identity::Identity;
use tollgate_service::{Period, Service, ServiceError};

/// Register the pipeline's ability handlers on a dispatcher.
pub fn register(dispatch: &mut DispatchServer, service: Arc<Service>, id: Arc<Identity>) {
    dispatch.register(
        TRACK,
        Arc::new(TrackHandler {
            service: service.clone(),
            id,
        }),
    );
    dispatch.register(ACCOUNT_GET, Arc::new(AccountEgressHandler { service }));
}

/// `space/egress/track`: durably enqueue the batch and advertise the
/// consolidation that will follow as a forked effect.
struct TrackHandler {
    service: Arc<Service>,
    id: Arc<Identity>,
}

#[async_trait]
impl AbilityHandler for TrackHandler {
    async fn handle(&self, invocation: Invocation) -> Result<HandlerOutput, DispatchError> {
        let node = invocation.issuer().clone();
        let cap = invocation
            .capabilities()
            .first()
            .ok_or(DispatchError::NoCapability)?;
        let caveats: TrackCaveats = cap
            .caveats()
            .map_err(|e| DispatchError::Handler(format!("reading track caveats: {e}")))?;

        if let Err(e) = self
            .service
            .record(&node, caveats.receipts, &caveats.endpoint, &invocation)
            .await
        {
            return Ok(HandlerOutput::ok(Out::err(&TrackError::new(
                e.to_string(),
            ))?));
        }

        // The durable write is done; the forked effect is advertisory.
        // The consolidation engine is the actual executor and will
        // synthesize this same invocation on its own schedule.
        let consolidate_inv = invoke(
            &self.id,
            self.id.did(),
            Capability::new(
                CONSOLIDATE,
                self.id.did().clone(),
                &ConsolidateCaveats {
                    cause: invocation.link(),
                },
            )?,
            vec![],
        )?;

        Ok(HandlerOutput {
            out: Out::ok(&TrackOk::default())?,
            fx: vec![consolidate_inv],
        })
    }
}

/// `account/egress/get`: windowed account statistics with space and
/// period filters.
struct AccountEgressHandler {
    service: Arc<Service>,
}

#[async_trait]
impl AbilityHandler for AccountEgressHandler {
    async fn handle(&self, invocation: Invocation) -> Result<HandlerOutput, DispatchError> {
        let cap = invocation
            .capabilities()
            .first()
            .ok_or(DispatchError::NoCapability)?;
        let account = cap.with.clone();

        let caveats: GetCaveats = if cap.is_unconstrained() {
            GetCaveats::default()
        } else {
            cap.caveats()
                .map_err(|e| DispatchError::Handler(format!("reading get caveats: {e}")))?
        };

        let spaces = caveats.spaces.unwrap_or_default();
        let period = match caveats.period {
            None => None,
            Some(p) => {
                let (Some(from), Some(to)) = (
                    DateTime::from_timestamp(p.from, 0),
                    DateTime::from_timestamp(p.to, 0),
                ) else {
                    return Ok(HandlerOutput::ok(Out::err(&GetError::new(
                        "PeriodNotAcceptable",
                        "period timestamps are out of range",
                    ))?));
                };
                Some(Period { from, to })
            }
        };

        match self.service.get_account_egress(&account, &spaces, period).await {
            Ok(egress) => {
                let spaces = egress
                    .spaces
                    .into_iter()
                    .map(|(space, data)| SpaceEgressEntry {
                        space,
                        total: data.total,
                        daily: data
                            .daily_stats
                            .into_iter()
                            .map(|d| DailyEntry {
                                date: d.date.to_string(),
                                egress: d.egress,
                            })
                            .collect(),
                    })
                    .collect();
                Ok(HandlerOutput::ok(Out::ok(&GetOk {
                    total: egress.total,
                    spaces,
                })?))
            }
            Err(e @ ServiceError::AccountNotFound(_)) => Ok(HandlerOutput::ok(Out::err(
                &GetError::new("AccountNotFound", e.to_string()),
            )?)),
            Err(e @ ServiceError::SpaceUnauthorized { .. }) => Ok(HandlerOutput::ok(Out::err(
                &GetError::new("SpaceUnauthorized", e.to_string()),
            )?)),
            Err(e @ ServiceError::PeriodNotAcceptable(_)) => Ok(HandlerOutput::ok(Out::err(
                &GetError::new("PeriodNotAcceptable", e.to_string()),
            )?)),
            // Storage failures are system errors, not domain outcomes.
            Err(e) => Err(DispatchError::Handler(e.to_string())),
        }
    }
}
