use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use tollgate_capability::abilities::{ConsolidateCaveats, ConsolidateError, ConsolidateOk, CONSOLIDATE, RETRIEVE};
use tollgate_capability::{
    invoke, Capability, CapabilityError, Cid, DispatchError, DispatchServer, Invocation, Out,
    Receipt,
};
use tollgate_identity::{Did, Identity, PrincipalResolver};
use tollgate_metrics::Metrics;
use tollgate_tables::{
    ConsolidatedTable, ConsumerTable, EgressRecord, EgressTable, SpaceStatsTable, TableError,
};
use tollgate_validator::ValidationContext;

use crate::handler::ConsolidateHandler;

#[derive(Debug, Error)]
pub enum ConsolidatorError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// The consolidation engine.
///
/// Consolidation happens as the result of a `space/egress/consolidate`
/// invocation which the engine issues to itself through an in-process
/// dispatcher, so the durable artifact of every drained batch is a
/// signed receipt, the same artifact network callers get.
pub struct Consolidator {
    id: Arc<Identity>,
    egress: Arc<dyn EgressTable>,
    consolidated: Arc<dyn ConsolidatedTable>,
    dispatch: DispatchServer,
    interval: Duration,
    batch_size: usize,
    stop_signal: Notify,
    metrics: Arc<Metrics>,
}

impl Consolidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Arc<Identity>,
        egress: Arc<dyn EgressTable>,
        consolidated: Arc<dyn ConsolidatedTable>,
        space_stats: Arc<dyn SpaceStatsTable>,
        consumers: Arc<dyn ConsumerTable>,
        known_providers: Vec<Did>,
        interval: Duration,
        batch_size: usize,
        resolver: Arc<PrincipalResolver>,
        authority_proofs: Vec<tollgate_capability::Delegation>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let validation = ValidationContext::new(
            id.did().clone(),
            RETRIEVE,
            resolver.clone(),
            authority_proofs,
        );
        let handler =
            ConsolidateHandler::new(space_stats, consumers, known_providers, validation);

        let mut dispatch = DispatchServer::new(id.clone()).with_resolver(resolver);
        dispatch.register(CONSOLIDATE, Arc::new(handler));

        Self {
            id,
            egress,
            consolidated,
            dispatch,
            interval,
            batch_size,
            stop_signal: Notify::new(),
            metrics,
        }
    }

    /// Run the ticker loop until the shutdown channel flips or
    /// [`Consolidator::stop`] is called.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; the first real cycle comes one
        // interval after start.
        ticker.tick().await;

        info!(interval_secs = self.interval.as_secs(), "consolidator started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("consolidator stopping due to shutdown signal");
                    return;
                }
                _ = self.stop_signal.notified() => {
                    info!("consolidator stopping");
                    return;
                }
                _ = ticker.tick() => {
                    // A shutdown mid-cycle abandons the in-flight work;
                    // unmarked records are retried after restart.
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!("consolidator stopping during cycle");
                            return;
                        }
                        _ = self.stop_signal.notified() => {
                            info!("consolidator stopping during cycle");
                            return;
                        }
                        result = self.consolidate() => {
                            if let Err(e) = result {
                                error!(error = %e, "consolidation error");
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stop_signal.notify_one();
    }

    /// One consolidation cycle: drain, process sequentially, mark.
    pub async fn consolidate(&self) -> Result<(), ConsolidatorError> {
        info!("starting consolidation cycle");
        let started = Instant::now();

        let records = self.egress.get_unprocessed(self.batch_size).await?;
        if records.is_empty() {
            info!("no unprocessed records found");
            self.observe_run(started);
            return Ok(());
        }
        info!(count = records.len(), "processing unprocessed records");

        let mut successful: Vec<EgressRecord> = Vec::with_capacity(records.len());
        for record in records {
            let node = record.node.clone();
            let batch = record.batch;

            let inv = match self.synthesize_invocation(&record) {
                Ok(inv) => inv,
                Err(e) => {
                    error!(node = %node, batch = %batch, error = %e, "generating consolidation invocation");
                    continue;
                }
            };

            let receipt = match self.exec_consolidate_invocation(&inv).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    error!(node = %node, batch = %batch, error = %e, "executing consolidation invocation");
                    match self.issue_error_receipt(&inv, &e.to_string()) {
                        Ok(receipt) => receipt,
                        Err(e) => {
                            error!(node = %node, batch = %batch, error = %e, "issuing error receipt");
                            continue;
                        }
                    }
                }
            };

            let total_egress = match receipt.typed_out::<ConsolidateOk, ConsolidateError>() {
                Ok(Ok(ok)) => ok.total_egress,
                Ok(Err(failure)) => {
                    error!(node = %node, batch = %batch, error = %failure.message, "consolidation error");
                    0
                }
                Err(e) => {
                    error!(node = %node, batch = %batch, error = %e, "reading consolidation receipt");
                    0
                }
            };

            let archive = match receipt.archive() {
                Ok(archive) => archive,
                Err(e) => {
                    error!(node = %node, batch = %batch, error = %e, "archiving consolidation receipt");
                    continue;
                }
            };

            // One consolidated record per batch; replays of the same
            // cause are swallowed as idempotent.
            let fresh = match self
                .consolidated
                .add(inv.link(), &node, total_egress, &archive)
                .await
            {
                Ok(()) => true,
                Err(TableError::AlreadyExists) => {
                    debug!(batch = %batch, "batch already consolidated");
                    false
                }
                Err(e) => {
                    error!(node = %node, batch = %batch, error = %e, "failed to add consolidated record");
                    continue;
                }
            };

            successful.push(record);

            if fresh {
                self.metrics
                    .consolidated_bytes
                    .inc_by(&node.to_string(), total_egress);
            }

            info!(node = %node, batch = %batch, total_egress, "consolidated batch");
        }

        let marked = successful.len();
        let mark_result = self.egress.mark_as_processed(&successful).await;
        match &mark_result {
            Ok(()) => self.metrics.unprocessed_batches.sub(marked as i64),
            Err(e) => error!(error = %e, "marking records as processed"),
        }

        self.observe_run(started);
        info!(successful = marked, "consolidation cycle completed");

        mark_result.map_err(Into::into)
    }

    /// The signed receipt persisted for `cause`, for the lookup route.
    pub async fn get_receipt(&self, cause: &Cid) -> Result<Receipt, ConsolidatorError> {
        let record = self.consolidated.get(cause).await?;
        Ok(Receipt::extract(&record.receipt)?)
    }

    /// Build the self-addressed consolidate invocation for a record,
    /// carrying every block of the original track invocation so the
    /// handler can materialize it.
    fn synthesize_invocation(&self, record: &EgressRecord) -> Result<Invocation, ConsolidatorError> {
        let cap = Capability::new(
            CONSOLIDATE,
            self.id.did().clone(),
            &ConsolidateCaveats {
                cause: record.cause.link(),
            },
        )?;
        let mut inv = invoke(&self.id, self.id.did(), cap, vec![])?;
        for block in record.cause.blocks() {
            inv.attach(block.clone());
        }
        Ok(inv)
    }

    /// Loop the invocation back through the engine's own dispatcher.
    async fn exec_consolidate_invocation(
        &self,
        inv: &Invocation,
    ) -> Result<Receipt, DispatchError> {
        let mut receipts = self.dispatch.execute(vec![inv.clone()]).await?;
        if receipts.is_empty() {
            return Err(DispatchError::Handler(format!(
                "missing receipt for invocation {}",
                inv.link()
            )));
        }
        Ok(receipts.remove(0))
    }

    /// Persist a locally-issued error receipt when the handler could
    /// not produce one.
    fn issue_error_receipt(
        &self,
        inv: &Invocation,
        message: &str,
    ) -> Result<Receipt, ConsolidatorError> {
        Ok(Receipt::issue(
            &self.id,
            Out::err(&ConsolidateError::new(message))?,
            inv,
            vec![],
        )?)
    }

    fn observe_run(&self, started: Instant) {
        self.metrics
            .consolidation_runs
            .observe(started.elapsed().as_millis() as u64);
    }
}
