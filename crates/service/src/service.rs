use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use thiserror::Error;
use tracing::error;

use tollgate_capability::{Cid, Invocation};
use tollgate_identity::Did;
use tollgate_metrics::Metrics;
use tollgate_tables::{
    ConsolidatedTable, ConsumerTable, CustomerTable, DailyStat, EgressTable, SpaceStatsTable,
    StorageProviderRecord, StorageProviderTable, TableError,
};

use crate::stats::{Period, Stats};

const MAX_PERIOD_DAYS: i64 = 60;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("customer account {0} not found")]
    AccountNotFound(Did),
    #[error("space {space} is not owned by account {account}")]
    SpaceUnauthorized { space: Did, account: Did },
    #[error("{0}")]
    PeriodNotAcceptable(String),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Egress data for a single space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpaceEgress {
    pub total: u64,
    pub daily_stats: Vec<DailyStat>,
}

/// Complete egress data for an account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountEgress {
    pub total: u64,
    pub spaces: BTreeMap<Did, SpaceEgress>,
}

pub struct ProviderWithStats {
    pub provider: StorageProviderRecord,
    /// Kept as a result so callers can render partial listings.
    pub stats: Result<Stats, ServiceError>,
}

pub struct AllProvidersStats {
    pub providers: Vec<ProviderWithStats>,
    pub next_token: Option<String>,
}

pub struct AccountStats {
    pub account: Did,
    pub stats: Result<Stats, ServiceError>,
}

pub struct AllAccountsStats {
    pub accounts: Vec<AccountStats>,
    pub next_token: Option<String>,
}

/// The accounting service layer, shared by the invocation pipeline and
/// the admin roll-ups.
pub struct Service {
    environment: String,
    egress: Arc<dyn EgressTable>,
    consolidated: Arc<dyn ConsolidatedTable>,
    providers: Arc<dyn StorageProviderTable>,
    customers: Arc<dyn CustomerTable>,
    consumers: Arc<dyn ConsumerTable>,
    space_stats: Arc<dyn SpaceStatsTable>,
    metrics: Arc<Metrics>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        environment: impl Into<String>,
        egress: Arc<dyn EgressTable>,
        consolidated: Arc<dyn ConsolidatedTable>,
        providers: Arc<dyn StorageProviderTable>,
        customers: Arc<dyn CustomerTable>,
        consumers: Arc<dyn ConsumerTable>,
        space_stats: Arc<dyn SpaceStatsTable>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            environment: environment.into(),
            egress,
            consolidated,
            providers,
            customers,
            consumers,
            space_stats,
            metrics,
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Durably enqueue a tracked batch and bump the pipeline meters.
    pub async fn record(
        &self,
        node: &Did,
        receipts: Cid,
        endpoint: &str,
        cause: &Invocation,
    ) -> Result<(), ServiceError> {
        self.egress.record(receipts, node, endpoint, cause).await?;

        self.metrics.tracked_batches.inc(&node.to_string());
        self.metrics.unprocessed_batches.add(1);

        Ok(())
    }

    /// Windowed egress statistics for a storage node, from the
    /// consolidated per-node totals. `processed_at` is the
    /// authoritative time for bucketing.
    pub async fn get_stats(&self, node: &Did) -> Result<Stats, ServiceError> {
        let mut stats = Stats::new(Utc::now());
        let records = self
            .consolidated
            .get_stats_by_node(node, stats.earliest())
            .await?;
        for record in records {
            stats.add_egress(record.total_egress, record.processed_at);
        }
        Ok(stats)
    }

    /// Egress data for an account with optional space and period
    /// filters.
    pub async fn get_account_egress(
        &self,
        account: &Did,
        spaces_filter: &[Did],
        period_filter: Option<Period>,
    ) -> Result<AccountEgress, ServiceError> {
        if !self.customers.has(account).await? {
            return Err(ServiceError::AccountNotFound(account.clone()));
        }

        let owned_spaces = self.consumers.list_by_customer(account).await?;
        let spaces_to_query: Vec<Did> = if spaces_filter.is_empty() {
            owned_spaces
        } else {
            for space in spaces_filter {
                if !owned_spaces.contains(space) {
                    return Err(ServiceError::SpaceUnauthorized {
                        space: space.clone(),
                        account: account.clone(),
                    });
                }
            }
            spaces_filter.to_vec()
        };

        // An account with no spaces is a success with zeros.
        if spaces_to_query.is_empty() {
            return Ok(AccountEgress::default());
        }

        let period = match period_filter {
            Some(period) => validate_period(period)?,
            None => default_period(Utc::now()),
        };

        let mut total = 0u64;
        let mut spaces = BTreeMap::new();
        for space in spaces_to_query {
            let daily = match self
                .space_stats
                .get_daily_stats(&space, period.from.date_naive(), period.to.date_naive())
                .await
            {
                Ok(daily) => daily,
                Err(e) => {
                    error!(space = %space, error = %e, "failed to get daily stats for space");
                    // Partial results: skip this space, keep the rest.
                    continue;
                }
            };

            let space_total: u64 = daily.iter().map(|d| d.egress).sum();
            total += space_total;
            // A space with no data still appears, with zero egress.
            spaces.insert(
                space,
                SpaceEgress {
                    total: space_total,
                    daily_stats: daily,
                },
            );
        }

        Ok(AccountEgress { total, spaces })
    }

    /// Paginated per-provider roll-ups for the operator dashboard.
    pub async fn get_all_providers_stats(
        &self,
        limit: usize,
        start_token: Option<&str>,
    ) -> Result<AllProvidersStats, ServiceError> {
        let page = self.providers.get_all(limit, start_token).await?;

        let mut providers = Vec::with_capacity(page.records.len());
        for provider in page.records {
            let stats = self.get_stats(&provider.provider).await;
            providers.push(ProviderWithStats { provider, stats });
        }

        Ok(AllProvidersStats {
            providers,
            next_token: page.cursor,
        })
    }

    /// Paginated per-account roll-ups for the operator dashboard.
    pub async fn get_all_accounts_stats(
        &self,
        limit: usize,
        start_token: Option<&str>,
    ) -> Result<AllAccountsStats, ServiceError> {
        let page = self.customers.list(limit, start_token).await?;

        let mut accounts = Vec::with_capacity(page.customers.len());
        for account in page.customers {
            let stats = self.get_account_stats(&account).await;
            accounts.push(AccountStats { account, stats });
        }

        Ok(AllAccountsStats {
            accounts,
            next_token: page.cursor,
        })
    }

    /// Aggregated windowed stats across every space an account owns.
    async fn get_account_stats(&self, account: &Did) -> Result<Stats, ServiceError> {
        let mut stats = Stats::new(Utc::now());
        let spaces = self.consumers.list_by_customer(account).await?;

        for space in spaces {
            let daily = match self
                .space_stats
                .get_daily_stats(
                    &space,
                    stats.earliest().date_naive(),
                    Utc::now().date_naive(),
                )
                .await
            {
                Ok(daily) => daily,
                Err(e) => {
                    error!(space = %space, error = %e, "failed to get daily stats for space");
                    continue;
                }
            };
            for stat in daily {
                let when = Utc
                    .from_utc_datetime(&stat.date.and_hms_opt(0, 0, 0).unwrap_or_default());
                stats.add_egress(stat.egress, when);
            }
        }

        Ok(stats)
    }
}

/// Default query period: first day of the last complete month to now.
fn default_period(now: DateTime<Utc>) -> Period {
    let (year, month) = (now.year(), now.month());
    let (prev_year, prev_month) = if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    };
    let from = Utc
        .with_ymd_and_hms(prev_year, prev_month, 1, 0, 0, 0)
        .single()
        .expect("valid UTC calendar date");
    Period { from, to: now }
}

fn validate_period(period: Period) -> Result<Period, ServiceError> {
    let from = truncate_to_date(period.from);
    let to = truncate_to_date(period.to);

    if from >= to {
        return Err(ServiceError::PeriodNotAcceptable(format!(
            "'from' date {from} is after or same as 'to' date {to}"
        )));
    }
    let days = (to - from).num_days();
    if days > MAX_PERIOD_DAYS {
        return Err(ServiceError::PeriodNotAcceptable(format!(
            "requested period exceeds maximum of {MAX_PERIOD_DAYS} days"
        )));
    }

    Ok(Period { from, to })
}

fn truncate_to_date(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default())
}
