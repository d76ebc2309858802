//! Service configuration.
//!
//! Loaded from a JSON settings file via `tollgate-settings`; flag and
//! environment binding live outside this crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tollgate_identity::Did;

/// Ticks more frequent than this put needless pressure on node
/// endpoints.
pub const MIN_CONSOLIDATION_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP listen port.
    pub port: u16,
    /// PEM-encoded Ed25519 private key; the service identity.
    pub private_key: String,
    /// Optional named identifier wrapping the key identity.
    pub did: Option<String>,
    /// Backing file of the SQLite reference adapters.
    pub database_path: String,

    pub egress_table_name: String,
    pub egress_unprocessed_index_name: String,
    pub consolidated_table_name: String,
    pub consolidated_node_stats_index_name: String,
    pub space_stats_table_name: String,
    pub consumer_table_name: String,
    pub consumer_customer_index_name: String,
    pub customer_table_name: String,
    pub storage_provider_table_name: String,

    /// Allow-list of storage provider IDs spaces must be provisioned
    /// with.
    pub known_providers: Vec<String>,
    /// IDs authorized to attest delegations on the service's behalf.
    pub trusted_authorities: Vec<String>,

    /// Seconds between consolidation ticks.
    pub consolidation_interval: u64,
    /// Records drained per tick.
    pub consolidation_batch_size: usize,

    /// Bearer token gating `GET /metrics`; absent disables the route.
    pub metrics_auth_token: Option<String>,
    /// Label applied to all emitted metrics.
    pub metrics_environment: String,

    /// Display-only pricing.
    pub client_egress_usd_per_tib: f64,
    pub provider_egress_usd_per_tib: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            private_key: String::new(),
            did: None,
            database_path: "tollgate.db".into(),
            egress_table_name: "egress".into(),
            egress_unprocessed_index_name: "egress_unprocessed".into(),
            consolidated_table_name: "consolidated".into(),
            consolidated_node_stats_index_name: "consolidated_node_stats".into(),
            space_stats_table_name: "space_stats".into(),
            consumer_table_name: "consumers".into(),
            consumer_customer_index_name: "consumers_customer".into(),
            customer_table_name: "customers".into(),
            storage_provider_table_name: "storage_providers".into(),
            known_providers: vec![],
            trusted_authorities: vec![],
            consolidation_interval: MIN_CONSOLIDATION_INTERVAL_SECS,
            consolidation_batch_size: 100,
            metrics_auth_token: None,
            metrics_environment: "dev".into(),
            client_egress_usd_per_tib: 0.0,
            provider_egress_usd_per_tib: 0.0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.private_key.trim().is_empty() {
            return Err(ConfigError::MissingKey("private_key"));
        }
        if self.consolidation_interval < MIN_CONSOLIDATION_INTERVAL_SECS {
            return Err(ConfigError::Invalid {
                key: "consolidation_interval",
                reason: format!("must be at least {MIN_CONSOLIDATION_INTERVAL_SECS} seconds"),
            });
        }
        if self.consolidation_batch_size < 1 {
            return Err(ConfigError::Invalid {
                key: "consolidation_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if let Some(did) = &self.did {
            did.parse::<Did>().map_err(|e| ConfigError::Invalid {
                key: "did",
                reason: e.to_string(),
            })?;
        }
        self.known_provider_dids()?;
        self.trusted_authority_dids()?;
        Ok(())
    }

    pub fn known_provider_dids(&self) -> Result<Vec<Did>, ConfigError> {
        parse_dids(&self.known_providers, "known_providers")
    }

    pub fn trusted_authority_dids(&self) -> Result<Vec<Did>, ConfigError> {
        parse_dids(&self.trusted_authorities, "trusted_authorities")
    }
}

fn parse_dids(values: &[String], key: &'static str) -> Result<Vec<Did>, ConfigError> {
    values
        .iter()
        .map(|s| {
            s.parse().map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{s}': {e}"),
            })
        })
        .collect()
}
