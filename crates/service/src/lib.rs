//! Tollgate Service
//!
//! The accounting service layer: records tracked batches, and derives
//! windowed egress statistics for storage nodes and customer accounts
//! from the consolidated and per-space counter tables.

pub mod service;
pub mod stats;

pub use service::{
    AccountEgress, AccountStats, AllAccountsStats, AllProvidersStats, ProviderWithStats, Service,
    ServiceError, SpaceEgress,
};
pub use stats::{Period, PeriodStats, Stats};
