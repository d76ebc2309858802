use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use tollgate_capability::abilities::ATTEST;
use tollgate_capability::{Capability, CapabilityError, Delegation, DispatchServer};
use tollgate_consolidator::Consolidator;
use tollgate_identity::{Did, DidError, Identity, IdentityError};
use tollgate_logging::LogLevel;
use tollgate_metrics::Metrics;
use tollgate_server::{config::ConfigError, methods, presets, routes, AppState, Config};
use tollgate_service::Service;
use tollgate_settings::{Settings, SettingsError};
use tollgate_tables::{
    Db, EgressTable, SqliteConsolidatedTable, SqliteConsumerTable, SqliteCustomerTable,
    SqliteEgressTable, SqliteSpaceStatsTable, SqliteStorageProviderTable, TableError,
};

#[derive(Debug, Error)]
enum StartError {
    #[error("loading config: {0}")]
    Settings(#[from] SettingsError),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("parsing private key: {0}")]
    Identity(#[from] IdentityError),
    #[error("parsing DID: {0}")]
    Did(#[from] DidError),
    #[error("opening tables: {0}")]
    Table(#[from] TableError),
    #[error("issuing authority proofs: {0}")]
    Capability(#[from] CapabilityError),
    #[error("listening: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tollgate_logging::try_init(LogLevel::Info);

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tollgate: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartError> {
    let settings: Settings<Config> = Settings::load_or_default("tollgate", None)?;
    let cfg = settings.config;
    cfg.validate()?;

    let mut id = Identity::from_pem(&cfg.private_key)?;
    if let Some(did) = &cfg.did {
        id = id.wrap(did.parse::<Did>()?)?;
    }
    let id = Arc::new(id);

    let resolver = Arc::new(presets::preset_resolver()?);

    // Attestation grants for the trusted authorities; the validation
    // context owns these for the life of the process.
    let mut authority_proofs = Vec::new();
    for authority in cfg.trusted_authority_dids()? {
        authority_proofs.push(Delegation::delegate(
            &id,
            &authority,
            vec![Capability::bare(ATTEST, id.did().clone())],
            vec![],
            None,
        )?);
    }

    let db = Db::open(Path::new(&cfg.database_path))?;
    let egress = Arc::new(SqliteEgressTable::new(
        db.clone(),
        &cfg.egress_table_name,
        &cfg.egress_unprocessed_index_name,
    )?);
    let consolidated = Arc::new(SqliteConsolidatedTable::new(
        db.clone(),
        &cfg.consolidated_table_name,
        &cfg.consolidated_node_stats_index_name,
    )?);
    let space_stats = Arc::new(SqliteSpaceStatsTable::new(
        db.clone(),
        &cfg.space_stats_table_name,
    )?);
    let consumers = Arc::new(SqliteConsumerTable::new(
        db.clone(),
        &cfg.consumer_table_name,
        &cfg.consumer_customer_index_name,
    )?);
    let customers = Arc::new(SqliteCustomerTable::new(db.clone(), &cfg.customer_table_name)?);
    let providers = Arc::new(SqliteStorageProviderTable::new(
        db,
        &cfg.storage_provider_table_name,
    )?);

    let metrics = Arc::new(Metrics::new(&cfg.metrics_environment));
    // Batches left over from a previous run are still pending.
    metrics
        .unprocessed_batches
        .set(egress.count_unprocessed().await?);

    let service = Arc::new(Service::new(
        cfg.metrics_environment.clone(),
        egress.clone(),
        consolidated.clone(),
        providers,
        customers,
        consumers.clone(),
        space_stats.clone(),
        metrics.clone(),
    ));

    let consolidator = Arc::new(Consolidator::new(
        id.clone(),
        egress,
        consolidated,
        space_stats,
        consumers,
        cfg.known_provider_dids()?,
        Duration::from_secs(cfg.consolidation_interval),
        cfg.consolidation_batch_size,
        resolver.clone(),
        authority_proofs,
        metrics.clone(),
    ));

    let mut dispatch = DispatchServer::new(id.clone()).with_resolver(resolver);
    methods::register(&mut dispatch, service, id.clone());

    let state = Arc::new(AppState {
        dispatch: Arc::new(dispatch),
        consolidator: consolidator.clone(),
        metrics,
        metrics_token: cfg.metrics_auth_token.clone(),
        service_did: id.did().to_string(),
        unwrapped_did: id.is_wrapped().then(|| id.key_did().to_string()),
    });
    let app = routes::router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(consolidator.clone().start(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!(port = cfg.port, id = %id.did(), "tollgate listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    consolidator.stop();
    let _ = engine_task.await;

    info!("tollgate shutdown complete");
    Ok(())
}
