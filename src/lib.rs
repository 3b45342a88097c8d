pub mod config;
pub mod db;
pub mod errors;
pub mod geocode;
pub mod geocoder;
pub mod inference;
pub mod map_data;
pub mod models;
pub mod payload;
pub mod queries;
pub mod recovery;
pub mod region;
pub mod routes;
pub mod telemetry;
pub mod worker;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{SqliteTripStore, TripStore};
use crate::errors::AppResult;
use crate::geocode::{GeocodeClient, GeocodeProvider, NominatimProvider, RateLimiter};
use crate::inference::InferenceClient;
use crate::map_data::MapDataBuilder;
use crate::queries::AirportResolver;
use crate::recovery::{recover_pending_jobs, RecoveryReport};
use crate::region::RegionHintResolver;
use crate::telemetry::JobJournal;
use crate::worker::{GeocodeWorker, JobQueue, WorkerSettings};

pub use crate::errors::AppError;
pub use crate::models::{Itinerary, ItineraryItem, MapData, MapStatus};
pub use crate::routes::build_router;

/// Shared by every HTTP handler. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TripStore>,
    pub queue: JobQueue,
    pub journal: JobJournal,
    pub config: Arc<AppConfig>,
}

/// External collaborators the service is assembled from.
pub struct Components {
    pub store: Arc<dyn TripStore>,
    pub provider: Arc<dyn GeocodeProvider>,
    pub inference: Arc<dyn InferenceClient>,
}

impl Components {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let store = SqliteTripStore::open(&config.data_dir, &config.database_file_name)?;
        Ok(Self {
            store: Arc::new(store),
            provider: Arc::new(NominatimProvider::from_config(config)?),
            inference: inference::from_config(config)?,
        })
    }
}

pub struct Service {
    pub state: AppState,
    pub worker: JoinHandle<()>,
    pub recovery: RecoveryReport,
}

/// Wires the worker, runs the recovery scan and spawns the worker task.
/// Must be called from inside a tokio runtime.
pub fn start(config: AppConfig, components: Components) -> AppResult<Service> {
    let Components {
        store,
        provider,
        inference,
    } = components;

    let journal = JobJournal::new(&config.data_dir, &config)?;
    let limiter = Arc::new(RateLimiter::new(config.min_interval()));
    let client = GeocodeClient::new(provider, limiter.clone(), config.request_timeout())
        .with_country_hint(config.geocoder_country_codes.clone());
    let (queue, receiver) = JobQueue::channel();
    let origin_policy = config.origin_policy();
    info!(
        target: "bootstrap",
        min_interval_ms = limiter.min_interval().as_millis() as u64,
        failure_threshold = config.failure_threshold,
        origin_policy = !origin_policy.is_empty(),
        "geocoding worker configured"
    );

    let worker = GeocodeWorker::new(
        store.clone(),
        client,
        Arc::new(AirportResolver::new(inference.clone())),
        Arc::new(RegionHintResolver::new(inference)),
        MapDataBuilder::new(origin_policy),
        journal.clone(),
        WorkerSettings::from_config(&config),
    );

    let recovery = recover_pending_jobs(store.as_ref(), &queue)?;
    journal.note(
        "recovery_scan",
        "*",
        json!({ "requeued": recovery.requeued, "unreadable": recovery.unreadable }),
    );
    let worker = worker.spawn(receiver);

    Ok(Service {
        state: AppState {
            store,
            queue,
            journal,
            config: Arc::new(config),
        },
        worker,
        recovery,
    })
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,trip_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let bind_addr = config.bind_addr;
    let components = Components::from_config(&config)?;
    let service = start(config, components)?;

    let app = build_router(service.state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(
        target: "bootstrap",
        addr = %bind_addr,
        version = env!("CARGO_PKG_VERSION"),
        requeued = service.recovery.requeued.len(),
        "trip geocoder listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
