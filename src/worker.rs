use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::db::TripStore;
use crate::errors::AppResult;
use crate::geocode::GeocodeClient;
use crate::geocoder::{GeocodeStats, ItemGeocoder};
use crate::map_data::MapDataBuilder;
use crate::models::{GeocodeJob, Itinerary, MapStatus};
use crate::queries::AirportResolver;
use crate::region::RegionHintResolver;
use crate::telemetry::JobJournal;

/// Producer side of the FIFO job queue. Cheap to clone; submitting never
/// waits on the worker.
#[derive(Clone)]
pub struct JobQueue {
    sender: UnboundedSender<GeocodeJob>,
    depth: Arc<AtomicUsize>,
    next_seq: Arc<AtomicU64>,
    submit_lock: Arc<Mutex<()>>,
}

/// Consumer side, owned by the single worker.
pub struct JobReceiver {
    receiver: UnboundedReceiver<GeocodeJob>,
    depth: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn channel() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                depth: depth.clone(),
                next_seq: Arc::new(AtomicU64::new(1)),
                submit_lock: Arc::new(Mutex::new(())),
            },
            JobReceiver { receiver, depth },
        )
    }

    /// Marks the trip `pending` under a fresh job sequence and queues the
    /// job. Any job already queued or running for the same trip is
    /// superseded and drops its result. If the worker is gone the trip keeps
    /// its `pending` status and is picked up by recovery on the next start.
    pub fn submit(
        &self,
        store: &dyn TripStore,
        trip_link: &str,
        itinerary: Itinerary,
    ) -> AppResult<u64> {
        let _guard = self.submit_lock.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        store.assign_job(trip_link, seq)?;
        self.push(GeocodeJob {
            seq,
            trip_link: trip_link.to_string(),
            itinerary,
        });
        Ok(seq)
    }

    fn push(&self, job: GeocodeJob) {
        let link = job.trip_link.clone();
        let seq = job.seq;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!(trip = %link, "geocoding worker is not running; job left for recovery");
        } else {
            debug!(trip = %link, seq, "geocoding job queued");
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<GeocodeJob> {
        let job = self.receiver.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub failure_threshold: u32,
    pub max_items: usize,
    pub job_pause: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            max_items: config.max_items_per_job,
            job_pause: config.job_pause(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ready,
    Failed,
    /// The trip was resubmitted while this job ran; nothing was written.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub region_hint: String,
    pub markers: usize,
    pub skipped_items: usize,
    pub breaker_tripped: bool,
    pub stats: GeocodeStats,
}

pub struct GeocodeWorker {
    store: Arc<dyn TripStore>,
    client: GeocodeClient,
    airports: Arc<AirportResolver>,
    regions: Arc<RegionHintResolver>,
    builder: MapDataBuilder,
    journal: JobJournal,
    settings: WorkerSettings,
}

impl GeocodeWorker {
    pub fn new(
        store: Arc<dyn TripStore>,
        client: GeocodeClient,
        airports: Arc<AirportResolver>,
        regions: Arc<RegionHintResolver>,
        builder: MapDataBuilder,
        journal: JobJournal,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            client,
            airports,
            regions,
            builder,
            journal,
            settings,
        }
    }

    pub fn spawn(self, receiver: JobReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    /// Drains the queue one job at a time until every producer is dropped.
    pub async fn run(self, mut receiver: JobReceiver) {
        info!(target: "geocode_worker", "geocoding worker started");
        while let Some(job) = receiver.recv().await {
            self.process(job).await;
        }
        info!(target: "geocode_worker", "geocoding worker stopped");
    }

    /// Runs one job to a terminal status. Failures and panics are recorded on
    /// the trip and never escape.
    pub async fn process(&self, job: GeocodeJob) -> JobOutcome {
        if !self.settings.job_pause.is_zero() {
            tokio::time::sleep(self.settings.job_pause).await;
        }

        let link = job.trip_link.clone();
        let seq = job.seq;
        info!(target: "geocode_worker", trip = %link, seq, items = job.itinerary.items.len(), "job started");
        self.journal.note(
            "job_started",
            &link,
            json!({ "seq": seq, "items": job.itinerary.items.len() }),
        );

        let outcome = AssertUnwindSafe(self.run_job(job)).catch_unwind().await;
        self.regions.release(seq);

        match outcome {
            Ok(Ok(None)) => self.superseded(&link, seq),
            Ok(Ok(Some(summary))) => {
                info!(
                    target: "geocode_worker",
                    trip = %link,
                    markers = summary.markers,
                    resolved = summary.stats.resolved,
                    unresolved = summary.stats.unresolved,
                    breaker_tripped = summary.breaker_tripped,
                    "job finished"
                );
                self.journal.note(
                    "job_finished",
                    &link,
                    json!({
                        "seq": seq,
                        "status": MapStatus::Ready.as_str(),
                        "region_hint": summary.region_hint,
                        "markers": summary.markers,
                        "skipped_items": summary.skipped_items,
                        "breaker_tripped": summary.breaker_tripped,
                        "stats": summary.stats,
                    }),
                );
                JobOutcome::Ready
            }
            Ok(Err(err)) => self.fail(&link, seq, &err.to_string()),
            Err(panic) => self.fail(&link, seq, &panic_message(panic.as_ref())),
        }
    }

    /// `Ok(None)` when a newer job owns the trip by the time this one would
    /// start or finish.
    async fn run_job(&self, job: GeocodeJob) -> AppResult<Option<JobSummary>> {
        let GeocodeJob {
            seq,
            trip_link,
            mut itinerary,
        } = job;
        if !self.store.start_job(&trip_link, seq)? {
            return Ok(None);
        }

        itinerary.reset_positions();
        let region_hint = self.regions.resolve(seq, &itinerary).await;

        let mut geocoder = ItemGeocoder::new(
            self.client.clone(),
            self.airports.clone(),
            self.settings.failure_threshold,
        );
        let limit = self.settings.max_items.min(itinerary.items.len());
        let skipped_items = itinerary.items.len() - limit;
        if skipped_items > 0 {
            info!(trip = %trip_link, limit, skipped_items, "item limit reached; remaining items stay unmapped");
        }

        let mut breaker_tripped = false;
        for item in itinerary.items.iter_mut().take(limit) {
            geocoder.geocode(item, &region_hint).await;
            if geocoder.should_abort() {
                warn!(
                    trip = %trip_link,
                    consecutive = geocoder.consecutive_failures(),
                    "too many consecutive geocoding failures; abandoning remaining items"
                );
                breaker_tripped = true;
                break;
            }
        }

        let map = self.builder.build(&itinerary, &region_hint);
        if !self.store.complete_job(&trip_link, seq, &map)? {
            return Ok(None);
        }

        Ok(Some(JobSummary {
            region_hint,
            markers: map.markers.len(),
            skipped_items,
            breaker_tripped,
            stats: geocoder.stats().clone(),
        }))
    }

    fn fail(&self, link: &str, seq: u64, message: &str) -> JobOutcome {
        match self.store.fail_job(link, seq, message) {
            Ok(false) => return self.superseded(link, seq),
            Ok(true) => {}
            Err(err) => error!(?err, trip = %link, "unable to record job failure"),
        }
        error!(target: "geocode_worker", trip = %link, seq, error = %message, "job failed");
        self.journal.note(
            "job_finished",
            link,
            json!({ "seq": seq, "status": MapStatus::Error.as_str(), "error": message }),
        );
        JobOutcome::Failed
    }

    fn superseded(&self, link: &str, seq: u64) -> JobOutcome {
        info!(target: "geocode_worker", trip = %link, seq, "trip was resubmitted; dropping job result");
        self.journal
            .note("job_superseded", link, json!({ "seq": seq }));
        JobOutcome::Superseded
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("geocoding job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("geocoding job panicked: {message}")
    } else {
        "geocoding job panicked".to_string()
    }
}
