use serde::Serialize;
use tracing::{info, warn};

use crate::db::TripStore;
use crate::errors::AppResult;
use crate::models::MapStatus;
use crate::payload::parse_itinerary_str;
use crate::worker::JobQueue;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<String>,
    pub unreadable: Vec<String>,
}

/// Resubmits every trip the store still reports as `pending` or
/// `processing`. Safe to run on every start: finished trips are never
/// selected and an interrupted job starts over under a new sequence.
pub fn recover_pending_jobs(store: &dyn TripStore, queue: &JobQueue) -> AppResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for trip in store.trips_needing_geocoding()? {
        match parse_itinerary_str(&trip.itinerary_data) {
            Ok(itinerary) => {
                queue.submit(store, &trip.link, itinerary)?;
                report.requeued.push(trip.link);
            }
            Err(err) => {
                warn!(trip = %trip.link, ?err, "stored itinerary could not be read; marking trip failed");
                let message = format!("stored itinerary could not be read: {err}");
                store.set_job_status(&trip.link, MapStatus::Error, Some(&message))?;
                report.unreadable.push(trip.link);
            }
        }
    }

    info!(
        target: "recovery",
        requeued = report.requeued.len(),
        unreadable = report.unreadable.len(),
        "recovery scan complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::SqliteTripStore;

    #[tokio::test]
    async fn requeues_interrupted_trips_in_any_stored_shape() {
        let store = SqliteTripStore::in_memory().unwrap();
        store
            .save_trip(
                "flat",
                "Flat",
                &json!({"title": "Flat", "items": [{"title": "Opera", "category": "attraction", "location_name": "Vienna"}]}),
            )
            .unwrap();
        store
            .save_trip(
                "grouped",
                "Grouped",
                &json!({"title": "Grouped", "days": [{"date": "2024-05-01", "items": [{"title": "Grand Hotel", "category": "hotel", "location": "Vienna"}]}]}),
            )
            .unwrap();
        store.set_job_status("grouped", MapStatus::Processing, None).unwrap();
        store.save_trip("done", "Done", &json!({"title": "Done", "items": []})).unwrap();
        store.set_job_status("done", MapStatus::Ready, None).unwrap();

        let (queue, mut receiver) = JobQueue::channel();
        let report = recover_pending_jobs(&store, &queue).unwrap();

        let mut requeued = report.requeued.clone();
        requeued.sort();
        assert_eq!(requeued, vec!["flat", "grouped"]);
        assert_eq!(queue.depth(), 2);
        assert_eq!(
            store.job_status("grouped").unwrap().unwrap().status,
            MapStatus::Pending
        );

        let mut titles = Vec::new();
        for _ in 0..2 {
            let job = receiver.recv().await.unwrap();
            titles.push(job.itinerary.items[0].title.clone());
        }
        titles.sort();
        assert_eq!(titles, vec!["Grand Hotel", "Opera"]);
    }

    #[test]
    fn unreadable_snapshot_marks_trip_failed() {
        let store = SqliteTripStore::in_memory().unwrap();
        store.save_trip("broken", "Broken", &json!([1, 2, 3])).unwrap();

        let (queue, _receiver) = JobQueue::channel();
        let report = recover_pending_jobs(&store, &queue).unwrap();

        assert_eq!(report.unreadable, vec!["broken"]);
        assert_eq!(queue.depth(), 0);
        let state = store.job_status("broken").unwrap().unwrap();
        assert_eq!(state.status, MapStatus::Error);
        assert!(state.error.unwrap().contains("could not be read"));

        // a second scan no longer selects it
        let again = recover_pending_jobs(&store, &queue).unwrap();
        assert!(again.unreadable.is_empty());
    }
}
