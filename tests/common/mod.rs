#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use trip_geocoder::config::AppConfig;
use trip_geocoder::db::{JobState, TripStore};
use trip_geocoder::errors::{AppError, AppResult};
use trip_geocoder::geocode::{Candidate, GeocodeProvider, LookupError};
use trip_geocoder::inference::InferenceClient;
use trip_geocoder::models::LatLng;

/// Answers only the queries it was told about; everything else is a miss.
#[derive(Default)]
pub struct StubProvider {
    places: Mutex<HashMap<String, LatLng>>,
    calls: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn with_places(places: &[(&str, f64, f64)]) -> Arc<Self> {
        let provider = Self::default();
        for (query, lat, lng) in places {
            provider
                .places
                .lock()
                .insert(query.to_string(), LatLng::new(*lat, *lng));
        }
        Arc::new(provider)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl GeocodeProvider for StubProvider {
    async fn search(
        &self,
        query: &str,
        _country_hint: Option<&str>,
    ) -> Result<Vec<Candidate>, LookupError> {
        self.calls.lock().push(query.to_string());
        Ok(self
            .places
            .lock()
            .get(query)
            .map(|position| {
                vec![Candidate {
                    position: *position,
                    class: "place".into(),
                    display_name: query.to_string(),
                }]
            })
            .unwrap_or_default())
    }
}

/// Region prompts get `region`; airport prompts get `NONE`.
pub struct StubInference {
    pub region: Option<String>,
}

#[async_trait]
impl InferenceClient for StubInference {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> AppResult<String> {
        if prompt.contains("IATA") {
            return Ok("NONE".into());
        }
        self.region
            .clone()
            .ok_or_else(|| AppError::Inference("no region scripted".into()))
    }
}

pub fn fast_config(data_dir: &Path) -> AppConfig {
    let mut config = AppConfig::with_defaults(data_dir);
    config.geocoder_min_interval_ms = 50;
    config.job_pause_ms = 0;
    config
}

pub async fn wait_for_terminal(store: &dyn TripStore, link: &str) -> JobState {
    for _ in 0..400 {
        if let Some(state) = store.job_status(link).unwrap() {
            if state.status.is_terminal() {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("trip {link} never reached a terminal status");
}
