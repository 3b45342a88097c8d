use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::LatLng;

/// Result classes that describe a named place rather than a street match.
const PREFERRED_CLASSES: &[&str] = &["place", "tourism", "building", "amenity", "aeroway"];
const MAX_CANDIDATES: u8 = 5;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("geocoding request timed out")]
    Timeout,
    #[error("geocoding service error: {0}")]
    Service(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub position: LatLng,
    pub class: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub position: LatLng,
    pub address: String,
    pub class: String,
}

impl From<Candidate> for GeocodeHit {
    fn from(value: Candidate) -> Self {
        Self {
            position: value.position,
            address: value.display_name,
            class: value.class,
        }
    }
}

/// One outbound lookup against a geocoding provider. Implementations return
/// every ranked candidate; selection happens in [`GeocodeClient`].
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        country_hint: Option<&str>,
    ) -> Result<Vec<Candidate>, LookupError>;
}

/// Minimum-interval throttle shared by every caller holding the same `Arc`.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Clone)]
pub struct GeocodeClient {
    provider: Arc<dyn GeocodeProvider>,
    limiter: Arc<RateLimiter>,
    request_timeout: Duration,
    country_hint: Option<String>,
}

impl GeocodeClient {
    pub fn new(
        provider: Arc<dyn GeocodeProvider>,
        limiter: Arc<RateLimiter>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiter,
            request_timeout,
            country_hint: None,
        }
    }

    pub fn with_country_hint(mut self, country_hint: Option<String>) -> Self {
        self.country_hint = country_hint;
        self
    }

    /// `Ok(None)` means the provider answered with zero candidates. A
    /// `country_hint` overrides the configured country codes for this call.
    pub async fn lookup(
        &self,
        query: &str,
        country_hint: Option<&str>,
    ) -> Result<Option<GeocodeHit>, LookupError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }

        self.limiter.wait().await;
        let country_hint = country_hint
            .filter(|codes| !codes.trim().is_empty())
            .or(self.country_hint.as_deref());
        trace!(query, ?country_hint, "issuing geocoding request");
        let candidates = match timeout(
            self.request_timeout,
            self.provider.search(query, country_hint),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(LookupError::Timeout),
        };

        let picked = pick_candidate(candidates);
        if picked.is_none() {
            debug!(query, "geocoding returned no candidates");
        }
        Ok(picked.map(GeocodeHit::from))
    }
}

/// Prefers named places over generic road/address matches, otherwise keeps
/// the provider's ranking.
pub fn pick_candidate(candidates: Vec<Candidate>) -> Option<Candidate> {
    let preferred = candidates.iter().position(|candidate| {
        PREFERRED_CLASSES
            .iter()
            .any(|class| candidate.class.eq_ignore_ascii_case(class))
    });
    let index = preferred.unwrap_or(0);
    candidates.into_iter().nth(index)
}

pub struct NominatimProvider {
    http: Client,
    search_url: Url,
}

impl NominatimProvider {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::new(
            &config.geocoder_base_url,
            &config.geocoder_user_agent,
            config.request_timeout(),
        )
    }

    pub fn new(base_url: &str, user_agent: &str, request_timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()?;
        let base = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| AppError::Config(format!("invalid geocoder url {base_url}: {err}")))?;
        let search_url = base
            .join(&format!("{}/search", base.path().trim_end_matches('/')))
            .map_err(|err| AppError::Config(format!("invalid geocoder url {base_url}: {err}")))?;
        Ok(Self { http, search_url })
    }
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default, alias = "class")]
    category: String,
    #[serde(default)]
    display_name: String,
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    async fn search(
        &self,
        query: &str,
        country_hint: Option<&str>,
    ) -> Result<Vec<Candidate>, LookupError> {
        let limit = MAX_CANDIDATES.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("q", query),
            ("format", "jsonv2"),
            ("limit", limit.as_str()),
            ("accept-language", "en"),
        ];
        if let Some(codes) = country_hint.filter(|codes| !codes.trim().is_empty()) {
            params.push(("countrycodes", codes));
        }

        let response = self
            .http
            .get(self.search_url.clone())
            .query(&params)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Service(format!("provider returned {status}")));
        }

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(classify_transport_error)?;

        Ok(places
            .into_iter()
            .filter_map(|place| {
                let lat = place.lat.parse::<f64>().ok()?;
                let lng = place.lon.parse::<f64>().ok()?;
                Some(Candidate {
                    position: LatLng::new(lat, lng),
                    class: place.category,
                    display_name: place.display_name,
                })
            })
            .collect())
    }
}

fn classify_transport_error(err: reqwest::Error) -> LookupError {
    if err.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Service(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Scripted provider: answers by exact query, records every call.
    #[derive(Default)]
    pub struct ScriptedProvider {
        answers: Mutex<HashMap<String, Result<Vec<Candidate>, LookupError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn answer(&self, query: &str, lat: f64, lng: f64) {
            self.answers.lock().insert(
                query.to_string(),
                Ok(vec![Candidate {
                    position: LatLng::new(lat, lng),
                    class: "place".into(),
                    display_name: format!("{query} (resolved)"),
                }]),
            );
        }

        pub fn fail(&self, query: &str, err: LookupError) {
            self.answers.lock().insert(query.to_string(), Err(err));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        async fn search(
            &self,
            query: &str,
            _country_hint: Option<&str>,
        ) -> Result<Vec<Candidate>, LookupError> {
            self.calls.lock().push(query.to_string());
            self.answers
                .lock()
                .get(query)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    pub fn client_for(provider: Arc<ScriptedProvider>, min_interval: Duration) -> GeocodeClient {
        GeocodeClient::new(
            provider,
            Arc::new(RateLimiter::new(min_interval)),
            Duration::from_secs(5),
        )
    }
}
