use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::geocode::{GeocodeClient, GeocodeHit};
use crate::models::ItineraryItem;
use crate::queries::{build_queries, AirportResolver};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub provider_calls: u32,
    pub memo_hits: u32,
    pub call_errors: u32,
    pub resolved: u32,
    pub unresolved: u32,
}

/// Geocodes the items of one job. Holds the consecutive-failure counter for
/// the circuit breaker and a memo of successful queries; build a fresh one
/// per job.
pub struct ItemGeocoder {
    client: GeocodeClient,
    airports: Arc<AirportResolver>,
    memo: HashMap<String, GeocodeHit>,
    consecutive_failures: u32,
    threshold: u32,
    stats: GeocodeStats,
}

impl ItemGeocoder {
    pub fn new(client: GeocodeClient, airports: Arc<AirportResolver>, threshold: u32) -> Self {
        Self {
            client,
            airports,
            memo: HashMap::new(),
            consecutive_failures: 0,
            threshold: threshold.max(1),
            stats: GeocodeStats::default(),
        }
    }

    /// Tries each fallback query in order and stops at the first hit. Returns
    /// whether the item ended up resolved.
    pub async fn geocode(&mut self, item: &mut ItineraryItem, region_hint: &str) -> bool {
        let airport = if item.is_flight() {
            self.airports.resolve(item, region_hint).await
        } else {
            None
        };
        let queries = build_queries(item, region_hint, airport.as_deref());

        for query in &queries {
            let key = query.to_lowercase();
            if let Some(hit) = self.memo.get(&key).cloned() {
                self.stats.memo_hits += 1;
                debug!(query = %query, "reusing resolved point");
                self.accept(item, &hit);
                return true;
            }

            self.stats.provider_calls += 1;
            match self.client.lookup(query, None).await {
                Ok(Some(hit)) => {
                    debug!(title = %item.title, query = %query, "item geocoded");
                    self.accept(item, &hit);
                    self.memo.insert(key, hit);
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    self.stats.call_errors += 1;
                    warn!(%err, query = %query, "geocoding call failed");
                }
            }
        }

        self.consecutive_failures += 1;
        self.stats.unresolved += 1;
        debug!(
            title = %item.title,
            attempts = queries.len(),
            consecutive = self.consecutive_failures,
            "item left unresolved"
        );
        false
    }

    pub fn should_abort(&self) -> bool {
        self.consecutive_failures >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stats(&self) -> &GeocodeStats {
        &self.stats
    }

    fn accept(&mut self, item: &mut ItineraryItem, hit: &GeocodeHit) {
        item.set_position(hit.position);
        if item.address().is_none() && !hit.address.trim().is_empty() {
            item.address = Some(hit.address.clone());
        }
        self.consecutive_failures = 0;
        self.stats.resolved += 1;
    }
}
