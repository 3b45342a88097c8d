use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::inference::InferenceClient;
use crate::models::{Itinerary, ItineraryItem};

const CONTEXT_ITEM_LIMIT: usize = 15;
const HINT_ANSWER_TOKENS: u32 = 50;
const HINT_MAX_CHARS: usize = 80;
const DESTINATION_TOKEN_MIN_LEN: usize = 3;

/// Infers a trip's primary destination once per job. Hints are keyed by the
/// job sequence number and dropped with [`RegionHintResolver::release`].
pub struct RegionHintResolver {
    inference: Arc<dyn InferenceClient>,
    cache: Mutex<HashMap<u64, String>>,
}

impl RegionHintResolver {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            inference,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Never fails; an empty string means no usable hint.
    pub async fn resolve(&self, seq: u64, itinerary: &Itinerary) -> String {
        let cached = self.cache.lock().get(&seq).cloned();
        if let Some(hint) = cached {
            return hint;
        }

        let hint = match self.ask(&context_prompt(itinerary)).await {
            Some(hint) => hint,
            None if !itinerary.title.trim().is_empty() => {
                debug!(seq, "region hint falling back to title-only prompt");
                self.ask(&title_prompt(&itinerary.title))
                    .await
                    .unwrap_or_default()
            }
            None => String::new(),
        };

        debug!(seq, hint = %hint, "region hint resolved");
        self.cache.lock().insert(seq, hint.clone());
        hint
    }

    pub fn release(&self, seq: u64) {
        self.cache.lock().remove(&seq);
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        match self.inference.complete(prompt, HINT_ANSWER_TOKENS).await {
            Ok(answer) => usable_hint(&answer),
            Err(err) => {
                warn!(?err, "region hint inference failed");
                None
            }
        }
    }
}

fn context_prompt(itinerary: &Itinerary) -> String {
    let mut context = format!("Trip: {}\n", itinerary.title.trim());
    for item in itinerary
        .items
        .iter()
        .filter(|item| !item.is_flight())
        .take(CONTEXT_ITEM_LIMIT)
    {
        context.push_str("- ");
        context.push_str(item.title.trim());
        if !item.location_name.trim().is_empty() {
            context.push_str(" @ ");
            context.push_str(item.location_name.trim());
        }
        context.push('\n');
    }

    format!(
        "Based on this travel itinerary, what is the primary destination city and country?\n\
         Ignore departure cities and home locations; focus on where the traveler spends their time.\n\n\
         {context}\n\
         Reply with ONLY the destination in the format \"City, Country\" (for example \"Vienna, Austria\")."
    )
}

fn title_prompt(title: &str) -> String {
    format!(
        "A trip is titled \"{}\". What is its primary destination?\n\
         Reply with ONLY \"City, Country\" or just the country if no city is implied.",
        title.trim()
    )
}

fn usable_hint(answer: &str) -> Option<String> {
    let cleaned = answer
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .trim();
    let rejected = cleaned.is_empty()
        || cleaned.chars().count() > HINT_MAX_CHARS
        || ["none", "unknown", "n/a"]
            .iter()
            .any(|word| cleaned.eq_ignore_ascii_case(word));
    (!rejected).then(|| cleaned.to_string())
}

/// Known home identifiers. IATA codes match whole tokens, city names match as
/// case-insensitive substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    airports: Vec<String>,
    cities: Vec<String>,
}

impl OriginPolicy {
    pub fn new(airports: Vec<String>, cities: Vec<String>) -> Self {
        Self {
            airports: airports
                .into_iter()
                .map(|code| code.trim().to_ascii_uppercase())
                .filter(|code| !code.is_empty())
                .collect(),
            cities: cities
                .into_iter()
                .map(|city| city.trim().to_lowercase())
                .filter(|city| !city.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.airports.is_empty() && self.cities.is_empty()
    }

    fn matches(&self, item: &ItineraryItem) -> bool {
        let haystack = item_text(item);
        let lowered = haystack.to_lowercase();
        let airport_hit = haystack
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| self.airports.iter().any(|code| code == token));
        airport_hit || self.cities.iter().any(|city| lowered.contains(city.as_str()))
    }
}

/// True for flights that represent leaving home: either they match the origin
/// policy, or a destination is known and the flight mentions none of it.
pub fn is_origin_flight(item: &ItineraryItem, destination: &str, policy: &OriginPolicy) -> bool {
    if !item.is_flight() {
        return false;
    }
    if policy.matches(item) {
        return true;
    }

    let tokens = destination_tokens(destination);
    if tokens.is_empty() {
        return false;
    }
    let text = item_text(item).to_lowercase();
    !tokens.iter().any(|token| text.contains(token.as_str()))
}

fn destination_tokens(destination: &str) -> Vec<String> {
    destination
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= DESTINATION_TOKEN_MIN_LEN)
        .map(str::to_lowercase)
        .collect()
}

fn item_text(item: &ItineraryItem) -> String {
    [
        item.location_name.as_str(),
        item.title.as_str(),
        item.address.as_deref().unwrap_or_default(),
    ]
    .join(" ")
}
