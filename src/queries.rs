use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::inference::InferenceClient;
use crate::models::ItineraryItem;

const AIRPORT_ANSWER_MAX_CHARS: usize = 120;
const AIRPORT_ANSWER_TOKENS: u32 = 100;

/// Ordered candidate queries for one item, most specific first. Never empty
/// while the item has a title or a location name.
pub fn build_queries(item: &ItineraryItem, region_hint: &str, airport_name: Option<&str>) -> Vec<String> {
    let title = item.title.trim();
    let location = item.location_name.trim();
    let region = region_hint.trim();
    let mut queries = QueryList::default();

    if let Some(address) = item.address() {
        queries.push(address.to_string());
    }

    if item.is_flight() {
        let code = extract_airport_code(item);
        let code_like = is_code_like(location);

        if let Some(name) = airport_name {
            queries.push(name.trim().to_string());
        }
        let city = airport_name
            .and_then(airport_city)
            .or_else(|| (!location.is_empty() && !code_like).then(|| location.to_string()));
        if let Some(city) = city {
            queries.push(format!("{city} International Airport"));
            queries.push(format!("{city} Airport"));
        }
        let airport_subject = if code_like || location.is_empty() {
            code.clone()
        } else {
            Some(location.to_string())
        };
        if let Some(subject) = airport_subject {
            queries.push(format!("{subject} Airport"));
        }
        queries.push(location.to_string());
    } else if !location.is_empty() && !title.is_empty() {
        if contains_ignore_case(title, location) {
            queries.push(title.to_string());
        } else {
            queries.push(format!("{title}, {location}"));
        }
    }

    if location.is_empty() {
        if !title.is_empty() && !region.is_empty() {
            queries.push(format!("{title}, {region}"));
        }
        queries.push(title.to_string());
    } else {
        // flights already searched their airport forms; the trip region
        // says nothing about where a flight departs or lands
        let region_applies = !item.is_flight()
            && !region.is_empty()
            && !contains_ignore_case(location, region);
        if region_applies {
            queries.push(format!("{location}, {region}"));
        }
        queries.push(location.to_string());
    }

    queries.into_vec()
}

/// Destination IATA code for a flight, always uppercase: the last code in
/// the location, else in the title (`DEN-BIH` → `BIH`). A location made only
/// of codes is read in any case (`den-bih`); elsewhere only uppercase
/// three-letter words count, so `Inn` or `the` never pass for airports.
pub fn extract_airport_code(item: &ItineraryItem) -> Option<String> {
    let location = item.location_name.as_str();
    if is_code_like(location) {
        return tokens(location).last().map(str::to_ascii_uppercase);
    }
    last_code(location).or_else(|| last_code(&item.title))
}

fn last_code(text: &str) -> Option<String> {
    tokens(text).filter(|token| is_iata(token)).last().map(str::to_string)
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
}

fn is_iata(token: &str) -> bool {
    token.len() == 3 && token.chars().all(|c| c.is_ascii_uppercase())
}

/// `"DEN-BIH"`, `"den-bih"`, `"LAX"`: nothing but three-letter codes.
fn is_code_like(location: &str) -> bool {
    let mut seen = false;
    for token in tokens(location) {
        if token.len() != 3 || !token.chars().all(|c| c.is_ascii_alphabetic()) {
            return false;
        }
        seen = true;
    }
    seen
}

/// `"Eastern Sierra Regional Airport, Bishop, California"` → `"Bishop"`.
fn airport_city(name: &str) -> Option<String> {
    name.split(',')
        .nth(1)
        .map(str::trim)
        .filter(|city| !city.is_empty())
        .map(str::to_string)
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Default)]
struct QueryList {
    entries: Vec<String>,
}

impl QueryList {
    fn push(&mut self, query: String) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }
        let duplicate = self
            .entries
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(query));
        if !duplicate {
            self.entries.push(query.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.entries
    }
}

/// Resolves IATA codes to full airport names through the inference
/// capability. Answers are cached per code, including negative ones.
pub struct AirportResolver {
    inference: Arc<dyn InferenceClient>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl AirportResolver {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self {
            inference,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, item: &ItineraryItem, region_hint: &str) -> Option<String> {
        let code = extract_airport_code(item)?;
        let cached = self.cache.lock().get(&code).cloned();
        if let Some(cached) = cached {
            return cached;
        }

        let context = if region_hint.trim().is_empty() {
            format!("Flight: {}", item.title.trim())
        } else {
            format!("Flight: {}, Trip destination: {}", item.title.trim(), region_hint.trim())
        };
        let prompt = airport_prompt(&code, &context);

        let resolved = match self.inference.complete(&prompt, AIRPORT_ANSWER_TOKENS).await {
            Ok(answer) => usable_airport_answer(&answer),
            Err(err) => {
                warn!(?err, code = %code, "airport name resolution failed");
                None
            }
        };
        debug!(code = %code, resolved = ?resolved, "airport code resolved");
        self.cache.lock().insert(code, resolved.clone());
        resolved
    }
}

fn airport_prompt(code: &str, context: &str) -> String {
    format!(
        "What airport has the IATA code \"{code}\"?\n\n\
         IATA codes are official 3-letter airport identifiers assigned by the International Air Transport Association.\n\
         Be precise - many codes are similar but refer to different airports.\n\n\
         Context: This is for a flight with details: {context}\n\n\
         Reply with ONLY the full airport name and location in this format:\n\
         \"Airport Name, City, Country/State\"\n\n\
         Examples:\n\
         - LAX -> \"Los Angeles International Airport, Los Angeles, California\"\n\
         - BIH -> \"Eastern Sierra Regional Airport, Bishop, California\"\n\
         - LHR -> \"Heathrow Airport, London, United Kingdom\"\n\n\
         If \"{code}\" is not a valid IATA airport code, reply with just: NONE"
    )
}

fn usable_airport_answer(answer: &str) -> Option<String> {
    let cleaned = answer
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim();
    if cleaned.is_empty()
        || cleaned.eq_ignore_ascii_case("none")
        || cleaned.chars().count() > AIRPORT_ANSWER_MAX_CHARS
    {
        return None;
    }
    Some(cleaned.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::inference::test_support::ScriptedInference;
    use crate::models::Category;

    fn item(title: &str, category: Category, location: &str) -> ItineraryItem {
        ItineraryItem::new(title, category, location)
    }

    #[test]
    fn address_is_always_first() {
        let mut hotel = item("Grand Hotel", Category::Hotel, "Vienna");
        hotel.address = Some("Kärntner Ring 9, 1010 Wien".into());
        let queries = build_queries(&hotel, "Austria", None);
        assert_eq!(queries[0], "Kärntner Ring 9, 1010 Wien");

        let mut flight = item("Flight UA123", Category::Flight, "DEN-BIH");
        flight.address = Some("Bishop Airport Rd".into());
        assert_eq!(build_queries(&flight, "", None)[0], "Bishop Airport Rd");
    }

    #[test]
    fn combines_title_and_location_for_venues() {
        let hotel = item("Grand Hotel", Category::Hotel, "Vienna");
        assert_eq!(
            build_queries(&hotel, "Austria", None),
            vec!["Grand Hotel, Vienna", "Vienna, Austria", "Vienna"]
        );
    }

    #[test]
    fn skips_redundant_location_when_title_contains_it() {
        let museum = item("Albertina Museum Vienna", Category::Attraction, "vienna");
        let queries = build_queries(&museum, "Austria", None);
        assert_eq!(queries[0], "Albertina Museum Vienna");
        assert!(!queries.iter().any(|q| q == "Albertina Museum Vienna, vienna"));
    }

    #[test]
    fn skips_region_already_in_location() {
        let hotel = item("Hotel Sacher", Category::Hotel, "Vienna, Austria");
        let queries = build_queries(&hotel, "Austria", None);
        assert_eq!(queries, vec!["Hotel Sacher, Vienna, Austria", "Vienna, Austria"]);
    }

    #[test]
    fn falls_back_to_title_with_region_without_location() {
        let dinner = item("Figlmüller", Category::Meal, "");
        assert_eq!(
            build_queries(&dinner, "Vienna, Austria", None),
            vec!["Figlmüller, Vienna, Austria", "Figlmüller"]
        );
        assert!(build_queries(&item("", Category::Other, ""), "Austria", None).is_empty());
    }

    #[test]
    fn flight_airport_forms_precede_raw_location() {
        let flight = item("Flight UA123", Category::Flight, "DEN-BIH");
        let resolved = build_queries(
            &flight,
            "Austria",
            Some("Eastern Sierra Regional Airport, Bishop, California"),
        );
        assert_eq!(
            resolved,
            vec![
                "Eastern Sierra Regional Airport, Bishop, California",
                "Bishop International Airport",
                "Bishop Airport",
                "BIH Airport",
                "DEN-BIH",
            ]
        );

        let named = item("Flight OS88", Category::Flight, "Vienna");
        let queries = build_queries(&named, "", None);
        let raw = queries.iter().position(|q| q == "Vienna").unwrap();
        let international = queries
            .iter()
            .position(|q| q == "Vienna International Airport")
            .unwrap();
        let plain = queries.iter().position(|q| q == "Vienna Airport").unwrap();
        assert!(international < raw && plain < raw);
    }

    #[test]
    fn named_flight_location_skips_trip_region() {
        let flight = item("Flight OS88", Category::Flight, "Vienna");
        assert_eq!(
            build_queries(&flight, "Austria", None),
            vec!["Vienna International Airport", "Vienna Airport", "Vienna"]
        );
    }

    #[test]
    fn lowercase_route_is_read_as_codes() {
        let flight = item("Flight UA123", Category::Flight, "den-bih");
        assert_eq!(extract_airport_code(&flight).as_deref(), Some("BIH"));
        assert_eq!(build_queries(&flight, "Austria", None), vec!["BIH Airport", "den-bih"]);

        let hotel_flight = item("Flight to the Inn", Category::Flight, "Denver");
        assert!(extract_airport_code(&hotel_flight).is_none());
    }

    #[test]
    fn unresolved_flight_uses_destination_code() {
        let flight = item("Flight UA123", Category::Flight, "DEN-BIH");
        assert_eq!(build_queries(&flight, "Austria", None), vec!["BIH Airport", "DEN-BIH"]);
    }

    #[test]
    fn extracts_destination_codes() {
        assert_eq!(
            extract_airport_code(&item("UA 123 SFO → JFK", Category::Flight, "")).as_deref(),
            Some("JFK")
        );
        assert_eq!(
            extract_airport_code(&item("Flight", Category::Flight, "DEN-BIH")).as_deref(),
            Some("BIH")
        );
        assert!(extract_airport_code(&item("Flight UA123", Category::Flight, "Denver")).is_none());
    }

    #[tokio::test]
    async fn resolver_caches_answers_and_rejects_none() {
        let inference = Arc::new(ScriptedInference::new(vec![
            Ok("\"Eastern Sierra Regional Airport, Bishop, California\"".into()),
            Ok("NONE".into()),
        ]));
        let resolver = AirportResolver::new(inference.clone());
        let flight = item("Flight UA123", Category::Flight, "DEN-BIH");

        let first = resolver.resolve(&flight, "Mammoth, California").await;
        let second = resolver.resolve(&flight, "Mammoth, California").await;
        assert_eq!(first.as_deref(), Some("Eastern Sierra Regional Airport, Bishop, California"));
        assert_eq!(first, second);
        assert_eq!(inference.prompts().len(), 1);
        assert!(inference.prompts()[0].contains("\"BIH\""));

        let unknown = item("Flight", Category::Flight, "XQZ");
        assert!(resolver.resolve(&unknown, "").await.is_none());
    }

    #[tokio::test]
    async fn resolver_tolerates_inference_errors() {
        let inference = Arc::new(ScriptedInference::new(vec![Err(AppError::Inference(
            "down".into(),
        ))]));
        let resolver = AirportResolver::new(inference);
        let flight = item("Flight UA123", Category::Flight, "DEN-BIH");
        assert!(resolver.resolve(&flight, "").await.is_none());
    }
}
