use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Flight,
    Hotel,
    Meal,
    Activity,
    Attraction,
    Transport,
    #[default]
    #[serde(other)]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Flight => "flight",
            Category::Hotel => "hotel",
            Category::Meal => "meal",
            Category::Activity => "activity",
            Category::Attraction => "attraction",
            Category::Transport => "transport",
            Category::Other => "other",
        }
    }

    /// Lenient parse used at the payload boundary; parsers emit location
    /// types (`restaurant`, `airport`) as often as categories.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "flight" | "airport" => Category::Flight,
            "hotel" | "lodging" | "accommodation" => Category::Hotel,
            "meal" | "restaurant" | "dining" => Category::Meal,
            "activity" | "tour" => Category::Activity,
            "attraction" | "sight" | "sightseeing" => Category::Attraction,
            "transport" | "train" | "train_station" | "car" | "transfer" => Category::Transport,
            _ => Category::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItineraryItem {
    pub title: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub day_number: Option<u32>,
    #[serde(default)]
    pub confirmation_number: Option<String>,
    #[serde(default)]
    pub is_home_location: bool,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl ItineraryItem {
    pub fn new(title: impl Into<String>, category: Category, location_name: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            category,
            location_name: location_name.into(),
            ..Self::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    pub fn position(&self) -> Option<LatLng> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        }
    }

    pub fn set_position(&mut self, position: LatLng) {
        self.latitude = Some(position.lat);
        self.longitude = Some(position.lng);
    }

    pub fn clear_position(&mut self) {
        self.latitude = None;
        self.longitude = None;
    }

    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn is_flight(&self) -> bool {
        self.category == Category::Flight
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub title: String,
    #[serde(default)]
    pub items: Vec<ItineraryItem>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub travelers: Vec<String>,
}

impl Itinerary {
    pub fn duration_days(&self) -> Option<i64> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some((end - start).num_days() + 1),
            _ => None,
        }
    }

    pub fn reset_positions(&mut self) {
        for item in &mut self.items {
            item.clear_position();
        }
    }
}

/// One geocoding run for one trip. `seq` is assigned on submit; it keys
/// per-job caches and is stored on the trip so only the newest job may
/// finish it.
#[derive(Debug, Clone)]
pub struct GeocodeJob {
    pub seq: u64,
    pub trip_link: String,
    pub itinerary: Itinerary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub position: LatLng,
    pub title: String,
    pub label: String,
    pub category: Category,
    pub color: String,
    pub icon: String,
    #[serde(rename = "infoHTML")]
    pub info_html: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    pub center: LatLng,
    pub zoom: u8,
    pub markers: Vec<Marker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl MapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MapStatus::Pending => "pending",
            MapStatus::Processing => "processing",
            MapStatus::Ready => "ready",
            MapStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(MapStatus::Pending),
            "processing" => Ok(MapStatus::Processing),
            "ready" => Ok(MapStatus::Ready),
            "error" => Ok(MapStatus::Error),
            _ => Err(AppError::Config(format!("invalid map status: {value}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MapStatus::Ready | MapStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub link: String,
    pub status: MapStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub queue_depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_requires_both_coordinates() {
        let mut item = ItineraryItem::new("Grand Hotel", Category::Hotel, "Vienna");
        assert!(!item.is_resolved());
        item.latitude = Some(48.2);
        assert!(!item.is_resolved());
        item.set_position(LatLng::new(48.2, 16.37));
        assert!(item.is_resolved());
        item.clear_position();
        assert!(item.position().is_none());
    }

    #[test]
    fn parses_categories_leniently() {
        assert_eq!(Category::parse("Restaurant"), Category::Meal);
        assert_eq!(Category::parse("airport"), Category::Flight);
        assert_eq!(Category::parse("spa"), Category::Other);
        let parsed: Category = serde_json::from_str("\"cruise\"").unwrap();
        assert_eq!(parsed, Category::Other);
    }

    #[test]
    fn serializes_status_report_for_polling() {
        let report = JobStatusReport {
            link: "vienna.html".into(),
            status: MapStatus::Processing,
            error: None,
            queue_depth: 2,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["queueDepth"], 2);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn computes_duration_inclusive() {
        let itinerary = Itinerary {
            title: "Vienna".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 5, 4),
            ..Itinerary::default()
        };
        assert_eq!(itinerary.duration_days(), Some(4));
    }
}
