//! Boundary adapters for itinerary payloads.
//!
//! Itineraries reach the worker in three shapes: the flat snapshot written at
//! enqueue time (`location_name`/`location_address` columns), the parser's
//! item dictionaries (nested `location` object) and the day-grouped trip
//! record kept by the store (`days[].items[]`). Each has one adapter here and
//! everything past this module sees only [`Itinerary`].

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{AppError, AppResult};
use crate::models::{Category, Itinerary, ItineraryItem};

const UNTITLED_TRIP: &str = "Untitled Trip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    FlatSnapshot,
    NestedLocation,
    DayGrouped,
}

pub fn detect_shape(value: &Value) -> AppResult<PayloadShape> {
    let object = value
        .as_object()
        .ok_or_else(|| AppError::Payload("expected a JSON object".into()))?;

    if object.get("days").map(Value::is_array).unwrap_or(false) {
        return Ok(PayloadShape::DayGrouped);
    }

    let items = object
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::Payload("missing `items` or `days` array".into()))?;

    let nested = items
        .iter()
        .any(|item| item.get("location").map(|loc| !loc.is_null()).unwrap_or(false));
    if nested {
        Ok(PayloadShape::NestedLocation)
    } else {
        Ok(PayloadShape::FlatSnapshot)
    }
}

pub fn parse_itinerary(value: &Value) -> AppResult<Itinerary> {
    match detect_shape(value)? {
        PayloadShape::FlatSnapshot => {
            let snapshot: FlatSnapshot = serde_json::from_value(value.clone())?;
            Ok(snapshot.into_itinerary())
        }
        PayloadShape::NestedLocation => {
            let record: NestedRecord = serde_json::from_value(value.clone())?;
            Ok(record.into_itinerary())
        }
        PayloadShape::DayGrouped => {
            let record: DayGroupedRecord = serde_json::from_value(value.clone())?;
            Ok(record.into_itinerary())
        }
    }
}

pub fn parse_itinerary_str(raw: &str) -> AppResult<Itinerary> {
    let value: Value = serde_json::from_str(raw)?;
    parse_itinerary(&value)
}

/// Serialises an itinerary into the flat snapshot shape stored with a trip.
pub fn to_snapshot(itinerary: &Itinerary) -> AppResult<Value> {
    Ok(serde_json::to_value(FlatSnapshot::from_itinerary(itinerary))?)
}

#[derive(Debug, Serialize, Deserialize)]
struct FlatSnapshot {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    duration_days: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    travelers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    items: Vec<FlatItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlatItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    day_number: Option<u32>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    location_name: Option<String>,
    #[serde(default)]
    location_address: Option<String>,
    #[serde(default)]
    location_lat: Option<f64>,
    #[serde(default)]
    location_lon: Option<f64>,
    #[serde(default)]
    confirmation_number: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_home_location: bool,
}

impl FlatSnapshot {
    fn from_itinerary(itinerary: &Itinerary) -> Self {
        Self {
            title: Some(itinerary.title.clone()),
            start_date: itinerary.start_date.map(|d| d.to_string()),
            end_date: itinerary.end_date.map(|d| d.to_string()),
            duration_days: itinerary.duration_days(),
            travelers: itinerary.travelers.clone(),
            items: itinerary
                .items
                .iter()
                .map(|item| FlatItem {
                    title: Some(item.title.clone()),
                    description: item.description.clone(),
                    category: Some(item.category.as_str().to_string()),
                    day_number: item.day_number,
                    date: item.date.map(|d| d.to_string()),
                    start_time: item.start_time.map(|t| t.format("%H:%M:%S").to_string()),
                    end_time: item.end_time.map(|t| t.format("%H:%M:%S").to_string()),
                    location_name: Some(item.location_name.clone()),
                    location_address: item.address.clone(),
                    location_lat: item.latitude,
                    location_lon: item.longitude,
                    confirmation_number: item.confirmation_number.clone(),
                    is_home_location: item.is_home_location,
                })
                .collect(),
        }
    }

    fn into_itinerary(self) -> Itinerary {
        Itinerary {
            title: title_or_default(self.title),
            start_date: self.start_date.as_deref().and_then(parse_date),
            end_date: self.end_date.as_deref().and_then(parse_date),
            travelers: self.travelers,
            items: self
                .items
                .into_iter()
                .map(|item| ItineraryItem {
                    title: item.title.unwrap_or_default(),
                    category: category_of(item.category.as_deref()),
                    location_name: item.location_name.unwrap_or_default(),
                    address: item.location_address,
                    description: item.description,
                    date: item.date.as_deref().and_then(parse_date),
                    start_time: item.start_time.as_deref().and_then(parse_time),
                    end_time: item.end_time.as_deref().and_then(parse_time),
                    day_number: item.day_number,
                    confirmation_number: item.confirmation_number,
                    is_home_location: item.is_home_location,
                    latitude: item.location_lat,
                    longitude: item.location_lon,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NestedRecord {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    travelers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    items: Vec<NestedItem>,
}

#[derive(Debug, Deserialize)]
struct NestedItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    day_number: Option<u32>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    location: Option<NestedLocation>,
    #[serde(default)]
    confirmation_number: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_home_location: bool,
}

/// Trip records store the location either as an object or as bare text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NestedLocation {
    Text(String),
    Detailed {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        latitude: Option<f64>,
        #[serde(default)]
        longitude: Option<f64>,
        #[serde(default)]
        location_type: Option<String>,
    },
}

impl NestedItem {
    fn into_item(self, day_number: Option<u32>, day_date: Option<NaiveDate>) -> ItineraryItem {
        let (location_name, address, latitude, longitude, location_type) = match self.location {
            Some(NestedLocation::Text(name)) => (name, None, None, None, None),
            Some(NestedLocation::Detailed {
                name,
                address,
                latitude,
                longitude,
                location_type,
            }) => (
                name.unwrap_or_default(),
                address,
                latitude,
                longitude,
                location_type,
            ),
            None => (String::new(), None, None, None, None),
        };

        let category = match self.category.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Category::parse(raw),
            _ => category_of(location_type.as_deref()),
        };
        let is_home = self.is_home_location
            || location_type
                .as_deref()
                .map(|kind| kind.eq_ignore_ascii_case("home"))
                .unwrap_or(false);

        ItineraryItem {
            title: self.title.unwrap_or_default(),
            category,
            location_name,
            address,
            description: self.description,
            date: self.date.as_deref().and_then(parse_date).or(day_date),
            start_time: self
                .start_time
                .as_deref()
                .or(self.time.as_deref())
                .and_then(parse_time),
            end_time: self.end_time.as_deref().and_then(parse_time),
            day_number: self.day_number.or(day_number),
            confirmation_number: self.confirmation_number,
            is_home_location: is_home,
            latitude,
            longitude,
        }
    }
}

impl NestedRecord {
    fn into_itinerary(self) -> Itinerary {
        Itinerary {
            title: title_or_default(self.title),
            start_date: self.start_date.as_deref().and_then(parse_date),
            end_date: self.end_date.as_deref().and_then(parse_date),
            travelers: self.travelers,
            items: self
                .items
                .into_iter()
                .map(|item| item.into_item(None, None))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DayGroupedRecord {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    travelers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    days: Vec<DayRecord>,
}

#[derive(Debug, Deserialize)]
struct DayRecord {
    #[serde(default)]
    day_number: Option<u32>,
    #[serde(default)]
    day: Option<u32>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    items: Vec<NestedItem>,
    #[serde(default, deserialize_with = "null_as_default")]
    activities: Vec<NestedItem>,
}

impl DayGroupedRecord {
    fn into_itinerary(self) -> Itinerary {
        let mut items = Vec::new();
        for day in self.days {
            let day_date = day.date.as_deref().and_then(parse_date);
            let day_number = day.day_number.or(day.day);
            for item in day.items.into_iter().chain(day.activities) {
                items.push(item.into_item(day_number, day_date));
            }
        }

        let start_date = self
            .start_date
            .as_deref()
            .and_then(parse_date)
            .or_else(|| items.iter().filter_map(|item| item.date).min());
        let end_date = self
            .end_date
            .as_deref()
            .and_then(parse_date)
            .or_else(|| items.iter().filter_map(|item| item.date).max());

        Itinerary {
            title: title_or_default(self.title),
            start_date,
            end_date,
            travelers: self.travelers,
            items,
        }
    }
}

/// `null` reads the same as a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn title_or_default(title: Option<String>) -> String {
    title
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| UNTITLED_TRIP.to_string())
}

fn category_of(raw: Option<&str>) -> Category {
    raw.map(Category::parse).unwrap_or_default()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| raw.get(..10).and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()))
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .ok()
        .or_else(|| NaiveTime::parse_from_str(raw, "%H:%M").ok())
        .or_else(|| NaiveTime::parse_from_str(raw, "%I:%M %p").ok())
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|dt| dt.time())
        })
}
