use std::fmt::Write as _;

use crate::models::{Category, Itinerary, ItineraryItem, LatLng, MapData, Marker};
use crate::region::{is_origin_flight, OriginPolicy};

pub const EMPTY_MAP_MESSAGE: &str = "No locations could be geocoded";
const EMPTY_MAP_ZOOM: u8 = 2;

/// Span thresholds in degrees, checked in order; anything tighter is zoom 12.
const ZOOM_STEPS: &[(f64, u8)] = &[
    (10.0, 5),
    (5.0, 6),
    (2.0, 7),
    (1.0, 8),
    (0.5, 9),
    (0.1, 10),
];
const CLOSE_ZOOM: u8 = 12;

#[derive(Debug, Clone, Default)]
pub struct MapDataBuilder {
    policy: OriginPolicy,
}

impl MapDataBuilder {
    pub fn new(policy: OriginPolicy) -> Self {
        Self { policy }
    }

    /// Pure function of its inputs: the same itinerary always yields the same
    /// center, zoom and marker order.
    pub fn build(&self, itinerary: &Itinerary, destination_hint: &str) -> MapData {
        let placed: Vec<(&ItineraryItem, LatLng)> = itinerary
            .items
            .iter()
            .filter(|item| !item.is_home_location)
            .filter(|item| !is_origin_flight(item, destination_hint, &self.policy))
            .filter_map(|item| item.position().map(|position| (item, position)))
            .collect();

        if placed.is_empty() {
            return MapData {
                center: LatLng::new(0.0, 0.0),
                zoom: EMPTY_MAP_ZOOM,
                markers: Vec::new(),
                error: Some(EMPTY_MAP_MESSAGE.to_string()),
            };
        }

        let positions: Vec<LatLng> = placed.iter().map(|(_, position)| *position).collect();
        let markers = placed
            .iter()
            .enumerate()
            .map(|(idx, (item, position))| marker(idx + 1, item, *position))
            .collect();

        MapData {
            center: centroid(&positions),
            zoom: zoom_for_span(span(&positions)),
            markers,
            error: None,
        }
    }
}

fn centroid(points: &[LatLng]) -> LatLng {
    let count = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / count;
    let lng = points.iter().map(|p| p.lng).sum::<f64>() / count;
    LatLng::new(lat, lng)
}

fn span(points: &[LatLng]) -> f64 {
    let (mut min_lat, mut max_lat) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_lng, mut max_lng) = (f64::INFINITY, f64::NEG_INFINITY);
    for point in points {
        min_lat = min_lat.min(point.lat);
        max_lat = max_lat.max(point.lat);
        min_lng = min_lng.min(point.lng);
        max_lng = max_lng.max(point.lng);
    }
    (max_lat - min_lat).max(max_lng - min_lng)
}

pub fn zoom_for_span(span: f64) -> u8 {
    ZOOM_STEPS
        .iter()
        .find(|(threshold, _)| span > *threshold)
        .map(|(_, zoom)| *zoom)
        .unwrap_or(CLOSE_ZOOM)
}

fn marker(number: usize, item: &ItineraryItem, position: LatLng) -> Marker {
    Marker {
        position,
        title: item.title.clone(),
        label: format!("{number}. {}", item.title),
        category: item.category,
        color: marker_color(item.category).to_string(),
        icon: marker_icon(item.category).to_string(),
        info_html: info_html(number, item),
    }
}

pub fn marker_color(category: Category) -> &'static str {
    match category {
        Category::Hotel => "blue",
        Category::Meal => "orange",
        Category::Attraction | Category::Activity => "green",
        Category::Flight => "red",
        Category::Transport => "gray",
        Category::Other => "lightblue",
    }
}

pub fn marker_icon(category: Category) -> &'static str {
    match category {
        Category::Hotel => "bed",
        Category::Meal => "utensils",
        Category::Attraction => "camera",
        Category::Activity => "star",
        Category::Flight => "plane",
        Category::Transport => "car",
        Category::Other => "map-marker",
    }
}

fn info_html(number: usize, item: &ItineraryItem) -> String {
    let mut html = format!("<h4>{number}. {}</h4>", escape(&item.title));
    if !item.location_name.trim().is_empty() {
        let _ = write!(html, "<p><strong>{}</strong></p>", escape(&item.location_name));
    }
    if let Some(date) = item.date {
        let _ = write!(html, "<p><em>{}</em></p>", date.format("%B %d, %Y"));
    }
    if let Some(start) = item.start_time {
        let mut range = start.format("%I:%M %p").to_string();
        if let Some(end) = item.end_time {
            let _ = write!(range, " - {}", end.format("%I:%M %p"));
        }
        let _ = write!(html, "<p>Time: {range}</p>");
    }
    if let Some(description) = item.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = write!(html, "<p>{}</p>", escape(description));
    }
    if let Some(confirmation) = item
        .confirmation_number
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    {
        let _ = write!(html, "<p><small>Conf: {}</small></p>", escape(confirmation));
    }
    if let Some(address) = item.address() {
        let _ = write!(html, "<p><small>{}</small></p>", escape(address));
    }
    html
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
