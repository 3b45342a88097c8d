use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::region::OriginPolicy;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8088";
const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_INFERENCE_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_INFERENCE_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const MIN_INTERVAL_FLOOR_MS: u64 = 50;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_min_interval_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub geocoder_country_codes: Option<String>,
    pub failure_threshold: u32,
    pub max_items_per_job: usize,
    pub job_pause_ms: u64,
    pub inference_endpoint: String,
    pub inference_api_key: Option<SecretString>,
    pub inference_model: String,
    pub origin_airports: Vec<String>,
    pub origin_cities: Vec<String>,
    pub telemetry_enabled: bool,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub bind_addr: String,
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_min_interval_ms: u64,
    pub geocoder_timeout_secs: u64,
    pub geocoder_country_codes: Option<String>,
    pub failure_threshold: u32,
    pub max_items_per_job: usize,
    pub job_pause_ms: u64,
    pub inference_model: String,
    pub has_inference_key: bool,
    pub origin_airports: Vec<String>,
    pub origin_cities: Vec<String>,
    pub telemetry_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            bind_addr: parse_addr("BIND_ADDR", DEFAULT_BIND_ADDR),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "trips.db".to_string()),
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GEOCODER_BASE_URL.to_string()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| format!("trip-geocoder/{}", env!("CARGO_PKG_VERSION"))),
            geocoder_min_interval_ms: parse_u64("GEOCODER_MIN_INTERVAL_MS", 1_100)
                .max(MIN_INTERVAL_FLOOR_MS),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", 5).clamp(1, 9),
            geocoder_country_codes: non_empty("GEOCODER_COUNTRY_CODES"),
            failure_threshold: parse_u32("GEOCODER_FAILURE_THRESHOLD", 3).max(1),
            max_items_per_job: parse_usize("GEOCODER_MAX_ITEMS", 20).max(1),
            job_pause_ms: parse_u64("WORKER_JOB_PAUSE_MS", 2_000),
            inference_endpoint: env::var("INFERENCE_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_INFERENCE_ENDPOINT.to_string()),
            inference_api_key: non_empty("INFERENCE_API_KEY").map(SecretString::from),
            inference_model: env::var("INFERENCE_MODEL")
                .unwrap_or_else(|_| DEFAULT_INFERENCE_MODEL.to_string()),
            origin_airports: parse_list("ORIGIN_AIRPORTS"),
            origin_cities: parse_list("ORIGIN_CITIES"),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
        }
    }

    /// Built-in defaults without reading the environment.
    pub fn with_defaults(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: parse_addr_value(DEFAULT_BIND_ADDR),
            data_dir: data_dir.into(),
            database_file_name: "trips.db".to_string(),
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocoder_user_agent: format!("trip-geocoder/{}", env!("CARGO_PKG_VERSION")),
            geocoder_min_interval_ms: 1_100,
            geocoder_timeout_secs: 5,
            geocoder_country_codes: None,
            failure_threshold: 3,
            max_items_per_job: 20,
            job_pause_ms: 2_000,
            inference_endpoint: DEFAULT_INFERENCE_ENDPOINT.to_string(),
            inference_api_key: None,
            inference_model: DEFAULT_INFERENCE_MODEL.to_string(),
            origin_airports: Vec::new(),
            origin_cities: Vec::new(),
            telemetry_enabled: true,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            bind_addr: self.bind_addr.to_string(),
            database_file_name: self.database_file_name.clone(),
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_min_interval_ms: self.geocoder_min_interval_ms,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_country_codes: self.geocoder_country_codes.clone(),
            failure_threshold: self.failure_threshold,
            max_items_per_job: self.max_items_per_job,
            job_pause_ms: self.job_pause_ms,
            inference_model: self.inference_model.clone(),
            has_inference_key: self.inference_api_key.is_some(),
            origin_airports: self.origin_airports.clone(),
            origin_cities: self.origin_cities.clone(),
            telemetry_enabled: self.telemetry_enabled,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.geocoder_min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    pub fn job_pause(&self) -> Duration {
        Duration::from_millis(self.job_pause_ms)
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::new(self.origin_airports.clone(), self.origin_cities.clone())
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_list(key: &str) -> Vec<String> {
    non_empty(key)
        .map(|raw| {
            raw.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_addr(key: &str, default: &str) -> SocketAddr {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|err| {
            warn!(?err, value = %raw, "invalid {key}; using default");
            parse_addr_value(default)
        }),
        Err(_) => parse_addr_value(default),
    }
}

fn parse_addr_value(raw: &str) -> SocketAddr {
    raw.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8088)))
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::with_defaults(data_dir);
    config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.database_file_name = "test.db".into();
    config.geocoder_user_agent = "trip-geocoder-tests".into();
    config.job_pause_ms = 0;
    config
}
