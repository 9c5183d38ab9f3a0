use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

const APP_JSON: &str = "app.json";

pub const DEFAULT_API_BASE_URL: &str =
    "https://task-app-service-backend-426afe5-57fc7zcbta-uw.a.run.app/api";
pub const DEFAULT_UNDO_DELAY_MS: u64 = 2_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CREDENTIAL_SERVICE: &str = "taskpad.session";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub undo_delay: Duration,
    pub request_timeout: Duration,
    pub timezone: Tz,
    pub credential_service: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            undo_delay: Duration::from_millis(DEFAULT_UNDO_DELAY_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            timezone: Tz::UTC,
            credential_service: DEFAULT_CREDENTIAL_SERVICE.to_string(),
        }
    }
}

fn default_app_config() -> serde_json::Value {
    serde_json::json!({
        "schema": 1,
        "apiBaseUrl": DEFAULT_API_BASE_URL,
        "undoDelayMs": DEFAULT_UNDO_DELAY_MS,
        "requestTimeoutMs": DEFAULT_REQUEST_TIMEOUT_MS,
        "timezone": "UTC",
        "credentialService": DEFAULT_CREDENTIAL_SERVICE
    })
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&default_app_config())?;
        fs::write(&path, format!("{formatted}\n"))?;
        info!(path = %path.display(), "wrote default client config");
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

/// Reads `app.json` and applies `TASKPAD_*` environment overrides on top.
pub fn load_client_config(config_dir: &Path) -> Result<ClientConfig, InfraError> {
    load_client_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

pub fn load_client_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<ClientConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let app = read_config(&config_dir.join(APP_JSON))?;
    let mut config = ClientConfig::default();

    if let Some(base_url) = optional_lookup_value(&lookup, &["TASKPAD_API_URL"])
        .or_else(|| string_field(&app, "apiBaseUrl"))
    {
        config.api_base_url = base_url;
    }
    if let Some(delay) = millis_setting(&app, &lookup, "undoDelayMs", "TASKPAD_UNDO_DELAY_MS")? {
        config.undo_delay = delay;
    }
    if let Some(timeout) =
        millis_setting(&app, &lookup, "requestTimeoutMs", "TASKPAD_REQUEST_TIMEOUT_MS")?
    {
        if timeout.is_zero() {
            return Err(InfraError::InvalidConfig(
                "requestTimeoutMs must be greater than zero".to_string(),
            ));
        }
        config.request_timeout = timeout;
    }
    if let Some(timezone) = optional_lookup_value(&lookup, &["TASKPAD_TIMEZONE"])
        .or_else(|| string_field(&app, "timezone"))
    {
        config.timezone = timezone
            .parse::<Tz>()
            .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone `{timezone}`: {error}")))?;
    }
    if let Some(service) = string_field(&app, "credentialService") {
        config.credential_service = service;
    }

    validate_api_base_url(&config.api_base_url)?;
    Ok(config)
}

fn validate_api_base_url(base_url: &str) -> Result<(), InfraError> {
    let parsed = Url::parse(base_url)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid apiBaseUrl `{base_url}`: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(InfraError::InvalidConfig(format!(
            "apiBaseUrl must use http or https, got `{}`",
            parsed.scheme()
        )));
    }
    if !base_url.trim_end_matches('/').ends_with("/api") {
        warn!(base_url, "apiBaseUrl does not end with /api; requests may miss the API prefix");
    }
    Ok(())
}

fn string_field(config: &serde_json::Value, field: &str) -> Option<String> {
    config
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn millis_setting<F>(
    config: &serde_json::Value,
    lookup: &F,
    field: &str,
    env_key: &str,
) -> Result<Option<Duration>, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = optional_lookup_value(lookup, &[env_key]) {
        let millis = raw.parse::<u64>().map_err(|error| {
            InfraError::InvalidConfig(format!("{env_key} must be milliseconds: {error}"))
        })?;
        return Ok(Some(Duration::from_millis(millis)));
    }
    match config.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|millis| Some(Duration::from_millis(millis)))
            .ok_or_else(|| {
                InfraError::InvalidConfig(format!("{field} must be a non-negative integer"))
            }),
    }
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}
