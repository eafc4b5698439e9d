//! Application configuration for the news feed pipeline.
//!
//! User config lives at `~/.newsfeed/newsfeed.toml`.
//! CLI flags override config file values, which override defaults.
//! Unknown keys are rejected so typos fail before any stage runs.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{NewsfeedError, Result};
use crate::retry::RetryPolicy;
use crate::types::{Entity, validate_entities};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "newsfeed.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".newsfeed";

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

// ---------------------------------------------------------------------------
// Config structs (matching newsfeed.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Directory holding stage artifacts and `run.json`.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// JSON entity list.
    #[serde(default = "default_entities_path")]
    pub entities_path: String,

    /// libSQL ledger file. Defaults to `<output_dir>/newsfeed.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<String>,

    /// Recency window in months.
    #[serde(default = "default_timeframe_months")]
    pub timeframe_months: u32,

    /// Topics that steer relevance scoring.
    #[serde(default = "default_focus_areas")]
    pub focus_areas: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            entities_path: default_entities_path(),
            ledger_path: None,
            timeframe_months: default_timeframe_months(),
            focus_areas: default_focus_areas(),
        }
    }
}

impl RunConfig {
    pub fn ledger_path(&self) -> PathBuf {
        match &self.ledger_path {
            Some(p) => PathBuf::from(p),
            None => Path::new(&self.output_dir).join("newsfeed.db"),
        }
    }
}

fn default_output_dir() -> String {
    "output".into()
}
fn default_entities_path() -> String {
    "knowledge/entities.json".into()
}
fn default_timeframe_months() -> u32 {
    8
}
fn default_focus_areas() -> String {
    "european politics".into()
}

/// Whether a caller waits for budget or fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    #[default]
    Wait,
    FailFast,
}

/// `[*.rate_limit]` section: a fixed request budget per window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub mode: RateLimitMode,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_window_secs() -> u64 {
    60
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// `{attribute}` placeholders are filled from the entity.
    #[serde(default = "default_query_template")]
    pub query_template: String,

    #[serde(default = "default_results_per_entity")]
    pub results_per_entity: u32,

    /// Maximum simultaneously in-flight entity searches.
    #[serde(default = "default_search_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_search_rate_limit")]
    pub rate_limit: RateLimitConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            endpoint: default_search_endpoint(),
            query_template: default_query_template(),
            results_per_entity: default_results_per_entity(),
            concurrency: default_search_concurrency(),
            rate_limit: default_search_rate_limit(),
        }
    }
}

fn default_search_key_env() -> String {
    "SERPER_API_KEY".into()
}
fn default_search_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_query_template() -> String {
    "\"{name}\" {country} news".into()
}
fn default_results_per_entity() -> u32 {
    10
}
fn default_search_concurrency() -> u32 {
    10
}
fn default_search_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_window: 200,
        window_secs: 60,
        mode: RateLimitMode::Wait,
    }
}

/// `[retry]` section, applied to search, transform, and delivery calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[transform]` section: the LLM backend used by filter, enrich, summarize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    #[serde(default = "default_transform_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_transform_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Items processed simultaneously within one stage.
    #[serde(default = "default_transform_concurrency")]
    pub concurrency: u32,

    /// Fail a stage when more than this share of items is lost.
    /// Unset means per-item losses never fail the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_drop_ratio: Option<f64>,

    #[serde(default = "default_transform_rate_limit")]
    pub rate_limit: RateLimitConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_transform_key_env(),
            endpoint: default_transform_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            concurrency: default_transform_concurrency(),
            max_drop_ratio: None,
            rate_limit: default_transform_rate_limit(),
        }
    }
}

fn default_transform_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_transform_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_transform_concurrency() -> u32 {
    2
}
fn default_transform_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_window: 60,
        window_secs: 60,
        mode: RateLimitMode::Wait,
    }
}

/// `[filter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Items scoring below this are dropped.
    #[serde(default = "default_threshold")]
    pub threshold: u8,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

fn default_threshold() -> u8 {
    6
}

/// `[delivery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_delivery_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_sender_email")]
    pub sender_email: String,

    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_delivery_key_env(),
            endpoint: default_delivery_endpoint(),
            sender_email: default_sender_email(),
            sender_name: default_sender_name(),
            recipients: Vec::new(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_delivery_key_env() -> String {
    "BREVO_API_KEY".into()
}
fn default_delivery_endpoint() -> String {
    "https://api.brevo.com/v3/smtp/email".into()
}
fn default_sender_email() -> String {
    "newsfeed@example.com".into()
}
fn default_sender_name() -> String {
    "News Feed".into()
}
fn default_subject_prefix() -> String {
    "News digest".into()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.filter.threshold > 10 {
            return Err(NewsfeedError::config(format!(
                "filter.threshold {} out of range 0..=10",
                self.filter.threshold
            )));
        }
        if self.run.timeframe_months == 0 {
            return Err(NewsfeedError::config("run.timeframe_months must be >= 1"));
        }
        if self.search.concurrency == 0 {
            return Err(NewsfeedError::config("search.concurrency must be >= 1"));
        }
        if self.transform.concurrency == 0 {
            return Err(NewsfeedError::config("transform.concurrency must be >= 1"));
        }
        if self.search.results_per_entity == 0 {
            return Err(NewsfeedError::config(
                "search.results_per_entity must be >= 1",
            ));
        }
        for (name, limit) in [
            ("search.rate_limit", &self.search.rate_limit),
            ("transform.rate_limit", &self.transform.rate_limit),
        ] {
            if limit.requests_per_window == 0 {
                return Err(NewsfeedError::config(format!(
                    "{name}.requests_per_window must be >= 1"
                )));
            }
            if limit.window_secs == 0 {
                return Err(NewsfeedError::config(format!(
                    "{name}.window_secs must be >= 1"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(NewsfeedError::config("retry.max_attempts must be >= 1"));
        }
        if self.retry.timeout_secs == 0 {
            return Err(NewsfeedError::config("retry.timeout_secs must be >= 1"));
        }
        if let Some(ratio) = self.transform.max_drop_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(NewsfeedError::config(format!(
                    "transform.max_drop_ratio {ratio} out of range 0..=1"
                )));
            }
        }
        if !is_email(&self.delivery.sender_email) {
            return Err(NewsfeedError::config(format!(
                "delivery.sender_email '{}' is not an email address",
                self.delivery.sender_email
            )));
        }
        for r in &self.delivery.recipients {
            if !is_email(r) {
                return Err(NewsfeedError::config(format!(
                    "delivery recipient '{r}' is not an email address"
                )));
            }
        }
        Ok(())
    }
}

/// Loose shape check for an email address.
pub fn is_email(s: &str) -> bool {
    EMAIL_RE.is_match(s)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.newsfeed/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| NewsfeedError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.newsfeed/newsfeed.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        let config = AppConfig::default();
        config.validate()?;
        return Ok(config);
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsfeedError::io(path, e))?;
    parse_config(&content)
        .map_err(|e| NewsfeedError::config(format!("{}: {e}", path.display())))
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig =
        toml::from_str(content).map_err(|e| NewsfeedError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NewsfeedError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NewsfeedError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NewsfeedError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a credential from the named env var; empty counts as missing.
pub fn require_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(NewsfeedError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Load and validate the entity list.
pub fn load_entities(path: &Path) -> Result<Vec<Entity>> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsfeedError::io(path, e))?;
    let entities: Vec<Entity> = serde_json::from_str(&content).map_err(|e| {
        NewsfeedError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_entities(&entities)?;
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("SERPER_API_KEY"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed = parse_config(&toml_str).expect("deserialize");
        assert_eq!(parsed.search.concurrency, 10);
        assert_eq!(parsed.filter.threshold, 6);
        assert_eq!(parsed.run.timeframe_months, 8);
        assert_eq!(parsed.search.rate_limit.mode, RateLimitMode::Wait);
    }

    #[test]
    fn partial_config_takes_defaults() {
        let toml_str = r#"
[filter]
threshold = 7

[search.rate_limit]
requests_per_window = 5
mode = "fail_fast"

[delivery]
recipients = ["team@example.org"]
"#;
        let config = parse_config(toml_str).expect("parse");
        assert_eq!(config.filter.threshold, 7);
        assert_eq!(config.search.rate_limit.requests_per_window, 5);
        assert_eq!(config.search.rate_limit.window_secs, 60);
        assert_eq!(config.search.rate_limit.mode, RateLimitMode::FailFast);
        assert_eq!(config.delivery.recipients, vec!["team@example.org"]);
        assert_eq!(config.transform.concurrency, 2);
    }

    #[test]
    fn unknown_fields_fail_fast() {
        let err = parse_config("[filter]\ntreshold = 7\n").unwrap_err();
        assert!(err.to_string().contains("treshold"));

        assert!(parse_config("[mystery]\nx = 1\n").is_err());
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(parse_config("[filter]\nthreshold = 11\n").is_err());
        assert!(parse_config("[search]\nconcurrency = 0\n").is_err());
        assert!(parse_config("[transform]\nmax_drop_ratio = 1.5\n").is_err());
        assert!(parse_config("[delivery]\nrecipients = [\"not-an-email\"]\n").is_err());
    }

    #[test]
    fn retry_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn ledger_path_defaults_under_output_dir() {
        let run = RunConfig::default();
        assert_eq!(run.ledger_path(), Path::new("output").join("newsfeed.db"));
    }

    #[test]
    fn api_key_validation() {
        // Use a unique env var name to avoid interfering with other tests
        let result = require_api_key("NEWSFEED_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn entity_fixture_loads() {
        let entities = load_entities(Path::new("../../../fixtures/json/entities.fixture.json"))
            .expect("load fixture entities");
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0].name, "Anna Keller");
        assert_eq!(entities[0].attribute("country"), Some("Germany"));
    }

    #[test]
    fn config_fixture_validates() {
        let config = load_config_from(Path::new("../../../fixtures/config/newsfeed.fixture.toml"))
            .expect("load fixture config");
        assert_eq!(config.delivery.recipients.len(), 2);
        assert_eq!(config.filter.threshold, 6);
    }
}
