//! Configuration parsing and validation for proxyrelay.

use std::path::Path;
use std::time::Duration;

use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dispatch::DispatchPolicy;

/// Convention env var consulted when no API key is configured.
pub const API_KEY_ENV: &str = "PROXYRELAY_API_KEY";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared secret required as a bearer token on the API routes
    pub api_key: Option<ApiKey>,
    /// Chat requests handled at once before answering 429
    #[serde(default = "default_max_concurrent_chats")]
    pub max_concurrent_chats: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_concurrent_chats() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: None,
            max_concurrent_chats: default_max_concurrent_chats(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How the server API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key came from the convention env var (holds var name)
    Convention(String),
    /// No key: the API is open
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Inference provider endpoints and the header pair it expects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OpenAI-compatible base URL (chat completions and models list live below it)
    pub base_url: String,
    /// Base URL for native inference endpoints (transcription)
    pub inference_url: String,
    /// Model used when a transcription request names none
    pub transcription_model: String,
    /// Value of the `X-Deepinfra-Source` header
    pub source_header: String,
    /// Value of the `User-Agent` header
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepinfra.com/v1/openai".to_string(),
            inference_url: "https://api.deepinfra.com/v1/inference".to_string(),
            transcription_model: "openai/whisper-large-v3".to_string(),
            source_header: "web-page".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/92.0.4515.107 Safari/537.36"
                .to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.base_url.trim_end_matches('/'))
    }

    pub fn transcription_url(&self, model: Option<&str>) -> String {
        let model = model.unwrap_or(&self.transcription_model);
        format!(
            "{}/{}",
            self.inference_url.trim_end_matches('/'),
            model.trim_start_matches('/')
        )
    }
}

/// Proxy pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Proxy list provider URL, or a path to a local list file
    pub source_url: String,
    pub source_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_connect_timeout_secs: u64,
    /// Probes in flight during a refresh
    pub probe_concurrency: usize,
    pub refresh_interval_secs: u64,
    /// An empty pool older than this is refreshed on demand
    pub stale_after_secs: u64,
    /// Longest pause of a dispatch waiting for an empty pool
    pub empty_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            source_url: "https://api.proxyscrape.com/v3/free-proxy-list/get?request=displayproxies\
                         &protocol=http&proxy_format=ipport&format=text\
                         &anonymity=Elite,Anonymous&timeout=5000"
                .to_string(),
            source_timeout_secs: 10,
            probe_timeout_secs: 5,
            probe_connect_timeout_secs: 3,
            probe_concurrency: 50,
            refresh_interval_secs: 600,
            stale_after_secs: 120,
            empty_backoff_ms: 500,
        }
    }
}

impl PoolConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_connect_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_backoff_ms)
    }
}

/// Retry limits for one kind of upstream call.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DispatchSettings {
    /// Attempt ceiling for one logical request
    pub max_attempts: u32,
    /// Overall deadline for the whole dispatch
    pub deadline_secs: u64,
    /// Timeout of each individual upstream call
    pub attempt_timeout_secs: u64,
}

impl DispatchSettings {
    const fn new(max_attempts: u32, deadline_secs: u64, attempt_timeout_secs: u64) -> Self {
        Self {
            max_attempts,
            deadline_secs,
            attempt_timeout_secs,
        }
    }

    /// Turn into the dispatcher's policy, pausing `empty_backoff` on an empty pool.
    pub fn policy(&self, empty_backoff: Duration) -> DispatchPolicy {
        DispatchPolicy {
            max_attempts: self.max_attempts,
            deadline: Duration::from_secs(self.deadline_secs),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            empty_backoff,
        }
    }
}

/// Per-operation dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_chat_dispatch")]
    pub chat: DispatchSettings,
    #[serde(default = "default_transcription_dispatch")]
    pub transcription: DispatchSettings,
    #[serde(default = "default_models_dispatch")]
    pub models: DispatchSettings,
    #[serde(default = "default_model_probe_dispatch")]
    pub model_probe: DispatchSettings,
}

fn default_chat_dispatch() -> DispatchSettings {
    DispatchSettings::new(30, 90, 60)
}

fn default_transcription_dispatch() -> DispatchSettings {
    DispatchSettings::new(5, 300, 120)
}

fn default_models_dispatch() -> DispatchSettings {
    DispatchSettings::new(3, 60, 30)
}

fn default_model_probe_dispatch() -> DispatchSettings {
    DispatchSettings::new(2, 30, 20)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_dispatch(),
            transcription: default_transcription_dispatch(),
            models: default_models_dispatch(),
            model_probe: default_model_probe_dispatch(),
        }
    }
}

/// Model catalog configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// When false every model is accepted and nothing is probed
    pub enabled: bool,
    pub refresh_interval_secs: u64,
    /// Trial chats in flight during a catalog refresh
    pub probe_concurrency: usize,
    /// An empty catalog triggers a background refresh at most this often
    pub fail_open_after_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 3600,
            probe_concurrency: 10,
            fail_open_after_secs: 5,
        }
    }
}

impl ModelsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fail_open_after(&self) -> Duration {
        Duration::from_secs(self.fail_open_after_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.listen must not be empty".to_string(),
            ));
        }

        if self.server.max_concurrent_chats == 0 {
            return Err(ConfigError::Validation(
                "server.max_concurrent_chats must be at least 1".to_string(),
            ));
        }

        for (name, url) in [
            ("upstream.base_url", &self.upstream.base_url),
            ("upstream.inference_url", &self.upstream.inference_url),
        ] {
            reqwest::Url::parse(url).map_err(|e| {
                ConfigError::Validation(format!("{} is not a valid URL ({}): {}", name, url, e))
            })?;
        }

        for (name, value) in [
            ("upstream.source_header", &self.upstream.source_header),
            ("upstream.user_agent", &self.upstream.user_agent),
        ] {
            if HeaderValue::from_str(value).is_err() {
                return Err(ConfigError::Validation(format!(
                    "{} is not a valid header value",
                    name
                )));
            }
        }

        if self.pool.source_url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pool.source_url must not be empty".to_string(),
            ));
        }

        if self.pool.probe_concurrency == 0 || self.models.probe_concurrency == 0 {
            return Err(ConfigError::Validation(
                "probe_concurrency must be at least 1".to_string(),
            ));
        }

        if self.pool.refresh_interval_secs == 0 || self.models.refresh_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "refresh_interval_secs must be at least 1".to_string(),
            ));
        }

        for (name, settings) in [
            ("dispatch.chat", &self.dispatch.chat),
            ("dispatch.transcription", &self.dispatch.transcription),
            ("dispatch.models", &self.dispatch.models),
            ("dispatch.model_probe", &self.dispatch.model_probe),
        ] {
            if settings.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.max_attempts must be at least 1",
                    name
                )));
            }
            if settings.deadline_secs == 0 || settings.attempt_timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "{} timeouts must be at least 1 second",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Apply the conventional `PORT` variable: listen on all interfaces at that port.
    pub fn apply_port_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").filter(|p| !p.trim().is_empty()) {
            self.server.listen = format!("0.0.0.0:{}", port.trim());
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Raw server section; api_key may still contain `${VAR}` references.
#[derive(Deserialize)]
pub struct RawServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    api_key: Option<String>,
    #[serde(default = "default_max_concurrent_chats")]
    max_concurrent_chats: usize,
}

impl Default for RawServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: None,
            max_concurrent_chats: default_max_concurrent_chats(),
        }
    }
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: RawServerConfig,
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    models: ModelsConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string. Fails on first missing variable,
/// unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

impl Config {
    /// Convert raw config to final config, resolving the API key through `lookup`.
    ///
    /// - `${VAR}` in `api_key`: expanded, source = `EnvExpanded`
    /// - literal `api_key`: used as-is, source = `Literal`
    /// - absent: `PROXYRELAY_API_KEY` if set, source = `Convention`, else `None`
    ///
    /// An empty resolved key disables auth.
    pub fn from_raw_with<F>(raw: RawConfig, lookup: F) -> Result<(Self, KeySource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (api_key, source) = match raw.server.api_key {
            Some(ref raw_key) if raw_key.contains("${") => {
                let expanded = expand_env_vars_with(raw_key, "server.api_key", &lookup)?;
                (Some(expanded), KeySource::EnvExpanded)
            }
            Some(raw_key) => (Some(raw_key), KeySource::Literal),
            None => match lookup(API_KEY_ENV) {
                Some(value) => (Some(value), KeySource::Convention(API_KEY_ENV.to_string())),
                None => (None, KeySource::None),
            },
        };

        let (api_key, source) = match api_key {
            Some(key) if !key.is_empty() => (Some(ApiKey::from(key)), source),
            _ => (None, KeySource::None),
        };

        let config = Config {
            server: ServerConfig {
                listen: raw.server.listen,
                api_key,
                max_concurrent_chats: raw.server.max_concurrent_chats,
            },
            upstream: raw.upstream,
            pool: raw.pool,
            dispatch: raw.dispatch,
            models: raw.models,
            logging: raw.logging,
        };

        Ok((config, source))
    }

    /// Parse a TOML string with environment resolution through `lookup`.
    pub fn parse_str_with_env<F>(content: &str, lookup: F) -> Result<(Self, KeySource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (mut config, source) = Self::from_raw_with(raw, &lookup)?;
        config.apply_port_with(&lookup);
        config.validate()?;
        Ok((config, source))
    }

    /// Load configuration from a TOML file with environment variable resolution.
    ///
    /// This is the env-aware entry point used by the binary. It:
    /// 1. Reads the file
    /// 2. Parses as `RawConfig` (api_key as plain String)
    /// 3. Expands `${VAR}` references, applies the key convention and `PORT`
    /// 4. Validates the resulting config
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<(Self, KeySource), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with_env(&content, |name| std::env::var(name).ok())
    }

    /// Defaults plus environment resolution, for running without a config file.
    pub fn from_env() -> Result<(Self, KeySource), ConfigError> {
        Self::parse_str_with_env("", |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert!(config.server.api_key.is_none());
        assert_eq!(config.pool.probe_concurrency, 50);
        assert_eq!(config.pool.stale_after(), Duration::from_secs(120));
        assert_eq!(config.dispatch.chat.max_attempts, 30);
        assert_eq!(config.dispatch.chat.deadline_secs, 90);
        assert_eq!(config.dispatch.transcription.deadline_secs, 300);
        assert!(config.models.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"
            api_key = "sk-local"
            max_concurrent_chats = 8

            [upstream]
            base_url = "http://upstream.test/v1/openai/"
            inference_url = "http://upstream.test/v1/inference"
            transcription_model = "openai/whisper-tiny"

            [pool]
            source_url = "/etc/proxyrelay/proxies.txt"
            probe_concurrency = 20
            refresh_interval_secs = 900
            stale_after_secs = 60
            empty_backoff_ms = 250

            [dispatch.chat]
            max_attempts = 10
            deadline_secs = 45
            attempt_timeout_secs = 30

            [models]
            enabled = false

            [logging]
            level = "debug"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.api_key.as_ref().unwrap().expose_secret(), "sk-local");
        assert_eq!(config.server.max_concurrent_chats, 8);
        assert_eq!(
            config.upstream.chat_url(),
            "http://upstream.test/v1/openai/chat/completions"
        );
        assert_eq!(config.upstream.models_url(), "http://upstream.test/v1/openai/models");
        assert_eq!(
            config.upstream.transcription_url(None),
            "http://upstream.test/v1/inference/openai/whisper-tiny"
        );
        assert_eq!(config.pool.source_url, "/etc/proxyrelay/proxies.txt");
        // unspecified pool fields keep their defaults
        assert_eq!(config.pool.probe_timeout_secs, 5);
        assert_eq!(config.pool.empty_backoff(), Duration::from_millis(250));
        assert_eq!(config.dispatch.chat.max_attempts, 10);
        assert_eq!(config.dispatch.transcription.max_attempts, 5);
        assert!(!config.models.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_dispatch_policy_conversion() {
        let settings = DispatchSettings::new(30, 90, 60);
        let policy = settings.policy(Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 30);
        assert_eq!(policy.deadline, Duration::from_secs(90));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(60));
        assert_eq!(policy.empty_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_transcription_url_with_model() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.transcription_url(Some("openai/whisper-large-v3-turbo")),
            "https://api.deepinfra.com/v1/inference/openai/whisper-large-v3-turbo"
        );
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let toml = r#"
            [dispatch.chat]
            max_attempts = 0
            deadline_secs = 90
            attempt_timeout_secs = 60
        "#;
        let err = Config::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("dispatch.chat.max_attempts"), "{}", err);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let toml = r#"
            [pool]
            probe_concurrency = 0
        "#;
        assert!(matches!(
            Config::parse_str(toml).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_validation_rejects_bad_base_url() {
        let toml = r#"
            [upstream]
            base_url = "not a url"
        "#;
        let err = Config::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("upstream.base_url"), "{}", err);
    }

    #[test]
    fn test_validation_rejects_bad_header_value() {
        let toml = "[upstream]\nuser_agent = \"line\\nbreak\"\n";
        let err = Config::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("upstream.user_agent"), "{}", err);
    }

    #[test]
    fn test_partial_dispatch_section_is_parse_error() {
        let toml = r#"
            [dispatch.chat]
            max_attempts = 10
        "#;
        assert!(matches!(
            Config::parse_str(toml).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_api_key_redacted() {
        let key = ApiKey::from("sk-super-secret");
        assert_eq!(format!("{:?}", key), "[REDACTED]");
        assert_eq!(format!("{}", key), "[REDACTED]");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "sk-super-secret");
    }

    #[test]
    fn test_expand_single_var() {
        let result = expand_env_vars_with("${KEY}", "server.api_key", env(&[("KEY", "abc")]));
        assert_eq!(result.unwrap(), "abc");
    }

    #[test]
    fn test_expand_multiple_vars_with_literal_text() {
        let result = expand_env_vars_with(
            "sk-${PREFIX}-${SUFFIX}!",
            "server.api_key",
            env(&[("PREFIX", "a"), ("SUFFIX", "b")]),
        );
        assert_eq!(result.unwrap(), "sk-a-b!");
    }

    #[test]
    fn test_expand_missing_var() {
        let err = expand_env_vars_with("${NOPE}", "server.api_key", env(&[])).unwrap_err();
        match err {
            ConfigError::EnvVar { var, field, .. } => {
                assert_eq!(var, "NOPE");
                assert_eq!(field, "server.api_key");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_expand_unclosed_and_empty() {
        assert!(matches!(
            expand_env_vars_with("${OPEN", "f", env(&[])).unwrap_err(),
            ConfigError::EnvVar { ref var, .. } if var == "<unclosed>"
        ));
        assert!(matches!(
            expand_env_vars_with("${}", "f", env(&[])).unwrap_err(),
            ConfigError::EnvVar { ref var, .. } if var.is_empty()
        ));
    }

    #[test]
    fn test_key_source_literal() {
        let (config, source) =
            Config::parse_str_with_env("[server]\napi_key = \"plain\"\n", env(&[])).unwrap();
        assert_eq!(source, KeySource::Literal);
        assert_eq!(config.server.api_key.unwrap().expose_secret(), "plain");
    }

    #[test]
    fn test_key_source_expanded() {
        let (config, source) = Config::parse_str_with_env(
            "[server]\napi_key = \"${RELAY_SECRET}\"\n",
            env(&[("RELAY_SECRET", "from-env")]),
        )
        .unwrap();
        assert_eq!(source, KeySource::EnvExpanded);
        assert_eq!(config.server.api_key.unwrap().expose_secret(), "from-env");
    }

    #[test]
    fn test_key_source_convention() {
        let (config, source) =
            Config::parse_str_with_env("", env(&[(API_KEY_ENV, "conv")])).unwrap();
        assert_eq!(source, KeySource::Convention(API_KEY_ENV.to_string()));
        assert_eq!(config.server.api_key.unwrap().expose_secret(), "conv");
    }

    #[test]
    fn test_key_source_none_and_empty() {
        let (config, source) = Config::parse_str_with_env("", env(&[])).unwrap();
        assert_eq!(source, KeySource::None);
        assert!(config.server.api_key.is_none());

        let (config, source) =
            Config::parse_str_with_env("[server]\napi_key = \"\"\n", env(&[])).unwrap();
        assert_eq!(source, KeySource::None);
        assert!(config.server.api_key.is_none());
    }

    #[test]
    fn test_port_override() {
        let (config, _) = Config::parse_str_with_env(
            "[server]\nlisten = \"127.0.0.1:1\"\n",
            env(&[("PORT", "9090")]),
        )
        .unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9090");
    }
}
