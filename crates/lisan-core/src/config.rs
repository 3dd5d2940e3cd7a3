//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOKEN_URL: &str = "http://localhost:3000/token";
pub const DEFAULT_REALTIME_BASE_URL: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";
pub const DEFAULT_CHANNEL_LABEL: &str = "oai-events";
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Top-level Lisan configuration.
///
/// Every section is optional; accessors fall back to the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime: Option<RealtimeConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Where ephemeral credentials are minted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_url")]
    pub url: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            url: default_token_url(),
        }
    }
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.into()
}

/// Remote realtime endpoint used for SDP signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_realtime_base_url")]
    pub base_url: String,
    #[serde(default = "default_realtime_model")]
    pub model: String,
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_realtime_base_url(),
            model: default_realtime_model(),
            channel_label: default_channel_label(),
        }
    }
}

fn default_realtime_base_url() -> String {
    DEFAULT_REALTIME_BASE_URL.into()
}

fn default_realtime_model() -> String {
    DEFAULT_REALTIME_MODEL.into()
}

fn default_channel_label() -> String {
    DEFAULT_CHANNEL_LABEL.into()
}

/// What happens when the peer connection drops without an explicit stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Tear the session down and report it stopped.
    #[default]
    AutoStop,
    /// Log the drop and leave the session for the user to stop.
    AwaitUser,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,

    /// Seconds to wait for the event channel after negotiation (0 = wait forever).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_timeout_secs: Option<u64>,

    /// STUN/TURN URLs handed to the peer connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Opus silence frames; keeps the outbound leg alive without a device.
    #[default]
    Silence,
    /// Default host input device (requires the `audio-device` feature).
    Microphone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Drain remote audio and report playback diagnostics only.
    #[default]
    Diagnostic,
    /// Default host output device (requires the `audio-device` feature).
    Speaker,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub capture: CaptureSource,
    #[serde(default)]
    pub playback: PlaybackMode,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Per-crate log level overrides (e.g. "lisan_session=debug").
    #[serde(default)]
    pub filters: Vec<String>,
    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::LisanError::Io)?;
        let substituted = substitute_env_vars(&raw);
        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::LisanError::Config(e.to_string()))?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn token_url(&self) -> String {
        self.token
            .as_ref()
            .map(|t| t.url.clone())
            .unwrap_or_else(default_token_url)
    }

    pub fn realtime_base_url(&self) -> String {
        self.realtime
            .as_ref()
            .map(|r| r.base_url.clone())
            .unwrap_or_else(default_realtime_base_url)
    }

    pub fn realtime_model(&self) -> String {
        self.realtime
            .as_ref()
            .map(|r| r.model.clone())
            .unwrap_or_else(default_realtime_model)
    }

    pub fn channel_label(&self) -> String {
        self.realtime
            .as_ref()
            .map(|r| r.channel_label.clone())
            .unwrap_or_else(default_channel_label)
    }

    pub fn disconnect_policy(&self) -> DisconnectPolicy {
        self.session
            .as_ref()
            .map(|s| s.on_disconnect)
            .unwrap_or_default()
    }

    /// Channel-open timeout; `None` means wait indefinitely.
    pub fn open_timeout(&self) -> Option<Duration> {
        let secs = self
            .session
            .as_ref()
            .and_then(|s| s.open_timeout_secs)
            .unwrap_or(DEFAULT_OPEN_TIMEOUT_SECS);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn ice_servers(&self) -> Vec<String> {
        self.session
            .as_ref()
            .and_then(|s| s.ice_servers.clone())
            .unwrap_or_else(|| vec![DEFAULT_ICE_SERVER.to_string()])
    }

    pub fn capture_source(&self) -> CaptureSource {
        self.media.as_ref().map(|m| m.capture).unwrap_or_default()
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.media.as_ref().map(|m| m.playback).unwrap_or_default()
    }

    /// Get a config value by dotted path (e.g. "realtime.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    ///
    /// `audio_device` tells whether the binary was built with host audio support.
    pub fn validate(&self, audio_device: bool) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for (name, url) in [
            ("token.url", self.token_url()),
            ("realtime.base_url", self.realtime_base_url()),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("{name} must be an http(s) URL, got '{url}'"));
            }
        }

        if self.realtime_model().trim().is_empty() {
            errors.push("realtime.model cannot be empty".to_string());
        }

        if self.channel_label().is_empty() {
            errors.push("realtime.channel_label cannot be empty".to_string());
        }

        if self.realtime_base_url().starts_with("http://") {
            warnings.push("realtime.base_url is not TLS; the credential travels in clear".into());
        }

        if !audio_device {
            if self.capture_source() == CaptureSource::Microphone {
                errors.push(
                    "media.capture = microphone requires the audio-device feature".to_string(),
                );
            }
            if self.playback_mode() == PlaybackMode::Speaker {
                errors.push(
                    "media.playback = speaker requires the audio-device feature".to_string(),
                );
            }
        }

        if self.ice_servers().is_empty() {
            warnings.push("No ICE servers configured; only host candidates will be gathered".into());
        }

        (warnings, errors)
    }

    /// A config with every section present and set to its default, for writing
    /// out a starter file.
    pub fn with_defaults() -> Self {
        Self {
            token: Some(TokenConfig::default()),
            realtime: Some(RealtimeConfig::default()),
            session: Some(SessionConfig {
                on_disconnect: DisconnectPolicy::default(),
                open_timeout_secs: Some(DEFAULT_OPEN_TIMEOUT_SECS),
                ice_servers: Some(vec![DEFAULT_ICE_SERVER.to_string()]),
            }),
            media: Some(MediaConfig::default()),
            logging: Some(LoggingConfig {
                level: Some("info".into()),
                ..Default::default()
            }),
        }
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Lisan data: `~/.lisan/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lisan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_LISAN_TOKEN_HOST", "tokens.internal") };
        let input = r#"{"url": "https://${TEST_LISAN_TOKEN_HOST}/token", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("https://tokens.internal/token"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_LISAN_TOKEN_HOST") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_LISAN_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.token_url(), "http://localhost:3000/token");
        assert_eq!(config.realtime_base_url(), "https://api.openai.com/v1/realtime");
        assert_eq!(config.realtime_model(), "gpt-4o-realtime-preview-2024-12-17");
        assert_eq!(config.channel_label(), "oai-events");
        assert_eq!(config.disconnect_policy(), DisconnectPolicy::AutoStop);
        assert_eq!(config.open_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.capture_source(), CaptureSource::Silence);
        assert_eq!(config.playback_mode(), PlaybackMode::Diagnostic);
    }

    #[test]
    fn test_open_timeout_zero_disables() {
        let config: Config = json5::from_str(r#"{ session: { open_timeout_secs: 0 } }"#).unwrap();
        assert_eq!(config.open_timeout(), None);
    }

    #[test]
    fn test_session_and_media_sections() {
        let json_str = r#"{
            // json5 allows comments
            session: { on_disconnect: "await_user", ice_servers: [] },
            media: { capture: "microphone", playback: "speaker" },
            realtime: { model: "gpt-4o-mini-realtime-preview" },
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        assert_eq!(config.disconnect_policy(), DisconnectPolicy::AwaitUser);
        assert!(config.ice_servers().is_empty());
        assert_eq!(config.capture_source(), CaptureSource::Microphone);
        assert_eq!(config.playback_mode(), PlaybackMode::Speaker);
        assert_eq!(config.realtime_model(), "gpt-4o-mini-realtime-preview");
        // Unset fields in a present section still get their defaults
        assert_eq!(config.realtime_base_url(), DEFAULT_REALTIME_BASE_URL);
        assert_eq!(config.channel_label(), DEFAULT_CHANNEL_LABEL);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/lisan/config.json")).unwrap();
        assert!(config.token.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ token: { url: "https://example.test/token" } }"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.token_url(), "https://example.test/token");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.realtime = Some(RealtimeConfig {
            model: "gpt-4o-mini-realtime-preview".into(),
            ..Default::default()
        });
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.realtime_model(), "gpt-4o-mini-realtime-preview");
        assert_eq!(loaded.channel_label(), DEFAULT_CHANNEL_LABEL);
        assert!(loaded.token.is_none());
    }

    #[test]
    fn test_with_defaults_writes_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::with_defaults().save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for section in ["token", "realtime", "session", "media", "logging"] {
            assert!(raw.get(section).is_some(), "missing section {section}");
        }
        assert_eq!(raw["token"]["url"], DEFAULT_TOKEN_URL);
        assert_eq!(raw["realtime"]["model"], DEFAULT_REALTIME_MODEL);
        assert_eq!(raw["session"]["on_disconnect"], "auto_stop");
        assert_eq!(raw["session"]["open_timeout_secs"], DEFAULT_OPEN_TIMEOUT_SECS);
        assert_eq!(raw["media"]["capture"], "silence");

        let loaded = Config::load(&path).unwrap();
        let (_, errors) = loaded.validate(false);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(loaded.ice_servers(), vec![DEFAULT_ICE_SERVER.to_string()]);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ token: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_get_path() {
        let config: Config =
            json5::from_str(r#"{ realtime: { model: "m-1" } }"#).unwrap();
        assert_eq!(
            config.get_path("realtime.model"),
            Some(serde_json::json!("m-1"))
        );
        assert!(config.get_path("realtime.nope").is_none());
    }

    #[test]
    fn test_logging_config_defaults() {
        let json_str = r#"{ "logging": {} }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_logging_config_filters() {
        let json_str = r#"{
            "logging": {
                "format": "json",
                "filters": ["lisan_session=debug", "webrtc=warn"]
            }
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.filters, vec!["lisan_session=debug", "webrtc=warn"]);
    }

    #[test]
    fn test_validate_bad_url_errors() {
        let config = Config {
            token: Some(TokenConfig {
                url: "localhost:3000/token".into(),
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate(false);
        assert!(
            errors.iter().any(|e| e.contains("token.url")),
            "Expected an error about token.url, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_device_modes_need_feature() {
        let config = Config {
            media: Some(MediaConfig {
                capture: CaptureSource::Microphone,
                playback: PlaybackMode::Speaker,
            }),
            ..Config::default()
        };
        let (_, errors) = config.validate(false);
        assert_eq!(errors.len(), 2, "got: {errors:?}");

        let (_, errors) = config.validate(true);
        assert!(errors.is_empty(), "got: {errors:?}");
    }

    #[test]
    fn test_validate_plain_http_realtime_warns() {
        let config = Config {
            realtime: Some(RealtimeConfig {
                base_url: "http://127.0.0.1:9000/v1/realtime".into(),
                model: DEFAULT_REALTIME_MODEL.into(),
                channel_label: DEFAULT_CHANNEL_LABEL.into(),
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate(false);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("TLS")));
    }
}
