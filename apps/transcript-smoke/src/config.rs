//! Environment-backed configuration for `transcript-smoke`.

use std::env;

use thiserror::Error;
use transcript_core::WindowTuning;

const DEFAULT_CONVERSATION_ID: &str = "smoke-conversation";
const DEFAULT_MESSAGE_COUNT: usize = 240;
const DEFAULT_UNREAD_COUNT: usize = 4;
const DEFAULT_VIEWPORT_HEIGHT_PX: f32 = 600.0;
const DEFAULT_SCROLL_STEPS: usize = 12;
const DEFAULT_EVENT_TIMEOUT_MS: u64 = 2_000;

/// Runtime configuration used by the smoke run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Conversation seeded into the in-memory store.
    pub conversation_id: String,
    /// Number of seeded messages.
    pub message_count: usize,
    /// Trailing seeded messages flagged unread.
    pub unread_count: usize,
    /// Simulated viewport height.
    pub viewport_height_px: f32,
    /// Maximum number of scroll-to-top steps before jumping back down.
    pub scroll_steps: usize,
    /// How long to wait for any single runtime event.
    pub event_timeout_ms: u64,
    /// Window engine tuning forwarded to the runtime.
    pub tuning: WindowTuning,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let conversation_id = optional_trimmed_env("TRANSCRIPT_SMOKE_CONVERSATION", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_owned());
        let message_count = parse_optional_usize(
            "TRANSCRIPT_SMOKE_MESSAGES",
            DEFAULT_MESSAGE_COUNT,
            &mut lookup,
        )?;
        let unread_count =
            parse_optional_usize("TRANSCRIPT_SMOKE_UNREAD", DEFAULT_UNREAD_COUNT, &mut lookup)?;
        let viewport_height_px = parse_optional_f32(
            "TRANSCRIPT_SMOKE_VIEWPORT_PX",
            DEFAULT_VIEWPORT_HEIGHT_PX,
            &mut lookup,
        )?;
        let scroll_steps = parse_optional_usize(
            "TRANSCRIPT_SMOKE_SCROLL_STEPS",
            DEFAULT_SCROLL_STEPS,
            &mut lookup,
        )?;
        let event_timeout_ms = parse_optional_u64(
            "TRANSCRIPT_SMOKE_EVENT_TIMEOUT_MS",
            DEFAULT_EVENT_TIMEOUT_MS,
            &mut lookup,
        )?;

        let defaults = WindowTuning::default();
        let tuning = WindowTuning {
            page_size: parse_optional_usize(
                "TRANSCRIPT_PAGE_SIZE",
                defaults.page_size,
                &mut lookup,
            )?,
            mark_read_throttle_ms: parse_optional_u64(
                "TRANSCRIPT_MARK_READ_THROTTLE_MS",
                defaults.mark_read_throttle_ms,
                &mut lookup,
            )?,
            load_newer_threshold_rows: parse_optional_usize(
                "TRANSCRIPT_LOAD_NEWER_THRESHOLD_ROWS",
                defaults.load_newer_threshold_rows,
                &mut lookup,
            )?,
            keep_at_bottom_screens: parse_optional_usize(
                "TRANSCRIPT_KEEP_AT_BOTTOM_SCREENS",
                defaults.keep_at_bottom_screens,
                &mut lookup,
            )?,
            keep_at_top_screens: parse_optional_usize(
                "TRANSCRIPT_KEEP_AT_TOP_SCREENS",
                defaults.keep_at_top_screens,
                &mut lookup,
            )?,
            estimated_row_height_px: parse_optional_f32(
                "TRANSCRIPT_ESTIMATED_ROW_HEIGHT_PX",
                defaults.estimated_row_height_px,
                &mut lookup,
            )?,
            at_bottom_threshold_px: parse_optional_f32(
                "TRANSCRIPT_AT_BOTTOM_THRESHOLD_PX",
                defaults.at_bottom_threshold_px,
                &mut lookup,
            )?,
        };

        require_at_least_one("TRANSCRIPT_SMOKE_MESSAGES", message_count)?;
        require_at_least_one("TRANSCRIPT_PAGE_SIZE", tuning.page_size)?;
        require_at_least_one("TRANSCRIPT_KEEP_AT_BOTTOM_SCREENS", tuning.keep_at_bottom_screens)?;
        require_at_least_one("TRANSCRIPT_KEEP_AT_TOP_SCREENS", tuning.keep_at_top_screens)?;
        require_positive("TRANSCRIPT_SMOKE_VIEWPORT_PX", viewport_height_px)?;
        require_positive(
            "TRANSCRIPT_ESTIMATED_ROW_HEIGHT_PX",
            tuning.estimated_row_height_px,
        )?;
        if tuning.at_bottom_threshold_px.is_nan() || tuning.at_bottom_threshold_px < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "TRANSCRIPT_AT_BOTTOM_THRESHOLD_PX",
                value: tuning.at_bottom_threshold_px.to_string(),
                reason: "must not be negative".to_owned(),
            });
        }
        if unread_count > message_count {
            return Err(ConfigError::InvalidValue {
                key: "TRANSCRIPT_SMOKE_UNREAD",
                value: unread_count.to_string(),
                reason: format!("must not exceed TRANSCRIPT_SMOKE_MESSAGES ({message_count})"),
            });
        }

        Ok(Self {
            conversation_id,
            message_count,
            unread_count,
            viewport_height_px,
            scroll_steps,
            event_timeout_ms,
            tuning,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn parse_optional_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn parse_optional_f32<F>(key: &'static str, default: f32, lookup: &mut F) -> Result<f32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<f32>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn require_at_least_one(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

fn require_positive(key: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than 0".to_owned(),
        });
    }
    Ok(())
}
