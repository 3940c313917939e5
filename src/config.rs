use std::time::Duration;

use anyhow::{bail, Context};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub image_model: String,
    pub text_model: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Request body cap. Uploads arrive as base64 data URLs, a third larger than the file.
    pub max_upload_bytes: usize,
    pub session_idle_ttl: Duration,
    pub gemini: GeminiConfig,
    pub retry: RetryPolicy,
}

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] with a pluggable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;
        let gemini = GeminiConfig {
            api_key,
            base_url: get("GEMINI_API_BASE")
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            image_model: get("GEMINI_IMAGE_MODEL").unwrap_or_else(|| "gemini-2.5-flash-image".to_string()),
            text_model: get("GEMINI_TEXT_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            request_timeout_secs: parse_or(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS", 120)?,
        };

        let defaults = RetryPolicy::default();
        let max_attempts: u32 = parse_or(get("RETRY_MAX_ATTEMPTS"), "RETRY_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        let base_delay_ms: u64 = parse_or(
            get("RETRY_BASE_DELAY_MS"),
            "RETRY_BASE_DELAY_MS",
            defaults.base_delay.as_millis() as u64,
        )?;

        let session_idle_ttl_secs: u64 = parse_or(get("SESSION_IDLE_TTL_SECS"), "SESSION_IDLE_TTL_SECS", 3600)?;

        Ok(Self {
            port: parse_or(get("PORT"), "PORT", 8080)?,
            max_upload_bytes: parse_or(get("MAX_UPLOAD_BYTES"), "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            session_idle_ttl: Duration::from_secs(session_idle_ttl_secs),
            gemini,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                ..defaults
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> anyhow::Result<T> {
    match raw {
        Some(v) => v.trim().parse().ok().with_context(|| format!("{key} has an invalid value: {v}")),
        None => Ok(default),
    }
}
