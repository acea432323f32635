use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

/// Tuning for the whole client. Filled from `client.toml` and the environment by [`load_settings`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub push_url: Option<String>,
    pub page_size: u32,
    pub top_edge_threshold_px: f32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub event_buffer: usize,
    pub out_of_window_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000/api/v1".into(),
            push_url: None,
            page_size: 15,
            top_edge_threshold_px: 120.0,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 1024,
            out_of_window_buffer: 256,
        }
    }
}

/// Connection tuning handed to the session manager.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        ClientSettings::default().session_settings()
    }
}

impl ClientSettings {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            reconnect_attempts: self.reconnect_attempts.max(1),
            reconnect_delay: self.reconnect_delay,
            handshake_timeout: self.handshake_timeout,
            event_buffer: self.event_buffer.max(16),
        }
    }

    /// WebSocket endpoint for the push stream. Falls back to the API origin with a ws scheme.
    pub fn push_endpoint(&self) -> anyhow::Result<Url> {
        if let Some(push_url) = &self.push_url {
            return Url::parse(push_url).with_context(|| format!("invalid push url '{push_url}'"));
        }

        let api = Url::parse(&self.api_url)
            .with_context(|| format!("invalid api url '{}'", self.api_url))?;
        let scheme = match api.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("api url must be http or https, got '{other}'")),
        };
        let mut push = api.clone();
        push.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive push url from '{}'", self.api_url))?;
        push.set_path("/ws");
        push.set_query(None);
        Ok(push)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_overrides(&mut settings, |key| {
                file_cfg.get(key).map(|value| match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            });
        }
    }

    if let Some(v) = env("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("CHAT_PUSH_URL") {
        settings.push_url = Some(v);
    }
    apply_overrides(&mut settings, |key| env(&format!("APP__{}", key.to_ascii_uppercase())));

    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_url") {
        settings.api_url = v;
    }
    if let Some(v) = lookup("push_url") {
        settings.push_url = Some(v);
    }
    if let Some(v) = parsed::<u32>(&lookup, "page_size") {
        if v > 0 {
            settings.page_size = v;
        }
    }
    if let Some(v) = parsed::<f32>(&lookup, "top_edge_threshold_px") {
        settings.top_edge_threshold_px = v;
    }
    if let Some(v) = parsed::<u32>(&lookup, "reconnect_attempts") {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = parsed::<u64>(&lookup, "reconnect_delay_ms") {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "request_timeout_ms") {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<u64>(&lookup, "handshake_timeout_ms") {
        settings.handshake_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parsed::<usize>(&lookup, "event_buffer") {
        settings.event_buffer = v;
    }
    if let Some(v) = parsed::<usize>(&lookup, "out_of_window_buffer") {
        settings.out_of_window_buffer = v;
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse::<T>().ok())
}
