use std::time::Duration;

use serde::Deserialize;

use crate::collab::SessionOptions;

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Upper bound for one outbound call; `0` disables the limit.
    pub request_timeout_ms: u64,
    pub history_limit: u32,
    pub outbox_capacity: usize,
    pub cursor_headroom: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5000,
            database_url: "sqlite::memory:".to_string(),
            request_timeout_ms: 30_000,
            history_limit: 50,
            outbox_capacity: 256,
            cursor_headroom: 32,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            outbox_capacity: self.outbox_capacity,
            cursor_headroom: self.cursor_headroom,
        }
    }
}

pub fn parse_config(src: &str) -> Result<Config, String> {
    if src.trim().is_empty() {
        return Ok(Config::default());
    }
    let config = serde_yaml::from_str::<Config>(src).map_err(|e| e.to_string())?;
    if config.cursor_headroom >= config.outbox_capacity {
        return Err(format!(
            "cursor_headroom ({}) must be smaller than outbox_capacity ({})",
            config.cursor_headroom, config.outbox_capacity
        ));
    }
    Ok(config)
}
