use std::time::Duration;

use crate::transport::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the panel HTTP API (history endpoint lives under it)
    pub api_url: String,
    /// WebSocket endpoint the transport connects to
    pub ws_url: String,
    /// Maximum number of console entries kept per server
    pub console_cap: usize,
    /// How many historical lines to request when a server is first watched
    pub history_limit: usize,
    /// Upper bound on the historical fetch; a timeout counts as a failed fetch
    pub history_timeout: Duration,
    /// Reconnect policy
    pub backoff: BackoffConfig,
    /// Keepalive ping period while connected. `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Longest console command accepted, in bytes
    pub max_command_len: usize,
    /// Append accepted commands to the console as `stdin` entries
    pub echo_commands: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let api_url = "http://localhost:8080".to_string();
        let ws_url = format!("{}/ws", http_to_ws_url(&api_url));
        Self {
            api_url,
            ws_url,
            console_cap: 2000,
            history_limit: 200,
            history_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            ping_interval: Some(Duration::from_secs(30)),
            max_command_len: 4096,
            echo_commands: true,
        }
    }
}

impl RealtimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let api_url = lookup("PANEL_API_URL").unwrap_or(defaults.api_url);
        let ws_url = lookup("PANEL_WS_URL")
            .unwrap_or_else(|| format!("{}/ws", http_to_ws_url(&api_url)));

        url::Url::parse(&api_url)
            .map_err(|e| anyhow::anyhow!("Invalid PANEL_API_URL '{api_url}': {e}"))?;
        let parsed_ws = url::Url::parse(&ws_url)
            .map_err(|e| anyhow::anyhow!("Invalid PANEL_WS_URL '{ws_url}': {e}"))?;
        if !matches!(parsed_ws.scheme(), "ws" | "wss") {
            return Err(anyhow::anyhow!(
                "Invalid PANEL_WS_URL '{ws_url}'. Expected a ws:// or wss:// URL"
            ));
        }

        let ping_secs: u64 = parse_or(&lookup, "PANEL_PING_INTERVAL_SECS", 30)?;
        let jitter: f64 = parse_or(&lookup, "PANEL_RECONNECT_JITTER", defaults.backoff.jitter)?;

        Ok(Self {
            api_url,
            ws_url,
            console_cap: parse_or(&lookup, "PANEL_CONSOLE_CAP", defaults.console_cap)?.max(1),
            history_limit: parse_or(&lookup, "PANEL_HISTORY_LIMIT", defaults.history_limit)?,
            history_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PANEL_HISTORY_TIMEOUT_SECS",
                defaults.history_timeout.as_secs(),
            )?),
            backoff: BackoffConfig {
                initial: Duration::from_millis(parse_or(
                    &lookup,
                    "PANEL_RECONNECT_INITIAL_MS",
                    defaults.backoff.initial.as_millis() as u64,
                )?),
                max: Duration::from_millis(parse_or(
                    &lookup,
                    "PANEL_RECONNECT_MAX_MS",
                    defaults.backoff.max.as_millis() as u64,
                )?),
                multiplier: parse_or(
                    &lookup,
                    "PANEL_RECONNECT_MULTIPLIER",
                    defaults.backoff.multiplier,
                )?,
                jitter: jitter.clamp(0.0, 1.0),
            },
            ping_interval: (ping_secs > 0).then(|| Duration::from_secs(ping_secs)),
            max_command_len: parse_or(&lookup, "PANEL_MAX_COMMAND_LEN", defaults.max_command_len)?,
            echo_commands: parse_or(&lookup, "PANEL_ECHO_COMMANDS", defaults.echo_commands)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(default),
    }
}

/// Turn an HTTP base URL into the matching WebSocket base URL.
pub fn http_to_ws_url(http_url: &str) -> String {
    let http_url = http_url.trim_end_matches('/');
    if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if http_url.starts_with("ws://") || http_url.starts_with("wss://") {
        http_url.to_string()
    } else if http_url.is_empty() {
        "ws://localhost".to_string()
    } else {
        format!("ws://{http_url}")
    }
}
