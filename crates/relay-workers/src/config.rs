use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database_url: String,
    /// Root of the fixture channel source; used when no live source is configured.
    pub source_dir: Option<PathBuf>,
    pub telegram_bot_token: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_base_url: Option<String>,
    pub http_timeout_secs: u64,
    pub log_json: bool,
    pub runtime: RuntimeConfig,
    pub scraper: ScraperConfig,
    pub classifier: ClassifierConfig,
    pub publisher: PublisherConfig,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://relay.db".to_string()),
            source_dir: non_empty_var("RELAY_SOURCE_DIR").map(PathBuf::from),
            telegram_bot_token: non_empty_var("TELEGRAM_BOT_TOKEN"),
            openrouter_api_key: non_empty_var("OPENROUTER_API_KEY"),
            openrouter_model: std::env::var("OPENROUTER_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3-haiku".to_string()),
            openrouter_base_url: non_empty_var("OPENROUTER_BASE_URL"),
            http_timeout_secs: parsed_var("RELAY_HTTP_TIMEOUT_SECS").unwrap_or(30),
            log_json: std::env::var("RELAY_LOG_JSON")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            runtime: RuntimeConfig::from_env(),
            scraper: ScraperConfig::from_env(),
            classifier: ClassifierConfig::from_env(),
            publisher: PublisherConfig::from_env(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

/// Supervisor cadence shared by every worker kind.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// How often the control row is re-read.
    pub control_poll: Duration,
    pub heartbeat: Duration,
    /// Wait after a failed initialization or an unexpected loop exit.
    pub init_backoff: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_poll: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
            init_backoff: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            control_poll: secs_var("RELAY_CONTROL_POLL_SECS").unwrap_or(d.control_poll),
            heartbeat: secs_var("RELAY_HEARTBEAT_SECS").unwrap_or(d.heartbeat),
            init_backoff: secs_var("RELAY_INIT_BACKOFF_SECS").unwrap_or(d.init_backoff),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScraperConfig {
    pub fallback_interval: Duration,
    pub reload_interval: Duration,
    /// Quiet period after the last album member before the album is flushed.
    pub album_delay: Duration,
    pub history_limit: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            fallback_interval: Duration::from_secs(15),
            reload_interval: Duration::from_secs(30),
            album_delay: Duration::from_secs(2),
            history_limit: 50,
        }
    }
}

impl ScraperConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fallback_interval: secs_var("RELAY_SCRAPER_FALLBACK_SECS")
                .unwrap_or(d.fallback_interval),
            reload_interval: secs_var("RELAY_SCRAPER_RELOAD_SECS").unwrap_or(d.reload_interval),
            album_delay: parsed_var::<u64>("RELAY_ALBUM_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.album_delay),
            history_limit: parsed_var("RELAY_HISTORY_LIMIT").unwrap_or(d.history_limit),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 5,
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: secs_var("RELAY_CLASSIFIER_POLL_SECS").unwrap_or(d.poll_interval),
            batch_size: parsed_var("RELAY_CLASSIFIER_BATCH").unwrap_or(d.batch_size),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 5,
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: secs_var("RELAY_PUBLISHER_POLL_SECS").unwrap_or(d.poll_interval),
            batch_size: parsed_var("RELAY_PUBLISHER_BATCH").unwrap_or(d.batch_size),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|v| v.parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name)
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cadence() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.control_poll, Duration::from_secs(5));
        assert_eq!(runtime.heartbeat, Duration::from_secs(30));

        let scraper = ScraperConfig::default();
        assert_eq!(scraper.fallback_interval, Duration::from_secs(15));
        assert_eq!(scraper.album_delay, Duration::from_secs(2));

        assert_eq!(ClassifierConfig::default().batch_size, 5);
        assert_eq!(PublisherConfig::default().poll_interval, Duration::from_secs(15));
    }
}
