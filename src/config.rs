//! Configuration management for the rankings engine
//!
//! Strongly-typed configuration read from environment variables, with
//! validation and sensible defaults. Scoring weights live in their own
//! TOML file, see [`crate::ranking::weights::FileWeightSource`].
//!
//! # Example
//! ```no_run
//! use market_rankings::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Cache TTL: {:?}", config.ranking.cache_ttl);
//! ```

use crate::error::{Error, Result};
use crate::ranking::orchestrator::{CategoryScoring, EngineSettings, DEFAULT_FETCH_CONCURRENCY};
use crate::ranking::types::TimeWindow;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Kafka sale event consumer
    pub kafka: KafkaConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Ranking engine configuration
    pub ranking: RankingConfig,
}

/// Kafka consumer configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Topic carrying completed sales
    pub sales_topic: String,
    /// Where to start when the group has no committed offset
    pub auto_offset_reset: String,
    pub session_timeout: Duration,
    /// Whether Kafka is enabled
    pub enabled: bool,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Enable statement caching
    pub statement_cache_size: usize,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Requests served at once before callers queue
    pub max_concurrent_requests: usize,
    /// Enable CORS
    pub cors_enabled: bool,
}

/// Ranking engine configuration
#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Lifetime of a cached ranking page
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Upper bound of the rating scale used to normalize ratings
    pub rating_scale: f64,
    /// Period of the full pass over every window
    pub daily_interval: Duration,
    /// Period of the trending pass
    pub trending_interval: Duration,
    pub trending_windows: Vec<TimeWindow>,
    /// Delay between a sale and the recompute it triggers
    pub deferred_recompute_delay: Duration,
    /// Random extra delay added to the deferred recompute
    pub deferred_jitter: Duration,
    pub category_scoring: CategoryScoring,
    /// TOML file with scoring weights, re-read before each scheduled pass
    pub weights_file: Option<PathBuf>,
    pub max_page_size: usize,
    /// Concurrent metric fetches per pass
    pub fetch_concurrency: usize,
    /// Run a full pass right after startup
    pub run_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Prefer loading env from a directory of files (FFOLDER) for platforms that mount secrets as files.
        // Each file name is the env var name and its contents is the value.
        if let Ok(folder) = std::env::var("FFOLDER") {
            load_env_folder(&folder);
        } else {
            // Try to load .env file (ignore if not found)
            dotenvy::dotenv().ok();
        }

        let config = Self {
            kafka: KafkaConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            api: ApiConfig::from_env()?,
            ranking: RankingConfig::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.database.max_connections < self.database.min_connections {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: "max_connections must be >= min_connections".into(),
            });
        }

        self.ranking.validate()
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Database:");
        info!("    URL: {}", mask_url(&self.database.url));
        info!(
            "    Pool Size: {}-{}",
            self.database.min_connections, self.database.max_connections
        );
        info!("  API:");
        info!("    Listening on: {}:{}", self.api.host, self.api.port);
        info!("  Kafka:");
        info!("    Enabled: {}", self.kafka.enabled);
        if self.kafka.enabled {
            info!("    Brokers: {}", self.kafka.brokers);
            info!("    Sales topic: {}", self.kafka.sales_topic);
        }
        info!("  Rankings:");
        info!("    Cache TTL: {:?}", self.ranking.cache_ttl);
        info!(
            "    Daily pass every {:?}, trending pass every {:?} over {:?}",
            self.ranking.daily_interval, self.ranking.trending_interval, self.ranking.trending_windows
        );
        info!("    Category scoring: {:?}", self.ranking.category_scoring);
        if let Some(path) = &self.ranking.weights_file {
            info!("    Weights file: {}", path.display());
        }
    }
}

impl KafkaConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            brokers: get_env_or("KAFKA_BROKERS", "kafka:29092"),
            group_id: get_env_or("KAFKA_GROUP_ID", "market-rankings"),
            sales_topic: get_env_or("KAFKA_TOPIC_SALES", "marketplace.sales"),
            auto_offset_reset: get_env_or("KAFKA_AUTO_OFFSET_RESET", "latest"),
            session_timeout: Duration::from_millis(
                get_env_or("KAFKA_SESSION_TIMEOUT_MS", "10000")
                    .parse()
                    .unwrap_or(10000),
            ),
            enabled: get_env_or("KAFKA_ENABLED", "true").parse().unwrap_or(true),
        })
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = get_env("DATABASE_URL").unwrap_or_else(|_| {
            let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
            format!("postgres://{}@localhost/marketplace_dev", user)
        });

        Ok(Self {
            url,
            max_connections: get_env_or("DB_MAX_CONNECTIONS", "20").parse().unwrap_or(20),
            min_connections: get_env_or("DB_MIN_CONNECTIONS", "5").parse().unwrap_or(5),
            connect_timeout: Duration::from_secs(
                get_env_or("DB_CONNECT_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            idle_timeout: Duration::from_secs(
                get_env_or("DB_IDLE_TIMEOUT_SECS", "600")
                    .parse()
                    .unwrap_or(600),
            ),
            max_lifetime: Duration::from_secs(
                get_env_or("DB_MAX_LIFETIME_SECS", "3600")
                    .parse()
                    .unwrap_or(3600),
            ),
            statement_cache_size: get_env_or("DB_STATEMENT_CACHE_SIZE", "100")
                .parse()
                .unwrap_or(100),
        })
    }
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            port: get_env_or("API_PORT", "8080").parse().unwrap_or(8080),
            host: get_env_or("API_HOST", "0.0.0.0"),
            request_timeout: Duration::from_secs(
                get_env_or("API_REQUEST_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            max_concurrent_requests: get_env_or("API_MAX_CONCURRENT_REQUESTS", "512")
                .parse::<usize>()
                .unwrap_or(512)
                .max(1),
            cors_enabled: get_env_or("API_CORS_ENABLED", "true")
                .parse()
                .unwrap_or(true),
        })
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(6 * 60 * 60),
            cache_max_entries: 10_000,
            rating_scale: 5.0,
            daily_interval: Duration::from_secs(24 * 60 * 60),
            trending_interval: Duration::from_secs(7 * 24 * 60 * 60),
            trending_windows: vec![TimeWindow::Week, TimeWindow::Month],
            deferred_recompute_delay: Duration::from_secs(60),
            deferred_jitter: Duration::from_secs(10),
            category_scoring: CategoryScoring::Count,
            weights_file: None,
            max_page_size: 100,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            run_on_start: false,
        }
    }
}

impl RankingConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let category_scoring = match std::env::var("RANKING_CATEGORY_SCORING") {
            Ok(raw) => raw.parse().map_err(|_| Error::InvalidConfig {
                key: "RANKING_CATEGORY_SCORING",
                message: format!("expected 'count' or 'weighted', got '{}'", raw).into(),
            })?,
            Err(_) => defaults.category_scoring,
        };

        let trending_windows = match std::env::var("RANKING_TRENDING_WINDOWS") {
            Ok(raw) => parse_windows(&raw).map_err(|_| Error::InvalidConfig {
                key: "RANKING_TRENDING_WINDOWS",
                message: format!("invalid window list '{}'", raw).into(),
            })?,
            Err(_) => defaults.trending_windows,
        };

        Ok(Self {
            cache_ttl: Duration::from_secs(
                get_env_or("RANKING_CACHE_TTL_SECS", "21600")
                    .parse()
                    .unwrap_or(21600),
            ),
            cache_max_entries: get_env_or("RANKING_CACHE_MAX_ENTRIES", "10000")
                .parse()
                .unwrap_or(defaults.cache_max_entries),
            rating_scale: get_env_or("RANKING_RATING_SCALE", "5.0")
                .parse()
                .unwrap_or(defaults.rating_scale),
            daily_interval: Duration::from_secs(
                get_env_or("RANKING_DAILY_INTERVAL_SECS", "86400")
                    .parse()
                    .unwrap_or(86400),
            ),
            trending_interval: Duration::from_secs(
                get_env_or("RANKING_TRENDING_INTERVAL_SECS", "604800")
                    .parse()
                    .unwrap_or(604800),
            ),
            trending_windows,
            deferred_recompute_delay: Duration::from_millis(
                get_env_or("RANKING_DEFERRED_DELAY_MS", "60000")
                    .parse()
                    .unwrap_or(60000),
            ),
            deferred_jitter: Duration::from_millis(
                get_env_or("RANKING_DEFERRED_JITTER_MS", "10000")
                    .parse()
                    .unwrap_or(10000),
            ),
            category_scoring,
            weights_file: std::env::var("RANKING_WEIGHTS_FILE")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            max_page_size: get_env_or("RANKING_MAX_PAGE_SIZE", "100")
                .parse()
                .unwrap_or(defaults.max_page_size),
            fetch_concurrency: get_env_or("RANKING_FETCH_CONCURRENCY", "16")
                .parse()
                .unwrap_or(defaults.fetch_concurrency),
            run_on_start: get_env_or("RANKING_RUN_ON_START", "false")
                .parse()
                .unwrap_or(false),
        })
    }

    fn validate(&self) -> Result<()> {
        if !self.rating_scale.is_finite() || self.rating_scale <= 0.0 {
            return Err(Error::InvalidConfig {
                key: "RANKING_RATING_SCALE",
                message: "rating scale must be a positive number".into(),
            });
        }
        if self.daily_interval.is_zero() || self.trending_interval.is_zero() {
            return Err(Error::InvalidConfig {
                key: "RANKING_DAILY_INTERVAL_SECS",
                message: "pass intervals must be non-zero".into(),
            });
        }
        if self.max_page_size == 0 {
            return Err(Error::InvalidConfig {
                key: "RANKING_MAX_PAGE_SIZE",
                message: "max page size must be at least 1".into(),
            });
        }
        if self.trending_windows.is_empty() {
            return Err(Error::InvalidConfig {
                key: "RANKING_TRENDING_WINDOWS",
                message: "at least one trending window is required".into(),
            });
        }
        Ok(())
    }

    /// Orchestrator tunables derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            rating_scale: self.rating_scale,
            category_scoring: self.category_scoring,
            fetch_concurrency: self.fetch_concurrency.max(1),
            deferred_delay: self.deferred_recompute_delay,
            deferred_jitter: self.deferred_jitter,
            trending_windows: self.trending_windows.clone(),
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Copy every file of a secrets directory into the environment
fn load_env_folder(folder: &str) {
    let path = std::path::Path::new(folder);
    if !path.is_dir() {
        return;
    }

    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let file = entry.path();
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if !file.is_file() || std::env::var(&name).is_ok() {
                    continue;
                }
                if let Ok(contents) = std::fs::read_to_string(&file) {
                    std::env::set_var(&name, contents.trim());
                }
            }
            log::info!("Loaded configuration from FFOLDER={}", folder);
        }
        Err(err) => log::warn!("Failed to read FFOLDER {}: {}", folder, err),
    }
}

/// Parse a comma-separated list of time windows
fn parse_windows(raw: &str) -> Result<Vec<TimeWindow>> {
    let mut windows = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let window: TimeWindow = part.parse()?;
        if !windows.contains(&window) {
            windows.push(window);
        }
    }
    Ok(windows)
}

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Mask sensitive parts of URL
fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let (before, after) = url.split_at(colon_pos + 1);
            let (_, rest) = after.split_at(at_pos - colon_pos - 1);
            return format!("{}****{}", before, rest);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_windows() {
        assert_eq!(
            parse_windows("week, month,week").unwrap(),
            vec![TimeWindow::Week, TimeWindow::Month]
        );
        assert!(parse_windows("week,fortnight").is_err());
        assert!(parse_windows("").unwrap().is_empty());
    }

    #[test]
    fn test_mask_url_hides_password() {
        assert_eq!(
            mask_url("postgres://rank:secret@db:5432/market"),
            "postgres://rank:****@db:5432/market"
        );
        assert_eq!(mask_url("postgres://db/market"), "postgres://db/market");
    }

    #[test]
    fn test_default_ranking_config_is_valid() {
        let config = RankingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl, Duration::from_secs(21600));

        let settings = config.engine_settings();
        assert_eq!(settings.trending_windows, vec![TimeWindow::Week, TimeWindow::Month]);
        assert_eq!(settings.category_scoring, CategoryScoring::Count);
    }

    #[test]
    fn test_invalid_rating_scale_rejected() {
        let config = RankingConfig {
            rating_scale: 0.0,
            ..RankingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { key: "RANKING_RATING_SCALE", .. })
        ));
    }
}
