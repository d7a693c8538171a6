//! Runtime configuration.
//!
//! Every knob has a default; environment variables override them. Tuning knobs
//! use the `ANNALIST_` prefix, connection settings keep the conventional names
//! (`DATABASE_PATH`, `OLLAMA_HOST`, `OPENAI_API_KEY`, ...).

use std::time::Duration;
use tracing::warn;

use crate::environment::{get_env_var_millis, get_env_var_opt, get_env_var_or};

/// Topic name matching.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Minimum name similarity for a candidate to resolve to an existing topic.
    pub topic_threshold: f64,
    /// Maximum edit distance accepted for near-identical names.
    pub max_edit_distance: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            topic_threshold: 0.92,
            max_edit_distance: 2,
        }
    }
}

/// Event deduplication policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    pub merge_threshold: f64,
    /// Candidates whose descriptions share less than this are never merged,
    /// whatever their temporal proximity.
    pub text_floor: f64,
    pub text_weight: f64,
    pub time_weight: f64,
    pub temporal_window_days: i64,
    /// Temporal score used when either side has no event time.
    pub unknown_time_score: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.65,
            text_floor: 0.3,
            text_weight: 0.7,
            time_weight: 0.3,
            temporal_window_days: 31,
            unknown_time_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Replaces values that would make the backoff shrink, go negative or
    /// overflow: the multiplier must be finite and at least 1, the jitter a
    /// finite fraction in `[0, 1]`, and `max_backoff` no shorter than
    /// `initial_backoff`.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            warn!("Backoff multiplier {} is out of range, using {}", self.multiplier, defaults.multiplier);
            self.multiplier = defaults.multiplier;
        }
        if !self.jitter.is_finite() {
            warn!("Backoff jitter {} is not finite, using {}", self.jitter, defaults.jitter);
            self.jitter = defaults.jitter;
        } else if !(0.0..=1.0).contains(&self.jitter) {
            let clamped = self.jitter.clamp(0.0, 1.0);
            warn!("Backoff jitter {} is out of range, using {}", self.jitter, clamped);
            self.jitter = clamped;
        }
        if self.max_backoff < self.initial_backoff {
            warn!(
                "Maximum backoff {:?} is below the initial backoff {:?}; raising it",
                self.max_backoff, self.initial_backoff
            );
            self.max_backoff = self.initial_backoff;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub max_concurrent: usize,
    pub call_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            requests_per_day: 1000,
            max_concurrent: 4,
            call_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub batch_concurrency: usize,
    pub min_topic_relevance: f64,
    pub max_topics_per_article: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 4,
            min_topic_relevance: 0.5,
            max_topics_per_article: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LlmBackend {
    Ollama { host: String, port: u16 },
    OpenAI { api_key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_spacing: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_path: String,
    pub llm: LlmSettings,
    pub archive: ArchiveSettings,
    pub matching: MatchConfig,
    pub reconcile: ReconcileConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub ingest: IngestConfig,
}

/// The tuning knobs of the ingestion pipeline, without connection settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub matching: MatchConfig,
    pub reconcile: ReconcileConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub ingest: IngestConfig,
}

impl Settings {
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            matching: self.matching.clone(),
            reconcile: self.reconcile.clone(),
            retry: self.retry.clone(),
            rate_limit: self.rate_limit.clone(),
            ingest: self.ingest.clone(),
        }
    }

    pub fn from_env() -> Self {
        let matching = MatchConfig::default();
        let reconcile = ReconcileConfig::default();
        let retry = RetryConfig::default();
        let rate_limit = RateLimitConfig::default();
        let ingest = IngestConfig::default();

        Self {
            database_path: get_env_var_or("DATABASE_PATH", "annalist.db".to_string()),
            llm: llm_from_env(),
            archive: ArchiveSettings {
                base_url: get_env_var_or(
                    "ARCHIVE_BASE_URL",
                    "https://api.nytimes.com/svc/archive/v1".to_string(),
                ),
                api_key: get_env_var_opt("ARCHIVE_API_KEY"),
                // the archive allows five requests per minute
                request_spacing: get_env_var_millis(
                    "ANNALIST_ARCHIVE_SPACING_MS",
                    Duration::from_secs(12),
                ),
            },
            matching: MatchConfig {
                topic_threshold: get_env_var_or(
                    "ANNALIST_TOPIC_THRESHOLD",
                    matching.topic_threshold,
                ),
                max_edit_distance: get_env_var_or(
                    "ANNALIST_MAX_EDIT_DISTANCE",
                    matching.max_edit_distance,
                ),
            },
            reconcile: ReconcileConfig {
                merge_threshold: get_env_var_or(
                    "ANNALIST_MERGE_THRESHOLD",
                    reconcile.merge_threshold,
                ),
                text_floor: get_env_var_or("ANNALIST_TEXT_FLOOR", reconcile.text_floor),
                text_weight: get_env_var_or("ANNALIST_TEXT_WEIGHT", reconcile.text_weight),
                time_weight: get_env_var_or("ANNALIST_TIME_WEIGHT", reconcile.time_weight),
                temporal_window_days: get_env_var_or(
                    "ANNALIST_TEMPORAL_WINDOW_DAYS",
                    reconcile.temporal_window_days,
                ),
                unknown_time_score: get_env_var_or(
                    "ANNALIST_UNKNOWN_TIME_SCORE",
                    reconcile.unknown_time_score,
                ),
            },
            retry: RetryConfig {
                max_retries: get_env_var_or("ANNALIST_MAX_RETRIES", retry.max_retries),
                initial_backoff: get_env_var_millis(
                    "ANNALIST_INITIAL_BACKOFF_MS",
                    retry.initial_backoff,
                ),
                max_backoff: get_env_var_millis("ANNALIST_MAX_BACKOFF_MS", retry.max_backoff),
                multiplier: get_env_var_or("ANNALIST_BACKOFF_MULTIPLIER", retry.multiplier),
                jitter: get_env_var_or("ANNALIST_BACKOFF_JITTER", retry.jitter),
            }
            .sanitized(),
            rate_limit: RateLimitConfig {
                requests_per_minute: get_env_var_or(
                    "ANNALIST_REQUESTS_PER_MINUTE",
                    rate_limit.requests_per_minute,
                ),
                requests_per_day: get_env_var_or(
                    "ANNALIST_REQUESTS_PER_DAY",
                    rate_limit.requests_per_day,
                ),
                max_concurrent: get_env_var_or(
                    "ANNALIST_MAX_CONCURRENT_CALLS",
                    rate_limit.max_concurrent,
                ),
                call_timeout: get_env_var_millis(
                    "ANNALIST_CALL_TIMEOUT_MS",
                    rate_limit.call_timeout,
                ),
            },
            ingest: IngestConfig {
                batch_concurrency: get_env_var_or(
                    "ANNALIST_BATCH_CONCURRENCY",
                    ingest.batch_concurrency,
                ),
                min_topic_relevance: get_env_var_or(
                    "ANNALIST_MIN_TOPIC_RELEVANCE",
                    ingest.min_topic_relevance,
                ),
                max_topics_per_article: get_env_var_or(
                    "ANNALIST_MAX_TOPICS_PER_ARTICLE",
                    ingest.max_topics_per_article,
                ),
            },
        }
    }
}

fn llm_from_env() -> LlmSettings {
    let backend = match get_env_var_or("LLM_TYPE", "ollama".to_string()).as_str() {
        "openai" => LlmBackend::OpenAI {
            api_key: get_env_var_opt("OPENAI_API_KEY").unwrap_or_default(),
        },
        _ => {
            let (host, port) = parse_host_port(
                &get_env_var_or("OLLAMA_HOST", "http://localhost:11434".to_string()),
            );
            LlmBackend::Ollama { host, port }
        }
    };

    LlmSettings {
        backend,
        model: get_env_var_or("LLM_MODEL", "llama3".to_string()),
        temperature: get_env_var_or("LLM_TEMPERATURE", 0.2_f32),
    }
}

/// Splits `http://host:port` into the scheme-qualified host and port that the
/// Ollama client expects.
pub fn parse_host_port(url: &str) -> (String, u16) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", url),
    };
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((host, port)) => (
            format!("{}://{}", scheme, host),
            port.parse().unwrap_or(11434),
        ),
        None => (format!("{}://{}", scheme, rest), 11434),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("http://gpu-box:11500"),
            ("http://gpu-box".to_string(), 11500)
        );
        assert_eq!(
            parse_host_port("localhost"),
            ("http://localhost".to_string(), 11434)
        );
        assert_eq!(
            parse_host_port("https://ollama.internal/"),
            ("https://ollama.internal".to_string(), 11434)
        );
    }

    #[test]
    fn test_defaults_are_consistent() {
        let reconcile = ReconcileConfig::default();
        assert!((reconcile.text_weight + reconcile.time_weight - 1.0).abs() < 1e-9);
        assert!(reconcile.text_floor < reconcile.merge_threshold);
        assert!(RetryConfig::default().initial_backoff < RetryConfig::default().max_backoff);
        assert_eq!(RetryConfig::default().sanitized(), RetryConfig::default());
    }

    #[test]
    fn test_retry_config_out_of_range_values_replaced() {
        let retry = RetryConfig {
            multiplier: -3.0,
            jitter: 1e300,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..RetryConfig::default()
        }
        .sanitized();
        assert_eq!(retry.multiplier, 2.0);
        assert_eq!(retry.jitter, 1.0);
        assert_eq!(retry.max_backoff, Duration::from_secs(5));

        let retry = RetryConfig {
            multiplier: f64::NAN,
            jitter: f64::INFINITY,
            ..RetryConfig::default()
        }
        .sanitized();
        assert_eq!(retry.multiplier, 2.0);
        assert_eq!(retry.jitter, 0.1);
    }
}
