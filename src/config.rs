use std::{env, net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::classification::{FallbackPolicy, LabelThresholds, LexiconStrategy, ModelStrategy};
use crate::util::retry::RetryConfig;

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

const KNOWN_STRATEGIES: [&str; 2] = [LexiconStrategy::NAME, ModelStrategy::NAME];

/// 取り込み元の設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSettings {
    /// `{base_url}/v1/search` を叩く HTTP 検索エンドポイント。
    Http { base_url: String },
    /// 1 行 1 JSON のファイル。
    JsonLines { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    db_dsn: String,
    http_bind: SocketAddr,
    source: SourceSettings,
    query: String,
    max_items: NonZeroUsize,
    strategy: String,
    batch_size: NonZeroUsize,
    classify_concurrency: NonZeroUsize,
    fetch_timeout: Duration,
    model_load_timeout: Duration,
    model_weights_path: Option<PathBuf>,
    fallback_policy: FallbackPolicy,
    thresholds: LabelThresholds,
    store_retry: RetryConfig,
    source_retry: RetryConfig,
    db_max_connections: u32,
    db_acquire_timeout: Duration,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// CLI やリクエストから渡される実行単位の上書き値。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub query: Option<String>,
    pub max_items: Option<usize>,
    pub strategy: Option<String>,
}

impl Config {
    /// 環境変数から設定を読み込み、検証する。
    ///
    /// # Errors
    /// 必須の環境変数が未設定、もしくは値のパース・検証に失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(&ConfigOverrides::default())
    }

    /// 環境変数を読み込んだうえで `overrides` を適用し、まとめて検証する。
    ///
    /// 上書き値がある項目は環境変数が未設定でもエラーにしない。
    ///
    /// # Errors
    /// [`Config::from_env`] と同じ。
    pub fn from_env_with(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let db_dsn = parse_dsn("SENTIMENT_DB_DSN")?;
        let http_bind = parse_socket_addr("SENTIMENT_WORKER_HTTP_BIND", "0.0.0.0:9010")?;
        let source = parse_source()?;

        let query = match &overrides.query {
            Some(query) => query.clone(),
            None => env_var("SENTIMENT_QUERY")?,
        };
        let max_items = match overrides.max_items {
            Some(value) => non_zero("SENTIMENT_MAX_ITEMS", value)?,
            None => parse_non_zero_usize("SENTIMENT_MAX_ITEMS", 500)?,
        };
        let strategy = overrides.strategy.clone().unwrap_or_else(|| {
            env::var("SENTIMENT_STRATEGY").unwrap_or_else(|_| LexiconStrategy::NAME.to_string())
        });

        let batch_size = parse_non_zero_usize("SENTIMENT_BATCH_SIZE", 100)?;
        let classify_concurrency = parse_non_zero_usize("SENTIMENT_CLASSIFY_CONCURRENCY", 4)?;

        // Timeouts
        let fetch_timeout = parse_duration_ms("SENTIMENT_FETCH_TIMEOUT_MS", 30_000)?;
        let model_load_timeout = parse_duration_ms("SENTIMENT_MODEL_LOAD_TIMEOUT_MS", 30_000)?;

        // Classification
        let model_weights_path = env::var("SENTIMENT_MODEL_WEIGHTS").ok().map(PathBuf::from);
        let fallback_policy = parse_fallback_policy("MODEL_FALLBACK_POLICY")?;
        let thresholds = parse_thresholds()?;

        // Retry settings (exponential backoff + jitter)
        let store_retry = RetryConfig::new(
            parse_non_zero_usize("STORE_MAX_RETRIES", 3)?.get(),
            parse_u64("STORE_BACKOFF_BASE_MS", 100)?,
            parse_u64("STORE_BACKOFF_CAP_MS", 2_000)?,
        );
        let source_retry = RetryConfig::new(
            parse_non_zero_usize("SOURCE_MAX_RETRIES", 3)?.get(),
            parse_u64("SOURCE_BACKOFF_BASE_MS", 250)?,
            parse_u64("SOURCE_BACKOFF_CAP_MS", 10_000)?,
        );

        // Database pool
        let db_max_connections = parse_u32("SENTIMENT_DB_MAX_CONNECTIONS", 10)?;
        let db_acquire_timeout = parse_duration_secs("SENTIMENT_DB_ACQUIRE_TIMEOUT_SECS", 30)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_ENDPOINT").ok();
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        let config = Self {
            db_dsn,
            http_bind,
            source,
            query,
            max_items,
            strategy,
            batch_size,
            classify_concurrency,
            fetch_timeout,
            model_load_timeout,
            model_weights_path,
            fallback_policy,
            thresholds,
            store_retry,
            source_retry,
            db_max_connections,
            db_acquire_timeout,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        };
        config.validate()?;
        Ok(config)
    }

    /// 実行単位の上書きを適用した新しい設定を返す。
    ///
    /// # Errors
    /// 上書き後の値が不正な場合。
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = self.clone();
        if let Some(query) = &overrides.query {
            config.query.clone_from(query);
        }
        if let Some(max_items) = overrides.max_items {
            config.max_items = non_zero("SENTIMENT_MAX_ITEMS", max_items)?;
        }
        if let Some(strategy) = &overrides.strategy {
            config.strategy.clone_from(strategy);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.query.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "SENTIMENT_QUERY",
                source: anyhow::anyhow!("query must not be empty"),
            });
        }
        if !KNOWN_STRATEGIES.contains(&self.strategy.as_str()) {
            return Err(ConfigError::Invalid {
                name: "SENTIMENT_STRATEGY",
                source: anyhow::anyhow!(
                    "unknown strategy {:?}, expected one of {}",
                    self.strategy,
                    KNOWN_STRATEGIES.join(", ")
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.otel_sampling_ratio) {
            return Err(ConfigError::Invalid {
                name: "OTEL_SAMPLING_RATIO",
                source: anyhow::anyhow!("value must be between 0.0 and 1.0"),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn db_dsn(&self) -> &str {
        &self.db_dsn
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn source(&self) -> &SourceSettings {
        &self.source
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn max_items(&self) -> NonZeroUsize {
        self.max_items
    }

    #[must_use]
    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    #[must_use]
    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    #[must_use]
    pub fn classify_concurrency(&self) -> NonZeroUsize {
        self.classify_concurrency
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    #[must_use]
    pub fn model_load_timeout(&self) -> Duration {
        self.model_load_timeout
    }

    #[must_use]
    pub fn model_weights_path(&self) -> Option<&std::path::Path> {
        self.model_weights_path.as_deref()
    }

    #[must_use]
    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback_policy
    }

    #[must_use]
    pub fn thresholds(&self) -> LabelThresholds {
        self.thresholds
    }

    #[must_use]
    pub fn store_retry(&self) -> RetryConfig {
        self.store_retry
    }

    #[must_use]
    pub fn source_retry(&self) -> RetryConfig {
        self.source_retry
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_dsn(name: &'static str) -> Result<String, ConfigError> {
    let raw = env_var(name)?;
    let supported = ["postgres://", "postgresql://", "memory://"];
    if supported.iter().any(|scheme| raw.starts_with(scheme)) {
        Ok(raw)
    } else {
        Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("unsupported DSN scheme, expected postgres:// or memory://"),
        })
    }
}

fn parse_source() -> Result<SourceSettings, ConfigError> {
    let kind = env::var("SENTIMENT_SOURCE").unwrap_or_else(|_| "http".to_string());
    match kind.trim().to_lowercase().as_str() {
        "http" => Ok(SourceSettings::Http {
            base_url: env_var("SENTIMENT_SOURCE_URL")?,
        }),
        "jsonl" => Ok(SourceSettings::JsonLines {
            path: PathBuf::from(env_var("SENTIMENT_SOURCE_PATH")?),
        }),
        other => Err(ConfigError::Invalid {
            name: "SENTIMENT_SOURCE",
            source: anyhow::anyhow!("unknown source kind {other:?}, expected http or jsonl"),
        }),
    }
}

fn parse_thresholds() -> Result<LabelThresholds, ConfigError> {
    let positive = parse_f64("SENTIMENT_POSITIVE_THRESHOLD", 0.05)?;
    let negative = parse_f64("SENTIMENT_NEGATIVE_THRESHOLD", -0.05)?;
    LabelThresholds::new(positive, negative).map_err(|error| ConfigError::Invalid {
        name: "SENTIMENT_NEGATIVE_THRESHOLD",
        source: anyhow::Error::new(error),
    })
}

fn parse_fallback_policy(name: &'static str) -> Result<FallbackPolicy, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| "lexicon".to_string());
    raw.parse().map_err(|error: String| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!(error),
    })
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn non_zero(name: &'static str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    non_zero(name, parsed)
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let ms = parse_u64(name, default_ms)?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("timeout must be greater than zero"),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}
