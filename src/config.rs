use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/processor.json";

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("PROCESSOR_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileOverrides {
    #[serde(default)]
    queue: QueueSection,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    data_processing: DataProcessingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSection {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    queue_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    prefetch: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseSection {
    #[serde(default)]
    connection_string: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataProcessingSection {
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    processing_interval_seconds: Option<u64>,
}

fn load_file_overrides() -> Option<FileOverrides> {
    let path = config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "reading-processor failed to read config file; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "reading-processor failed to parse config file; using env defaults"
            );
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|v| v.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_value(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// File values only apply where `env_is_set` reports the matching env var unset.
fn apply_file_overrides(
    config: &mut Config,
    overrides: &FileOverrides,
    env_is_set: impl Fn(&str) -> bool,
) {
    let env_allows = |key: &str| !env_is_set(key);
    let queue = &overrides.queue;

    if env_allows("PROCESSOR_QUEUE_HOST") {
        if let Some(host) = non_blank(queue.host.as_deref()) {
            config.broker.host = host;
        }
    }
    if env_allows("PROCESSOR_QUEUE_PORT") {
        if let Some(port) = queue.port.filter(|v| *v != 0) {
            config.broker.port = port;
        }
    }
    if env_allows("PROCESSOR_QUEUE_NAME") {
        if let Some(name) = non_blank(queue.queue_name.as_deref()) {
            config.broker.queue_name = name;
        }
    }
    if env_allows("PROCESSOR_QUEUE_USERNAME") {
        if let Some(username) = non_blank(queue.username.as_deref()) {
            config.broker.username = username;
        }
    }
    if env_allows("PROCESSOR_QUEUE_PASSWORD") {
        if let Some(password) = queue.password.as_deref() {
            config.broker.password = password.to_string();
        }
    }

    let mut batch_overridden = false;
    if env_allows("PROCESSOR_BATCH_SIZE") {
        if let Some(value) = overrides.data_processing.batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("PROCESSOR_FLUSH_INTERVAL_MS") {
        if let Some(seconds) = overrides
            .data_processing
            .processing_interval_seconds
            .filter(|v| *v != 0)
        {
            config.flush_interval_ms = seconds.saturating_mul(1000);
        }
    }

    if env_allows("PROCESSOR_QUEUE_PREFETCH") {
        if let Some(value) = queue.prefetch.filter(|v| *v != 0) {
            config.broker.prefetch = value;
        } else if batch_overridden {
            config.broker.prefetch = default_prefetch(config.batch_size);
        }
    }
    if env_allows("PROCESSOR_MAX_QUEUE") && batch_overridden {
        config.max_queue = config.batch_size.saturating_mul(10);
    }
}

fn default_prefetch(batch_size: usize) -> u16 {
    u16::try_from(batch_size.saturating_mul(2)).unwrap_or(u16::MAX)
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub amqp_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub queue_name: String,
    pub prefetch: u16,
    pub consumer_tag: String,
}

impl BrokerConfig {
    pub fn amqp_uri(&self) -> String {
        if let Some(url) = &self.amqp_url {
            return url.clone();
        }
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub auto_migrate: bool,
    pub broker: BrokerConfig,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub max_inflight_flushes: usize,
    pub grpc_socket_path: String,
    pub status_poll_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let file_overrides = load_file_overrides();

        let database_url = env_value("PROCESSOR_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                file_overrides
                    .as_ref()
                    .and_then(|ov| non_blank(ov.database.connection_string.as_deref()))
            })
            .context("PROCESSOR_DATABASE_URL or DATABASE_URL is required (or database.connectionString in the config file)")?;
        let database_url = normalize_database_url(database_url);

        let batch_size = env_parse::<usize>("PROCESSOR_BATCH_SIZE").unwrap_or(10);
        let flush_interval_ms = env_parse::<u64>("PROCESSOR_FLUSH_INTERVAL_MS").unwrap_or(5000);
        let max_queue = env_parse::<usize>("PROCESSOR_MAX_QUEUE")
            .unwrap_or(batch_size.saturating_mul(10));
        let max_inflight_flushes =
            env_parse::<usize>("PROCESSOR_MAX_INFLIGHT_FLUSHES").unwrap_or(1);
        let db_pool_size = env_parse::<u32>("PROCESSOR_DB_POOL_SIZE").unwrap_or(10);
        let auto_migrate = env_flag("PROCESSOR_AUTO_MIGRATE").unwrap_or(true);

        let broker = BrokerConfig {
            amqp_url: env_value("PROCESSOR_AMQP_URL"),
            host: env_value("PROCESSOR_QUEUE_HOST").unwrap_or_else(|| "rabbitmq".to_string()),
            port: env_parse::<u16>("PROCESSOR_QUEUE_PORT").unwrap_or(5672),
            username: env_value("PROCESSOR_QUEUE_USERNAME").unwrap_or_else(|| "guest".to_string()),
            password: env::var("PROCESSOR_QUEUE_PASSWORD").unwrap_or_else(|_| "guest".to_string()),
            vhost: env_value("PROCESSOR_QUEUE_VHOST").unwrap_or_else(|| "/".to_string()),
            queue_name: env_value("PROCESSOR_QUEUE_NAME")
                .unwrap_or_else(|| "sensor-data".to_string()),
            prefetch: env_parse::<u16>("PROCESSOR_QUEUE_PREFETCH")
                .unwrap_or_else(|| default_prefetch(batch_size)),
            consumer_tag: env_value("PROCESSOR_CONSUMER_TAG")
                .unwrap_or_else(|| format!("reading-processor-{}", std::process::id())),
        };

        let grpc_socket_path = env_value("PROCESSOR_GRPC_SOCKET")
            .unwrap_or_else(|| "/tmp/reading_processor.sock".to_string());
        let status_poll_interval_ms =
            env_parse::<u64>("PROCESSOR_STATUS_POLL_INTERVAL_MS").unwrap_or(5000);
        let otlp_endpoint = env_value("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            database_url,
            db_pool_size,
            auto_migrate,
            broker,
            batch_size,
            flush_interval_ms,
            max_queue,
            max_inflight_flushes,
            grpc_socket_path,
            status_poll_interval_ms,
            otlp_endpoint,
        };

        if let Some(overrides) = file_overrides.as_ref() {
            apply_file_overrides(&mut config, overrides, |key| env_value(key).is_some());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch size must be > 0");
        anyhow::ensure!(self.flush_interval_ms > 0, "flush interval must be > 0");
        anyhow::ensure!(self.max_queue > 0, "max queue must be > 0");
        anyhow::ensure!(
            self.max_inflight_flushes > 0,
            "max in-flight flushes must be > 0"
        );
        anyhow::ensure!(
            !self.broker.queue_name.trim().is_empty(),
            "queue name must not be blank"
        );
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
