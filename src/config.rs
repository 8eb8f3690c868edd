use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub llm: LLMConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Unset only when running fully in memory (`dev`)
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .context("DATABASE_URL must be set")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub url: String,
    pub name: String,
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
    pub wait_time_secs: u64,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Run the stateless batch consumer instead of the continuous worker
    pub use_batch_consumer: bool,
    pub batch_size: usize,
    pub abort_grace_secs: u64,
    pub job_timeout_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LLMConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl LLMConfig {
    pub fn active_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("invalid value for {}", key))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: parse_var("PORT", "3000")?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
                max_connections: parse_var("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_var("DB_MIN_CONNECTIONS", "1")?,
            },
            queue: QueueConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                name: env::var("QUEUE_NAME").unwrap_or_else(|_| "agent-jobs".to_string()),
                visibility_timeout_secs: parse_var("QUEUE_VISIBILITY_TIMEOUT_SECS", "300")?,
                max_receive_count: parse_var("QUEUE_MAX_RECEIVE_COUNT", "5")?,
                wait_time_secs: parse_var("QUEUE_WAIT_TIME_SECS", "20")?,
            },
            worker: WorkerConfig {
                use_batch_consumer: parse_var("USE_BATCH_CONSUMER", "false")?,
                batch_size: parse_var("BATCH_SIZE", "10")?,
                abort_grace_secs: parse_var("WORKER_ABORT_GRACE_SECS", "5")?,
                job_timeout_secs: match env::var("WORKER_JOB_TIMEOUT_SECS") {
                    Ok(v) => Some(v.parse().context("invalid value for WORKER_JOB_TIMEOUT_SECS")?),
                    Err(_) => None,
                },
            },
            llm: LLMConfig {
                api_key: env::var("LLM_API_KEY")
                    .or_else(|_| env::var("OPENAI_API_KEY"))
                    .ok(),
                base_url: env::var("LLM_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                max_tokens: parse_var("LLM_MAX_TOKENS", "2048")?,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
                cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                min_connections: 1,
            },
            queue: QueueConfig {
                url: "redis://localhost:6379".to_string(),
                name: "agent-jobs".to_string(),
                visibility_timeout_secs: 300,
                max_receive_count: 5,
                wait_time_secs: 20,
            },
            worker: WorkerConfig {
                use_batch_consumer: false,
                batch_size: 10,
                abort_grace_secs: 5,
                job_timeout_secs: None,
            },
            llm: LLMConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                max_tokens: 2048,
            },
        }
    }
}
