use sqlx::postgres::PgPoolOptions;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;

use crate::agents::{HttpTopicGrouper, OllamaTransform, Prompts, SurveyPipeline};
use crate::storage::{AppState, PgSurveyStore};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub host: String,
    pub port: u16,
    pub ai: AiConfig,
    pub grouping: GroupingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub url: String,
    pub text_model: String,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct GroupingConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub emit_sources: bool,
    pub prompts: Prompts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            emit_sources: false,
            prompts: Prompts::default(),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {}: {}", name, e).into()),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", 10)?,
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 3000)?,
            ai: AiConfig::from_env()?,
            grouping: GroupingConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

impl AiConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            url: env_or("OLLAMA_URL", "http://127.0.0.1:11434"),
            text_model: env_or("TEXT_MODEL", "qwen2.5"),
            temperature: env_parse("AI_TEMPERATURE", 0.0)?,
        })
    }
}

impl GroupingConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            base_url: env_or("GROUPING_URL", "http://127.0.0.1:8000"),
            timeout_secs: env_parse("GROUPING_TIMEOUT_SECS", 120)?,
        })
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            channel_capacity: env_parse("PIPELINE_CHANNEL_CAPACITY", 100)?,
            emit_sources: env_parse("EMIT_GROUPED_SOURCES", false)?,
            prompts: Prompts::from_env()?,
        })
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    // Database
    log::info!("📊 Connecting to PostgreSQL...");
    let db = setup_database(&config).await?;
    log::info!("✅ PostgreSQL connected");
    let store = Arc::new(PgSurveyStore::new(db));

    // Stage backends
    let transform = Arc::new(OllamaTransform::new(&config.ai)?);
    log::info!("🤖 Ollama: {} ({})", config.ai.url, config.ai.text_model);

    let grouper = Arc::new(HttpTopicGrouper::new(&config.grouping)?);
    log::info!("🗂️  Grouping service: {}", config.grouping.base_url);

    let pipeline = Arc::new(SurveyPipeline::new(
        transform,
        grouper,
        config.pipeline.clone(),
    ));
    log::info!(
        "✅ Pipeline ready (channel capacity {}, sources {})",
        config.pipeline.channel_capacity,
        if config.pipeline.emit_sources { "on" } else { "off" }
    );

    let state = Arc::new(AppState { store, pipeline });
    Ok((config, state))
}

// ============================================================================
// Setup Functions
// ============================================================================

async fn setup_database(config: &Config) -> Result<sqlx::PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
}
