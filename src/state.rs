use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::connectors::{Connector, JsonLinesConnector};
use crate::db::MemoryDb;
use crate::delivery::{Delivery, LogDelivery};
use crate::embeddings::{Embedder, HashEmbedder};
use crate::error::PipelineError;
use crate::memory::VectorMemory;
use crate::pipeline::Pipeline;
use crate::types::{Config, SourceConfig};

/// Shared handles for the daemon's tasks.
pub struct AppState {
    pub config: Arc<Config>,
    pub memory: Arc<VectorMemory>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Open the store and wire the pipeline with the local embedder and the
    /// log delivery sink.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        Self::with_capabilities(
            config,
            Arc::new(HashEmbedder::default()),
            Arc::new(LogDelivery),
        )
    }

    pub fn with_capabilities(
        config: Config,
        embedder: Arc<dyn Embedder>,
        delivery: Arc<dyn Delivery>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Configuration)?;
        let config = Arc::new(config);
        let path = db_path(&config)?;
        let memory = Arc::new(VectorMemory::open(path, Arc::clone(&config))?);
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&memory),
            embedder,
            delivery,
            Arc::clone(&config),
        )?);
        Ok(Self {
            config,
            memory,
            pipeline,
        })
    }

    /// Connectors for every enabled source with a file path.
    pub fn connectors(&self) -> Vec<(SourceConfig, Arc<dyn Connector>)> {
        build_connectors(&self.config)
    }
}

pub fn build_connectors(config: &Config) -> Vec<(SourceConfig, Arc<dyn Connector>)> {
    let mut out = Vec::new();
    for source in &config.sources {
        if !source.enabled {
            log::info!("Source {} disabled, skipping", source.id);
            continue;
        }
        let Some(path) = source.path.as_deref() else {
            log::warn!("Source {} has no path, skipping", source.id);
            continue;
        };
        let connector: Arc<dyn Connector> =
            Arc::new(JsonLinesConnector::new(&source.id, expand_home(path)));
        out.push((source.clone(), connector));
    }
    out
}

/// Database location: `dbPath` from config, else `~/.foresight/foresight.db`.
pub fn db_path(config: &Config) -> Result<PathBuf, PipelineError> {
    match config.db_path.as_deref() {
        Some(p) => Ok(expand_home(p)),
        None => Ok(MemoryDb::db_path()?),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".foresight").join("config.json"))
}

/// Load `~/.foresight/config.json`. A missing file means all defaults.
pub fn load_config() -> Result<Config, String> {
    let path = config_path()?;
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    load_config_from(&path)
}

pub fn load_config_from(path: &std::path::Path) -> Result<Config, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
}
