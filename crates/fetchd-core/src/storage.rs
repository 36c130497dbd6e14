//! Data directory layout and engine configuration file

use crate::error::{EngineError, StorageError};
use fetchd_types::EngineConfig;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "downloads.db";

/// Files under the fetchd data directory
#[derive(Clone, Debug)]
pub struct ConfigStore {
    data_dir: PathBuf,
}

impl ConfigStore {
    /// Create the data directory if needed
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(StorageError::from)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Load the config, falling back to defaults when the file is missing.
    ///
    /// Missing fields take their default value; a file that is not valid JSON
    /// is an error rather than being silently replaced.
    pub async fn load(&self) -> Result<EngineConfig, EngineError> {
        let path = self.config_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(EngineConfig::default());
            }
            Err(e) => return Err(StorageError::from(e).into()),
        };

        let config: EngineConfig = serde_json::from_str(&content).map_err(StorageError::from)?;
        if config.max_concurrent == 0 {
            warn!("max_concurrent is 0 in {}, using 1", path.display());
            return Ok(EngineConfig {
                max_concurrent: 1,
                ..config
            });
        }
        Ok(config)
    }

    pub async fn save(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(config).map_err(StorageError::from)?;
        // Write then rename so a crash never leaves half a file
        let tmp = self.data_dir.join(format!("{}.tmp", CONFIG_FILE));
        fs::write(&tmp, content).await.map_err(StorageError::from)?;
        fs::rename(&tmp, self.config_path())
            .await
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Restore defaults on disk and return them
    pub async fn reset(&self) -> Result<EngineConfig, EngineError> {
        let config = EngineConfig::default();
        self.save(&config).await?;
        Ok(config)
    }
}
