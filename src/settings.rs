use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::persist::PersistenceMode;

pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file, an in-memory database is used when absent
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    /// used when RUST_LOG is not set
    pub log_filter: String,
    /// JSON file with data defined traits
    #[serde(default)]
    pub trait_catalog: Option<String>,
    /// recorded on changesets written by this process
    pub user: String,
}

impl Settings {
    /// Precedence: environment (`STRATA__...`) > config file > defaults. A
    /// missing config file is not an error.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("log_filter", "info")?
            .set_default("user", "system")?;

        let file = config_file.unwrap_or(DEFAULT_CONFIG_FILE);
        let path = Path::new(file);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let settings = builder
            .add_source(config::Environment::with_prefix("STRATA").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
}
