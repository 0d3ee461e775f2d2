use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub stockpulse: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const STOCKPULSE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            stockpulse: Self::STOCKPULSE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.stockpulse.clone();
        self.stockpulse = self.stockpulse.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.stockpulse.as_str()) {
            eprintln!(
                "Config error: stockpulse log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::STOCKPULSE_LEVEL
            );
            self.stockpulse = Self::STOCKPULSE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseConfig {
    /// Store file. Empty means the default location in the data directory.
    #[serde(default)]
    pub path: String,
}

impl DatabaseConfig {
    const DB_FILE: &str = "stockpulse.db";

    fn ensure_valid(&mut self) {
        self.path = self.path.trim().to_owned();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StockConfig {
    /// Items at or below this many units are reported by `stock low`.
    pub low_threshold: i64,
}

impl StockConfig {
    const LOW_THRESHOLD: i64 = 5;

    fn default() -> Self {
        StockConfig {
            low_threshold: Self::LOW_THRESHOLD,
        }
    }

    fn ensure_valid(&mut self) {
        if self.low_threshold < 0 {
            eprintln!(
                "Config error: stock low_threshold of {} is invalid - using default of {}",
                self.low_threshold,
                Self::LOW_THRESHOLD
            );
            self.low_threshold = Self::LOW_THRESHOLD;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub stock: StockConfig,
}

impl Config {
    const ENV_PREFIX: &str = "STOCKPULSE_";

    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            stock: StockConfig::default(),
        }
    }

    /// Loads the configuration from `config.toml` in the app's data directory.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from(&config_path)
    }

    /// Defaults, then the TOML file, then `STOCKPULSE_` environment variables
    /// (`STOCKPULSE_STOCK__LOW_THRESHOLD=3`).
    fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    pub fn load_from(config_path: &Path) -> Self {
        let mut config: Config = Self::figment(config_path).extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            Self::default()
        });

        config.ensure_valid();

        config
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Self::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    /// The store file: the configured path if set, else `stockpulse.db` in
    /// the data directory.
    pub fn database_path(&self, project_dirs: &ProjectDirs) -> PathBuf {
        if self.database.path.is_empty() {
            project_dirs.data_local_dir().join(DatabaseConfig::DB_FILE)
        } else {
            PathBuf::from(&self.database.path)
        }
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.stock.ensure_valid();
    }
}
