use crate::logging::{file_output, parse_level, LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up by [`BridgeConfig::discover`]
pub const CONFIG_FILE: &str = ".pybridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Explicit interpreter library; tried before any candidate
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Extra library names or paths, tried in order
    #[serde(default)]
    pub candidates: Vec<String>,

    /// Interpreter versions for the platform search list; empty means the defaults
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Passed to `Py_InitializeEx`
    #[serde(default = "default_false")]
    pub install_signal_handlers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            install_signal_handlers: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
        }
    }
}

fn default_false() -> bool { false }
fn default_level() -> String { "info".to_string() }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content)
            .map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Find and load `.pybridge.toml` from the current directory or its parents
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            if let Some(config) = Self::load_from_dir(&dir) {
                return config.with_env();
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default().with_env()
    }

    fn load_from_dir(dir: &Path) -> Option<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return None;
        }
        Self::load(&path).ok()
    }

    /// Apply environment overrides on top of file values
    pub fn with_env(mut self) -> Self {
        if let Ok(path) = std::env::var(crate::ffi::library::LIBRARY_ENV) {
            if !path.trim().is_empty() {
                self.library.path = Some(PathBuf::from(path));
            }
        }
        if let Ok(level) = std::env::var("PYBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(file) = std::env::var("PYBRIDGE_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file));
        }
        if std::env::var("PYBRIDGE_LOG_JSON").is_ok() {
            self.logging.json = true;
        }
        self
    }

    /// Logging settings in the form `init_logging` takes
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if let Some(level) = parse_level(&self.logging.level) {
            config.level = level;
        }
        if self.logging.json {
            config.format = LogFormat::Json;
        }
        if let Some(file) = &self.logging.file {
            config.output = file_output(file.clone());
        }
        config
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .map_err(|e| format!("Failed to write config: {}", e))
    }
}
