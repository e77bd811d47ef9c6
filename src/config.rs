use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GridError, Result};

const CONFIG_DIR_NAME: &str = "agents-grid";
const CONFIG_FILE_NAME: &str = "config.yaml";
const STATE_FILE_NAME: &str = "layout-v1.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub log_level: String,
    pub default_shell: Option<String>,
    pub default_preset: String,
    /// How many stopped sessions stay inspectable before they are forgotten.
    pub retention_capacity: usize,
    pub restart_delay_ms: u64,
    /// Upper bound for every multiplexer subprocess invocation.
    pub subprocess_timeout_ms: u64,
    pub shell_integration: bool,
    pub multiplexer: MultiplexerConfig,
    pub policy: PolicyConfig,
    pub panes: PaneDefaults,
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub enabled: bool,
    pub binary: Option<PathBuf>,
    pub socket_label: String,
    pub search_dirs: Vec<PathBuf>,
    pub kill_on_shutdown: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub allowlist: Vec<String>,
    pub approval_token: Option<String>,
}

/// Template for sessions the layout creates to fill empty panes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaneDefaults {
    pub persistent: bool,
    pub auto_restart: bool,
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_shell: None,
            default_preset: "2x2".to_string(),
            retention_capacity: 128,
            restart_delay_ms: 1500,
            subprocess_timeout_ms: 5000,
            shell_integration: true,
            multiplexer: MultiplexerConfig::default(),
            policy: PolicyConfig::default(),
            panes: PaneDefaults::default(),
            state_path: None,
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            socket_label: "agents-grid".to_string(),
            search_dirs: Vec::new(),
            kill_on_shutdown: false,
        }
    }
}

impl GridConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the per-user config dir when `path` is `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(p) => p,
            None => return Ok(Self::default()),
        };
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(GridError::Config(format!(
                    "read {} failed: {e}",
                    path.display()
                )))
            }
        };
        let config: GridConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if crate::layout::preset(&self.default_preset).is_none() {
            return Err(GridError::Config(format!(
                "unknown default_preset {:?}",
                self.default_preset
            )));
        }
        if self.retention_capacity == 0 {
            return Err(GridError::Config("retention_capacity must be at least 1".to_string()));
        }
        if self.subprocess_timeout_ms == 0 {
            return Err(GridError::Config("subprocess_timeout_ms must be positive".to_string()));
        }
        if self.multiplexer.socket_label.trim().is_empty() {
            return Err(GridError::Config("multiplexer.socket_label is empty".to_string()));
        }
        Ok(())
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_millis(self.subprocess_timeout_ms)
    }

    pub fn resolved_state_path(&self) -> Option<PathBuf> {
        self.state_path.clone().or_else(|| {
            dirs::data_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(STATE_FILE_NAME))
        })
    }
}
