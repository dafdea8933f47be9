//! Host configuration read from `foreman.toml`.

use foreman_agent::{CommandPolicy, CoordinatorConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "foreman.toml";

/// Every table is optional; missing keys keep the library defaults.
///
/// ```toml
/// [session]
/// max_steps = 40
/// quality_threshold = 85
///
/// [commands]
/// allowed = [{ prefix = "cargo test" }, { prefix = "make", shell = true }]
///
/// [coordinator]
/// max_parallel = 2
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub session: SessionConfig,
    pub commands: CommandPolicy,
    pub coordinator: CoordinatorConfig,
}

impl FileConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.session.validate().map_err(|error| error.to_string())?;
        self.commands.validate().map_err(|error| error.to_string())?;
        self.coordinator
            .validate()
            .map_err(|error| error.to_string())
    }
}

/// An explicit path must exist. Without one, `foreman.toml` in the working
/// directory is used when present.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig, String> {
    let path = match explicit {
        Some(path) => path,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(FileConfig::default());
            }
            fallback
        }
    };

    debug!(path = %path.display(), "loading config");
    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("failed reading config '{}': {error}", path.display()))?;
    parse(&raw).map_err(|error| format!("invalid config '{}': {error}", path.display()))
}

pub fn parse(raw: &str) -> Result<FileConfig, String> {
    let config: FileConfig = toml::from_str(raw).map_err(|error| error.to_string())?;
    config.validate()?;
    Ok(config)
}
