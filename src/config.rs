//! Layered TOML configuration.
//!
//! Built-in defaults are overridden by `portal-screencast.toml` in the
//! working directory, then by the file named in `PORTAL_SCREENCAST_CONFIG`.

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::{info, warn};

use crate::portal::NegotiationOptions;

/// Config file looked up in the working directory.
pub const CONFIG_FILE: &str = "portal-screencast.toml";
/// Environment variable naming an extra config file.
pub const CONFIG_ENV: &str = "PORTAL_SCREENCAST_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Window identifier passed to `Start` (e.g. `x11:1a2b3c`).
    pub parent_window: String,
    /// Cursor mode requested in `SelectSources`; the portal default if unset.
    pub cursor_mode: Option<u32>,
    /// Ask for a PipeWire remote fd after the session started.
    pub open_pipewire_remote: bool,
    pub pipeline: PipelineConfig,
}

/// Command launched with the negotiated stream.
///
/// `{node_id}` and `{fd}` in `args` are replaced before spawning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parent_window: String::new(),
            cursor_mode: None,
            open_pipewire_remote: true,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "gst-launch-1.0".to_string(),
            args: [
                "pipewiresrc",
                "fd={fd}",
                "path={node_id}",
                "!",
                "videoconvert",
                "!",
                "autovideosink",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Config {
    /// Loads the configuration from the default locations.
    pub fn load() -> Self {
        let mut layers = Vec::new();

        if let Ok(content) = std::fs::read_to_string(CONFIG_FILE) {
            layers.push((CONFIG_FILE.to_string(), content));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            match std::fs::read_to_string(&path) {
                Ok(content) => layers.push((path, content)),
                Err(err) => warn!("Failed to read {path}: {err}"),
            }
        }

        Self::from_layers(layers)
    }

    /// Merges `(name, toml)` layers over the defaults, later layers winning.
    pub fn from_layers<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(value) => value,
            Err(err) => {
                warn!("Cannot serialize default config: {err}");
                return Self::default();
            }
        };

        for (name, content) in layers {
            match content.parse::<toml::Value>() {
                Ok(value) => {
                    info!("Loaded config overrides from {name}");
                    merge_value(&mut merged, value);
                }
                Err(err) => warn!("Failed to parse {name}: {err}"),
            }
        }

        merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        })
    }

    pub fn negotiation_options(&self) -> NegotiationOptions {
        NegotiationOptions {
            parent_window: self.parent_window.clone(),
            cursor_mode: self.cursor_mode,
        }
    }
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}
