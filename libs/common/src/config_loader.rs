//! Configuration loading helper functions
//!
//! Layers a typed configuration from serialized defaults, an optional file
//! (format chosen by extension) and prefixed environment variables.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::error::{CommonError, Result};

/// Build the figment provider for a file based on its extension
fn file_figment(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CommonError::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(CommonError::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load configuration with priority: ENV > file > defaults
///
/// # Arguments
/// * `defaults` - Fully populated default value
/// * `path` - Optional config file; a missing path is an error, an absent one is not
/// * `env_prefix` - Environment prefix such as `MODMASTER_`; nested keys use `__`
pub fn load_layered<T, P>(defaults: &T, path: Option<P>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    P: AsRef<Path>,
{
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = path {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CommonError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        info!("Loading configuration from {}", path.display());
        figment = figment.merge(file_figment(path)?);
    }

    debug!("Applying environment overrides with prefix {}", env_prefix);
    figment
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()
        .map_err(|e| CommonError::Config(format!("Failed to load configuration: {}", e)))
}

/// Save configuration to a file
pub fn save_config_to_file<T, P>(config: &T, path: P) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CommonError::Config("Config file must have an extension".to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = match extension {
        "yaml" | "yml" => serde_yaml::to_string(config)
            .map_err(|e| CommonError::Serialization(e.to_string()))?,
        "json" => serde_json::to_string_pretty(config)
            .map_err(|e| CommonError::Serialization(e.to_string()))?,
        _ => {
            return Err(CommonError::Config(format!(
                "Unsupported config file format for saving: {}",
                extension
            )))
        },
    };

    std::fs::write(path, content)?;
    Ok(())
}
