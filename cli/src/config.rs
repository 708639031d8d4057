// Transport parameters for the btmesh CLI
//
// Looked up in:
// - macOS: ~/Library/Application Support/btmesh/parameters.json
// - Linux: ~/.config/btmesh/parameters.json
// - Windows: %APPDATA%\btmesh\parameters.json

use anyhow::{Context, Result};
use btmesh_core::NetworkParameters;
use std::path::{Path, PathBuf};

const PARAMETERS_FILE: &str = "parameters.json";

/// Where the parameters came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Defaults,
}

/// The btmesh config directory (cross-platform).
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("btmesh"))
}

/// Reads and validates a parameters file.
pub fn read_parameters(path: &Path) -> Result<NetworkParameters> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let params: NetworkParameters = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    params
        .validate()
        .with_context(|| format!("Invalid parameters in {}", path.display()))?;
    Ok(params)
}

/// An explicit file must exist. Without one, the default location is used
/// if present, otherwise the built-in defaults.
pub fn load_parameters(explicit: Option<&Path>) -> Result<(NetworkParameters, Source)> {
    if let Some(path) = explicit {
        return Ok((read_parameters(path)?, Source::File(path.to_path_buf())));
    }
    let default = config_dir()?.join(PARAMETERS_FILE);
    if default.exists() {
        Ok((read_parameters(&default)?, Source::File(default)))
    } else {
        Ok((NetworkParameters::default(), Source::Defaults))
    }
}
