//! Exported cell configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::admin::OutputFormat;
use crate::error::{BootstrapError, BootstrapResult};

/// A coordination/master node as listed in the cell configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub idx: u32,
    pub hostname: String,
    #[serde(rename = "zk-client-port", default)]
    pub zk_client_port: Option<u16>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Cell configuration document as printed by the orchestration tool.
/// Keys this crate does not interpret are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    #[serde(default)]
    pub cell: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub masters: Vec<MasterEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CellConfig {
    /// Parse a document in the given format.
    pub fn parse(raw: &str, format: OutputFormat) -> BootstrapResult<Self> {
        let parsed = match format {
            OutputFormat::Yaml => serde_yaml::from_str::<Self>(raw).map_err(|e| e.to_string()),
            OutputFormat::Json => serde_json::from_str::<Self>(raw).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| {
            BootstrapError::Io(format!(
                "cell configuration is not valid {}: {}",
                format.as_str(),
                e
            ))
        })
    }

    /// Read and parse a previously exported file.
    pub fn load(path: &Path, format: OutputFormat) -> BootstrapResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BootstrapError::Io(format!("reading `{}`: {}", path.display(), e)))?;
        Self::parse(&raw, format)
    }
}

/// Validate the tool's output and write it verbatim to `path`, replacing any
/// previous export atomically.
pub fn write_export(raw: &str, format: OutputFormat, path: &Path) -> BootstrapResult<CellConfig> {
    let config = CellConfig::parse(raw, format)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| BootstrapError::config(format!("`{}` is not a file path", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)
    })();
    result.map_err(|e| BootstrapError::Io(format!("writing `{}`: {}", path.display(), e)))?;

    info!(
        path = %path.display(),
        format = format.as_str(),
        masters = config.masters.len(),
        "Exported cell configuration"
    );
    Ok(config)
}
