use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Output bundle surfaced to the operator after a successful create flow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsRecord {
    pub bot_name: String,
    pub resource_group: String,
    pub endpoint: String,
    pub app_id: String,
    pub app_secret: String,
    pub tenant_id: String,
    pub subscription_id: String,
}

impl CredentialsRecord {
    /// File name the record is persisted under: `<bot-name>-credentials.json`.
    pub fn file_name(bot_name: &str) -> String {
        format!("{bot_name}-credentials.json")
    }

    /// Write the record as pretty JSON into `dir`, returning the full path.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name(&self.bot_name));
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize credentials")?;
        fs::write(&path, payload)
            .with_context(|| format!("failed to write credentials to {}", path.display()))?;
        Ok(path)
    }
}
