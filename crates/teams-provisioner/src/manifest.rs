use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const MANIFEST_SCHEMA: &str =
    "https://developer.microsoft.com/en-us/json-schemas/teams/v1.16/MicrosoftTeams.schema.json";
const MANIFEST_VERSION: &str = "1.16";

/// Sideloadable Teams app manifest. Only the fields the provisioning flow
/// fills in are modeled; everything else stays at schema defaults.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeamsAppManifest {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub manifest_version: String,
    pub version: String,
    pub id: String,
    pub developer: Developer,
    pub name: LocalizedText,
    pub description: LocalizedText,
    pub icons: Icons,
    pub accent_color: String,
    pub bots: Vec<BotDefinition>,
    pub permissions: Vec<String>,
    pub valid_domains: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Developer {
    pub name: String,
    pub website_url: String,
    pub privacy_url: String,
    pub terms_of_use_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalizedText {
    pub short: String,
    pub full: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Icons {
    pub color: String,
    pub outline: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BotDefinition {
    pub bot_id: String,
    pub scopes: Vec<String>,
    pub supports_files: bool,
    pub is_notification_only: bool,
}

impl TeamsAppManifest {
    /// Build a manifest for one bot: the app id doubles as the manifest id
    /// and bot id, and the endpoint's host becomes the allow-listed domain.
    pub fn for_bot(app_id: &str, display_name: &str, endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid endpoint URL")?;
        let domain = endpoint
            .host_str()
            .ok_or_else(|| anyhow!("endpoint URL has no host"))?
            .to_string();
        let site = format!("https://{domain}");
        Ok(Self {
            schema: MANIFEST_SCHEMA.into(),
            manifest_version: MANIFEST_VERSION.into(),
            version: "1.0.0".into(),
            id: app_id.into(),
            developer: Developer {
                name: display_name.into(),
                website_url: site.clone(),
                privacy_url: format!("{site}/privacy"),
                terms_of_use_url: format!("{site}/terms"),
            },
            name: LocalizedText {
                short: display_name.into(),
                full: format!("{display_name} for Microsoft Teams"),
            },
            description: LocalizedText {
                short: format!("{display_name} bot"),
                full: format!("{display_name}, provisioned as a single-tenant Teams bot."),
            },
            icons: Icons {
                color: "color.png".into(),
                outline: "outline.png".into(),
            },
            accent_color: "#FFFFFF".into(),
            bots: vec![BotDefinition {
                bot_id: app_id.into(),
                scopes: vec!["personal".into(), "team".into(), "groupChat".into()],
                supports_files: false,
                is_notification_only: false,
            }],
            permissions: vec!["identity".into(), "messageTeamMembers".into()],
            valid_domains: vec![domain],
        })
    }

    /// Write `manifest.json` plus the two icons into `out_dir`, ready to be
    /// zipped and sideloaded. Returns the staged file paths.
    pub fn stage(
        &self,
        out_dir: &Path,
        color_icon: Option<&Path>,
        outline_icon: Option<&Path>,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        let manifest_path = out_dir.join("manifest.json");
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        fs::write(&manifest_path, payload)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;
        let mut staged = vec![manifest_path];

        for (source, target) in [
            (color_icon, self.icons.color.as_str()),
            (outline_icon, self.icons.outline.as_str()),
        ] {
            if let Some(source) = source {
                let target_path = out_dir.join(target);
                fs::copy(source, &target_path).with_context(|| {
                    format!(
                        "failed to copy icon {} to {}",
                        source.display(),
                        target_path.display()
                    )
                })?;
                staged.push(target_path);
            }
        }
        Ok(staged)
    }
}
