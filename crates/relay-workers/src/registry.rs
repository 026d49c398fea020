use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use relay_core::{NewSourceChannel, NewTargetChannel};
use relay_storage::Store;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

/// Channel registry seed file: the channels to monitor, where to publish, and
/// initial settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelRegistry {
    #[serde(default)]
    pub sources: Vec<NewSourceChannel>,
    #[serde(default)]
    pub targets: Vec<NewTargetChannel>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub sources: usize,
    pub targets: usize,
    pub settings: usize,
}

impl ChannelRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing channel registry")
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Upsert every entry. Source cursors and post routing are left untouched.
    pub async fn apply(&self, store: &Store) -> Result<SeedSummary> {
        for source in &self.sources {
            store
                .upsert_source_channel(source)
                .await
                .with_context(|| format!("seeding source channel {}", source.address))?;
        }
        for target in &self.targets {
            store
                .upsert_target_channel(target)
                .await
                .with_context(|| format!("seeding target channel {}", target.address))?;
        }
        for (key, value) in &self.settings {
            store
                .upsert_setting(key, value, None)
                .await
                .with_context(|| format!("seeding setting {key}"))?;
        }
        let summary = SeedSummary {
            sources: self.sources.len(),
            targets: self.targets.len(),
            settings: self.settings.len(),
        };
        info!(?summary, "channel registry applied");
        Ok(summary)
    }
}
