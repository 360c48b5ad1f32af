use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::command::ActionChain;
use crate::config::ScoutConfig;
use crate::explore::{DiscoveredLink, ModalDiscovery, PageElement};
use crate::scoring::{PageScore, PageSignals};
use crate::stability::GoldenPathVerdict;

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("artifact serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub ui_hash: Option<String>,
    pub settled_url: String,
    pub depth: usize,
    pub captured_at: DateTime<Utc>,
    pub run_id: String,
    pub full_discovery: bool,
    pub signals: PageSignals,
}

/// Per-page JSON artifact, the unit downstream generators consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageArtifact {
    pub url: String,
    pub page_title: Option<String>,
    pub elements: Vec<PageElement>,
    pub discovered_links: Vec<DiscoveredLink>,
    pub sidebar_links: Vec<DiscoveredLink>,
    pub modal_discoveries: Vec<ModalDiscovery>,
    pub action_chain: ActionChain,
    pub golden_path: GoldenPathVerdict,
    pub score: PageScore,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    pub metadata: ArtifactMetadata,
}

/// Writes page artifacts and screenshots under the configured output tree.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    pages_dir: PathBuf,
    screenshots_dir: PathBuf,
}

impl ArtifactStore {
    pub fn open(config: &ScoutConfig) -> ArtifactResult<Self> {
        let pages_dir = config.resolve_path(&config.artifacts.output_dir);
        let screenshots_dir = config.resolve_path(&config.artifacts.screenshots_dir);
        for dir in [&pages_dir, &screenshots_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
                source,
                path: dir.clone(),
            })?;
        }
        Ok(Self {
            pages_dir,
            screenshots_dir,
        })
    }

    pub fn save(&self, artifact: &PageArtifact) -> ArtifactResult<PathBuf> {
        let path = self.pages_dir.join(format!("{}.json", url_slug(&artifact.url)));
        let payload = serde_json::to_string_pretty(artifact)?;
        std::fs::write(&path, payload).map_err(|source| ArtifactError::Io {
            source,
            path: path.clone(),
        })?;
        debug!(path = %path.display(), url = %artifact.url, "artifact saved");
        Ok(path)
    }

    pub fn save_screenshot(&self, url: &str, bytes: &[u8]) -> ArtifactResult<PathBuf> {
        let path = self
            .screenshots_dir
            .join(format!("{}.png", url_slug(url)));
        std::fs::write(&path, bytes).map_err(|source| ArtifactError::Io {
            source,
            path: path.clone(),
        })?;
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> ArtifactResult<PageArtifact> {
        let payload = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// All stored artifacts, for offline re-scoring and listing.
    pub fn load_all(&self) -> ArtifactResult<Vec<(PathBuf, PageArtifact)>> {
        let mut artifacts = Vec::new();
        let entries = std::fs::read_dir(&self.pages_dir).map_err(|source| ArtifactError::Io {
            source,
            path: self.pages_dir.clone(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| ArtifactError::Io {
                source,
                path: self.pages_dir.clone(),
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                artifacts.push((path.clone(), self.load(&path)?));
            }
        }
        artifacts.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(artifacts)
    }
}

/// Filesystem-safe name for a URL: sanitized prefix plus a short digest so
/// two URLs that sanitize identically still get distinct files.
fn url_slug(url: &str) -> String {
    let sanitized: String = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    let trimmed: String = sanitized.trim_matches('-').chars().take(80).collect();
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", trimmed, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::PageSignals;
    use tempfile::TempDir;

    fn sample_artifact(url: &str) -> PageArtifact {
        PageArtifact {
            url: url.to_string(),
            page_title: Some("Reports".to_string()),
            elements: Vec::new(),
            discovered_links: Vec::new(),
            sidebar_links: Vec::new(),
            modal_discoveries: Vec::new(),
            action_chain: ActionChain::new(),
            golden_path: GoldenPathVerdict {
                is_stable: true,
                confidence: 0.95,
                reasons: Vec::new(),
            },
            score: PageScore {
                total: 88.0,
                visual: 90.0,
                stability: 85.0,
                functional: 90.0,
                capped: false,
                reasons: Vec::new(),
            },
            screenshot_path: None,
            metadata: ArtifactMetadata {
                ui_hash: Some("abc123".to_string()),
                settled_url: url.to_string(),
                depth: 1,
                captured_at: Utc::now(),
                run_id: "run-1".to_string(),
                full_discovery: true,
                signals: PageSignals {
                    url: url.to_string(),
                    ..PageSignals::default()
                },
            },
        }
    }

    fn store(dir: &TempDir) -> ArtifactStore {
        let mut config = ScoutConfig::for_url("https://x.com/app");
        config.artifacts.base_dir = dir.path().display().to_string();
        ArtifactStore::open(&config).unwrap()
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let artifact = sample_artifact("https://x.com/app/reports");
        let path = store.save(&artifact).unwrap();
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.url, artifact.url);
        assert_eq!(loaded.page_title, artifact.page_title);
        assert_eq!(loaded.metadata.ui_hash, artifact.metadata.ui_hash);
    }

    #[test]
    fn artifact_json_uses_camel_case_keys() {
        let artifact = sample_artifact("https://x.com/app");
        let json = serde_json::to_value(&artifact).unwrap();
        assert!(json.get("pageTitle").is_some());
        assert!(json.get("discoveredLinks").is_some());
        assert!(json.get("actionChain").is_some());
        assert!(json.get("goldenPath").is_some());
    }

    #[test]
    fn similar_urls_get_distinct_slugs() {
        let a = url_slug("https://x.com/app/a?x=1");
        let b = url_slug("https://x.com/app/a?x=2");
        assert_ne!(a, b);
    }

    #[test]
    fn load_all_finds_every_artifact() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(&sample_artifact("https://x.com/app/a")).unwrap();
        store.save(&sample_artifact("https://x.com/app/b")).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);
    }
}
