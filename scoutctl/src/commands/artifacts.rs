use std::fmt;

use clap::Args;
use serde::Serialize;

use scout_core::artifact::ArtifactStore;
use scout_core::config::ScoutConfig;

use crate::Result;

#[derive(Args, Debug, Clone)]
pub struct ArtifactArgs {
    /// Only list pages scoring at or below this threshold
    #[arg(long)]
    pub max_score: Option<f64>,

    /// Limit the number of rows returned
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

pub fn exec(config: &ScoutConfig, args: &ArtifactArgs) -> Result<ArtifactListing> {
    let store = ArtifactStore::open(config)?;
    let mut rows: Vec<ArtifactRow> = store
        .load_all()?
        .into_iter()
        .filter(|(_, artifact)| {
            args.max_score
                .map(|threshold| artifact.score.total <= threshold)
                .unwrap_or(true)
        })
        .take(args.limit)
        .map(|(path, artifact)| ArtifactRow {
            file: path.display().to_string(),
            url: artifact.url,
            title: artifact.page_title.unwrap_or_default(),
            score: artifact.score.total,
            stable: artifact.golden_path.is_stable,
            links: artifact.discovered_links.len() + artifact.sidebar_links.len(),
        })
        .collect();
    rows.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(ArtifactListing { rows })
}

#[derive(Debug, Serialize)]
pub struct ArtifactRow {
    pub file: String,
    pub url: String,
    pub title: String,
    pub score: f64,
    pub stable: bool,
    pub links: usize,
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ArtifactListing {
    pub rows: Vec<ArtifactRow>,
}

impl fmt::Display for ArtifactListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return write!(f, "no artifacts stored");
        }
        for row in &self.rows {
            writeln!(
                f,
                "{:>5.1}  {}  {}  ({} links{})",
                row.score,
                row.url,
                row.title,
                row.links,
                if row.stable { ", stable" } else { "" },
            )?;
        }
        write!(f, "{} artifact(s)", self.rows.len())
    }
}
