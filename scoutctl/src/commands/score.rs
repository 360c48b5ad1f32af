use std::fmt;

use clap::Args;
use serde::Serialize;

use scout_core::artifact::ArtifactStore;
use scout_core::config::ScoutConfig;
use scout_core::scoring::ScoringProcessor;

use crate::Result;

/// Offline re-scoring: recomputes page scores from the signals recorded in
/// each artifact, without a live browser. Useful after tuning weights.
#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Write the recomputed score back into each artifact file
    #[arg(long)]
    pub write: bool,
}

pub fn exec(config: &ScoutConfig, args: &ScoreArgs) -> Result<ScoreReport> {
    let store = ArtifactStore::open(config)?;
    let scorer = ScoringProcessor::new(config.scoring.clone());

    let mut rows = Vec::new();
    for (path, mut artifact) in store.load_all()? {
        let fresh = scorer.score(&artifact.metadata.signals, None);
        rows.push(ScoreRow {
            url: artifact.url.clone(),
            previous: artifact.score.total,
            recomputed: fresh.total,
            drifted: (artifact.score.total - fresh.total).abs() > 1.0,
        });
        if args.write {
            artifact.score = fresh;
            std::fs::write(&path, serde_json::to_string_pretty(&artifact)?)?;
        }
    }
    rows.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(ScoreReport {
        written: args.write,
        rows,
    })
}

#[derive(Debug, Serialize)]
pub struct ScoreRow {
    pub url: String,
    pub previous: f64,
    pub recomputed: f64,
    pub drifted: bool,
}

#[derive(Debug, Serialize)]
pub struct ScoreReport {
    pub written: bool,
    pub rows: Vec<ScoreRow>,
}

impl fmt::Display for ScoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rows.is_empty() {
            return write!(f, "no artifacts to score");
        }
        for row in &self.rows {
            writeln!(
                f,
                "{:>5.1} -> {:>5.1}{}  {}",
                row.previous,
                row.recomputed,
                if row.drifted { " *" } else { "  " },
                row.url,
            )?;
        }
        write!(
            f,
            "{} artifact(s){}",
            self.rows.len(),
            if self.written { ", scores updated" } else { "" }
        )
    }
}
