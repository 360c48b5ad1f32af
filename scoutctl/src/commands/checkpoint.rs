use std::fmt;
use std::path::PathBuf;

use clap::Subcommand;
use serde::Serialize;

use scout_core::config::ScoutConfig;
use scout_core::queue::{Checkpoint, QueueManager};

use crate::{AppError, Result};

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Summarize the checkpoint for the configured domain
    Show,
    /// Delete the checkpoint so the next run starts fresh
    Clear,
}

pub fn exec(config: &ScoutConfig, command: &CheckpointCommands) -> Result<CheckpointReport> {
    let path = checkpoint_path(config)?;
    match command {
        CheckpointCommands::Show => {
            let payload = std::fs::read_to_string(&path).map_err(|_| {
                AppError::MissingResource(format!("no checkpoint at {}", path.display()))
            })?;
            let checkpoint: Checkpoint = serde_json::from_str(&payload)?;
            Ok(CheckpointReport {
                path: path.display().to_string(),
                domain: checkpoint.domain,
                saved_at: Some(checkpoint.timestamp.to_rfc3339()),
                queued: checkpoint.queue.len(),
                visited: checkpoint.visited_urls.len(),
                cleared: false,
            })
        }
        CheckpointCommands::Clear => {
            let existed = path.exists();
            if existed {
                std::fs::remove_file(&path)?;
            }
            Ok(CheckpointReport {
                path: path.display().to_string(),
                domain: String::new(),
                saved_at: None,
                queued: 0,
                visited: 0,
                cleared: existed,
            })
        }
    }
}

fn checkpoint_path(config: &ScoutConfig) -> Result<PathBuf> {
    let queue = QueueManager::new(&config.crawl)?;
    Ok(config
        .resolve_path(&config.artifacts.checkpoint_dir)
        .join(format!("{}.json", queue.domain())))
}

#[derive(Debug, Serialize)]
pub struct CheckpointReport {
    pub path: String,
    pub domain: String,
    pub saved_at: Option<String>,
    pub queued: usize,
    pub visited: usize,
    pub cleared: bool,
}

impl fmt::Display for CheckpointReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cleared {
            return write!(f, "checkpoint removed: {}", self.path);
        }
        if self.saved_at.is_none() && self.domain.is_empty() {
            return write!(f, "no checkpoint at {}", self.path);
        }
        writeln!(f, "checkpoint: {}", self.path)?;
        writeln!(f, "domain:     {}", self.domain)?;
        if let Some(saved_at) = &self.saved_at {
            writeln!(f, "saved at:   {saved_at}")?;
        }
        writeln!(f, "queued:     {}", self.queued)?;
        write!(f, "visited:    {}", self.visited)
    }
}
