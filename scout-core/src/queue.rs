use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::command::ActionChain;
use crate::config::{CrawlSection, QueuePolicy};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    #[default]
    Normal,
    High,
}

/// One unit of crawl work. The action chain and functional path describe how
/// the parent page reached the link, so downstream consumers can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub url: String,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub action_chain: ActionChain,
    #[serde(default)]
    pub functional_path: Vec<String>,
    #[serde(default)]
    pub priority: JobPriority,
}

impl ScrapeJob {
    pub fn seed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            depth: 0,
            source_url: None,
            action_chain: ActionChain::new(),
            functional_path: Vec::new(),
            priority: JobPriority::Normal,
        }
    }
}

/// Persisted queue snapshot, one file per crawled domain, overwritten on
/// every save and deleted on clean completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub domain: String,
    pub timestamp: DateTime<Utc>,
    pub queue: Vec<ScrapeJob>,
    pub visited_urls: Vec<String>,
}

/// Owns the frontier queue and the visited set. Workers never touch either
/// directly; the check-then-act window around `mark_visited` only stays
/// sound while all mutation goes through these methods.
#[derive(Debug)]
pub struct QueueManager {
    queue: Vec<(u64, ScrapeJob)>,
    queued_urls: HashSet<String>,
    visited: HashSet<String>,
    normalize_cache: HashMap<String, String>,
    next_seq: u64,
    host: String,
    base_path: String,
    max_depth: usize,
    policy: QueuePolicy,
    force: bool,
}

impl QueueManager {
    pub fn new(config: &CrawlSection) -> QueueResult<Self> {
        let start = Url::parse(&config.start_url).map_err(|err| QueueError::InvalidUrl {
            url: config.start_url.clone(),
            reason: err.to_string(),
        })?;
        let host = start
            .host_str()
            .ok_or_else(|| QueueError::InvalidUrl {
                url: config.start_url.clone(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let base_path = config
            .base_path
            .clone()
            .unwrap_or_else(|| start.path().trim_end_matches('/').to_string());
        Ok(Self {
            queue: Vec::new(),
            queued_urls: HashSet::new(),
            visited: HashSet::new(),
            normalize_cache: HashMap::new(),
            next_seq: 0,
            host,
            base_path,
            max_depth: config.max_depth as usize,
            policy: config.queue_policy,
            force: config.force,
        })
    }

    pub fn domain(&self) -> &str {
        &self.host
    }

    /// Canonical form used for every visited/queued comparison: fragment
    /// stripped, trailing slash removed, scheme and host lowercased by the
    /// parser. Idempotent, memoized per run.
    pub fn normalize_url(&mut self, url: &str) -> QueueResult<String> {
        if let Some(cached) = self.normalize_cache.get(url) {
            return Ok(cached.clone());
        }
        let mut parsed = Url::parse(url).map_err(|err| QueueError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        parsed.set_fragment(None);
        let mut normalized = parsed.to_string();
        while normalized.ends_with('/') && parsed.path() != "/" {
            normalized.pop();
            parsed = Url::parse(&normalized).map_err(|err| QueueError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        }
        self.normalize_cache
            .insert(url.to_string(), normalized.clone());
        Ok(normalized)
    }

    fn in_scope(&self, normalized: &str) -> bool {
        let Ok(parsed) = Url::parse(normalized) else {
            return false;
        };
        parsed.host_str() == Some(self.host.as_str())
            && (self.base_path.is_empty() || parsed.path().starts_with(&self.base_path))
    }

    /// Filters, deduplicates and enqueues. Returns how many jobs were
    /// actually added. Enqueueing never marks anything visited.
    pub fn add_jobs(&mut self, jobs: Vec<ScrapeJob>) -> usize {
        let mut added = 0;
        for mut job in jobs {
            let normalized = match self.normalize_url(&job.url) {
                Ok(normalized) => normalized,
                Err(err) => {
                    warn!(url = %job.url, error = %err, "skipping unparseable url");
                    continue;
                }
            };
            if job.depth > self.max_depth {
                // Depth-bounded rejection is silent by contract.
                continue;
            }
            if !self.in_scope(&normalized) {
                debug!(url = %normalized, "skipping out-of-scope url");
                continue;
            }
            if self.visited.contains(&normalized) {
                if !self.force {
                    continue;
                }
                // Forced re-crawl releases the visited entry too, otherwise
                // the worker race guard would drop the job at dispatch.
                debug!(url = %normalized, "force mode re-queues visited url");
                self.visited.remove(&normalized);
            }
            if self.queued_urls.contains(&normalized) {
                // Duplicate enqueue may still raise priority.
                if job.priority == JobPriority::High {
                    for (_, queued) in self.queue.iter_mut() {
                        if queued.url == normalized && queued.priority < JobPriority::High {
                            queued.priority = JobPriority::High;
                        }
                    }
                }
                continue;
            }
            job.url = normalized.clone();
            self.queued_urls.insert(normalized);
            self.queue.push((self.next_seq, job));
            self.next_seq += 1;
            added += 1;
        }
        added
    }

    /// Deterministic dequeue: priority descending, then depth ascending,
    /// then insertion order; plain FIFO under the scoped-fifo policy.
    pub fn next_job(&mut self) -> Option<ScrapeJob> {
        if self.queue.is_empty() {
            return None;
        }
        let index = match self.policy {
            QueuePolicy::ScopedFifo => 0,
            QueuePolicy::PriorityQueue => self
                .queue
                .iter()
                .enumerate()
                .min_by(|(_, (seq_a, a)), (_, (seq_b, b))| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.depth.cmp(&b.depth))
                        .then(seq_a.cmp(seq_b))
                })
                .map(|(index, _)| index)?,
        };
        let (_, job) = self.queue.remove(index);
        self.queued_urls.remove(&job.url);
        Some(job)
    }

    /// Idempotent; a repeated call is a worker race being caught, so it is
    /// logged but otherwise a no-op.
    pub fn mark_visited(&mut self, url: &str) {
        let normalized = match self.normalize_url(url) {
            Ok(normalized) => normalized,
            Err(err) => {
                warn!(url, error = %err, "cannot mark unparseable url visited");
                return;
            }
        };
        if !self.visited.insert(normalized.clone()) {
            warn!(url = %normalized, "url already marked visited");
        }
    }

    pub fn is_visited(&mut self, url: &str) -> bool {
        match self.normalize_url(url) {
            Ok(normalized) => self.visited.contains(&normalized),
            Err(_) => false,
        }
    }

    pub fn get_visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn get_queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn save_checkpoint(&self, path: &Path) -> QueueResult<()> {
        let checkpoint = Checkpoint {
            domain: self.host.clone(),
            timestamp: Utc::now(),
            queue: self.queue.iter().map(|(_, job)| job.clone()).collect(),
            visited_urls: self.visited.iter().cloned().collect(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        let payload = serde_json::to_string_pretty(&checkpoint)?;
        std::fs::write(path, payload).map_err(|source| QueueError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        debug!(
            path = %path.display(),
            queued = self.queue.len(),
            visited = self.visited.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Restores queue and visited state from a checkpoint file. A missing or
    /// corrupt file degrades to a fresh start and returns `Ok(false)`.
    pub fn load_from_checkpoint(&mut self, path: &Path) -> QueueResult<bool> {
        let payload = match std::fs::read_to_string(path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint, starting fresh");
                return Ok(false);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "checkpoint unreadable, starting fresh");
                return Ok(false);
            }
        };
        let checkpoint: Checkpoint = match serde_json::from_str(&payload) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "checkpoint corrupt, starting fresh");
                return Ok(false);
            }
        };
        if checkpoint.domain != self.host {
            warn!(
                checkpoint_domain = %checkpoint.domain,
                run_domain = %self.host,
                "checkpoint belongs to another domain, starting fresh"
            );
            return Ok(false);
        }
        self.visited = checkpoint.visited_urls.into_iter().collect();
        self.queue.clear();
        self.queued_urls.clear();
        for job in checkpoint.queue {
            self.queued_urls.insert(job.url.clone());
            self.queue.push((self.next_seq, job));
            self.next_seq += 1;
        }
        info!(
            queued = self.queue.len(),
            visited = self.visited.len(),
            "resumed from checkpoint"
        );
        Ok(true)
    }

    pub fn delete_checkpoint(&self, path: &Path) -> QueueResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(QueueError::Io {
                source,
                path: path.to_path_buf(),
            }),
        }
    }

    /// Keeps only visited entries the predicate judges healthy, so pages
    /// that scored poorly last run are crawled again. Returns how many
    /// entries were retained.
    pub fn load_healthy_visited_urls<F>(&mut self, is_healthy: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.visited.len();
        self.visited.retain(|url| is_healthy(url));
        let kept = self.visited.len();
        if kept < before {
            info!(
                dropped = before - kept,
                kept, "released unhealthy urls for re-crawl"
            );
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn crawl_section(start_url: &str) -> CrawlSection {
        CrawlSection {
            start_url: start_url.to_string(),
            ..CrawlSection::default()
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(&crawl_section("https://x.com/app")).unwrap()
    }

    #[test]
    fn normalize_is_idempotent_and_strips_fragment_and_slash() {
        let mut queue = manager();
        let once = queue.normalize_url("https://x.com/a#frag").unwrap();
        assert_eq!(once, "https://x.com/a");
        assert_eq!(queue.normalize_url(&once).unwrap(), once);
        assert_eq!(
            queue.normalize_url("https://x.com/a/").unwrap(),
            "https://x.com/a"
        );
    }

    #[test]
    fn enqueue_never_marks_visited() {
        let mut queue = manager();
        let added = queue.add_jobs(vec![ScrapeJob::seed("https://x.com/app/reports")]);
        assert_eq!(added, 1);
        assert!(!queue.is_visited("https://x.com/app/reports"));
    }

    #[test]
    fn mark_visited_is_idempotent() {
        let mut queue = manager();
        queue.mark_visited("https://x.com/app");
        queue.mark_visited("https://x.com/app");
        assert_eq!(queue.get_visited_count(), 1);
    }

    #[test]
    fn jobs_beyond_max_depth_are_dropped_silently() {
        let mut queue = manager();
        let mut job = ScrapeJob::seed("https://x.com/app/deep");
        job.depth = 4; // default max_depth is 3
        assert_eq!(queue.add_jobs(vec![job]), 0);
        assert_eq!(queue.get_queue_length(), 0);
    }

    #[test]
    fn out_of_scope_hosts_and_paths_are_rejected() {
        let mut queue = manager();
        let added = queue.add_jobs(vec![
            ScrapeJob::seed("https://other.com/app"),
            ScrapeJob::seed("https://x.com/public/docs"),
            ScrapeJob::seed("https://x.com/app/ok"),
        ]);
        assert_eq!(added, 1);
    }

    #[test]
    fn duplicate_enqueue_raises_priority_in_place() {
        let mut queue = manager();
        queue.add_jobs(vec![ScrapeJob::seed("https://x.com/app/a")]);
        let mut high = ScrapeJob::seed("https://x.com/app/a");
        high.priority = JobPriority::High;
        assert_eq!(queue.add_jobs(vec![high]), 0);
        assert_eq!(queue.get_queue_length(), 1);
        assert_eq!(queue.next_job().unwrap().priority, JobPriority::High);
    }

    #[test]
    fn force_mode_requeues_visited_urls() {
        let mut queue = QueueManager::new(&CrawlSection {
            force: true,
            ..crawl_section("https://x.com/app")
        })
        .unwrap();
        queue.mark_visited("https://x.com/app/reports");

        let added = queue.add_jobs(vec![ScrapeJob::seed("https://x.com/app/reports")]);
        assert_eq!(added, 1);
        // The visited entry is released so the job survives dispatch.
        assert!(!queue.is_visited("https://x.com/app/reports"));
    }

    #[test]
    fn force_mode_still_honors_scope_and_depth() {
        let mut queue = QueueManager::new(&CrawlSection {
            force: true,
            ..crawl_section("https://x.com/app")
        })
        .unwrap();
        let mut deep = ScrapeJob::seed("https://x.com/app/deep");
        deep.depth = 9;
        let added = queue.add_jobs(vec![deep, ScrapeJob::seed("https://other.com/app")]);
        assert_eq!(added, 0);
    }

    #[test]
    fn priority_then_depth_then_insertion_order() {
        let mut queue = manager();
        let mut deep = ScrapeJob::seed("https://x.com/app/deep");
        deep.depth = 2;
        let mut shallow = ScrapeJob::seed("https://x.com/app/shallow");
        shallow.depth = 1;
        let mut urgent = ScrapeJob::seed("https://x.com/app/urgent");
        urgent.depth = 3;
        urgent.priority = JobPriority::High;
        queue.add_jobs(vec![deep, shallow, urgent]);

        assert_eq!(queue.next_job().unwrap().url, "https://x.com/app/urgent");
        assert_eq!(queue.next_job().unwrap().url, "https://x.com/app/shallow");
        assert_eq!(queue.next_job().unwrap().url, "https://x.com/app/deep");
    }

    #[test]
    fn checkpoint_round_trip_preserves_queue_and_visited() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.com.json");

        let mut queue = manager();
        queue.add_jobs(vec![
            ScrapeJob::seed("https://x.com/app/a"),
            ScrapeJob::seed("https://x.com/app/b"),
        ]);
        queue.mark_visited("https://x.com/app");
        queue.save_checkpoint(&path).unwrap();

        let mut restored = manager();
        assert!(restored.load_from_checkpoint(&path).unwrap());
        assert_eq!(restored.get_queue_length(), 2);
        assert_eq!(restored.get_visited_count(), 1);
        assert!(restored.is_visited("https://x.com/app"));
        let urls: Vec<String> = std::iter::from_fn(|| restored.next_job())
            .map(|job| job.url)
            .collect();
        assert_eq!(urls, vec!["https://x.com/app/a", "https://x.com/app/b"]);
    }

    #[test]
    fn corrupt_checkpoint_degrades_to_fresh_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.com.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut queue = manager();
        assert!(!queue.load_from_checkpoint(&path).unwrap());
        assert_eq!(queue.get_queue_length(), 0);
        assert_eq!(queue.get_visited_count(), 0);
    }

    #[test]
    fn missing_checkpoint_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mut queue = manager();
        assert!(!queue
            .load_from_checkpoint(&dir.path().join("absent.json"))
            .unwrap());
    }

    #[test]
    fn unhealthy_visited_urls_are_released() {
        let mut queue = manager();
        queue.mark_visited("https://x.com/app/good");
        queue.mark_visited("https://x.com/app/bad");
        let kept = queue.load_healthy_visited_urls(|url| !url.ends_with("/bad"));
        assert_eq!(kept, 1);
        assert!(!queue.is_visited("https://x.com/app/bad"));
        assert!(queue.is_visited("https://x.com/app/good"));
    }
}
