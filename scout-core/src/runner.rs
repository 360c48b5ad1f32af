use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactMetadata, ArtifactStore, PageArtifact};
use crate::auth::{AuthError, Credentials, SessionManager};
use crate::browser::{BrowserError, BrowserPage, PageFactory};
use crate::config::{RateLimitSection, ScoutConfig};
use crate::error::ConfigError;
use crate::explore::{ExplorationContext, LinkSource, Pipeline};
use crate::queue::{JobPriority, QueueError, QueueManager, ScrapeJob};
use crate::scoring::ScoringProcessor;
use crate::stability::StabilityAnalyzer;
use crate::telemetry::{record_or_warn, CrawlTelemetry};

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Telemetry(#[from] crate::telemetry::TelemetryError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// Backpressure state shared by the dispatch loop. Never lets concurrency
/// reach zero and never exceeds the configured ceiling.
#[derive(Debug)]
pub struct RateGovernor {
    cfg: RateLimitSection,
    ceiling: usize,
    current: usize,
    cooldown_until: Option<Instant>,
    consecutive_hits: u32,
    last_hit: Option<Instant>,
    success_streak: u32,
}

impl RateGovernor {
    pub fn new(cfg: RateLimitSection, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            cfg,
            ceiling,
            current: ceiling,
            cooldown_until: None,
            consecutive_hits: 0,
            last_hit: None,
            success_streak: 0,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.current
    }

    pub fn ready(&self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }

    /// True while a cooldown is pending or was recently active; dispatch
    /// jitter widens during this window.
    pub fn recently_limited(&self) -> bool {
        self.last_hit
            .map(|hit| hit.elapsed() < Duration::from_secs(self.cfg.rapid_window_seconds))
            .unwrap_or(false)
    }

    pub fn on_rate_limited(&mut self) -> Duration {
        self.on_rate_limited_at(Instant::now())
    }

    fn on_rate_limited_at(&mut self, now: Instant) -> Duration {
        let rapid = self
            .last_hit
            .map(|hit| now.duration_since(hit) <= Duration::from_secs(self.cfg.rapid_window_seconds))
            .unwrap_or(false);
        self.consecutive_hits = if rapid { self.consecutive_hits + 1 } else { 1 };
        self.last_hit = Some(now);
        self.success_streak = 0;
        self.current = self.current.saturating_sub(1).max(1);

        let cooldown = if self.consecutive_hits >= self.cfg.deep_sleep_threshold {
            Duration::from_secs(self.cfg.deep_sleep_seconds)
        } else {
            Duration::from_secs(self.cfg.cooldown_seconds)
        };
        self.cooldown_until = Some(now + cooldown);
        cooldown
    }

    pub fn on_success(&mut self) {
        self.success_streak += 1;
        if self.success_streak >= self.cfg.restore_success_streak && self.current < self.ceiling {
            self.current += 1;
            self.success_streak = 0;
            debug!(concurrency = self.current, "restored one concurrency slot");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub run_id: String,
    pub pages_visited: u64,
    pub pages_failed: u64,
    pub rate_limit_events: u64,
    pub queue_remaining: usize,
    pub duration_ms: u64,
}

enum WorkerStatus {
    Completed { score: f64 },
    /// Visit ended early without error (auth redirect mid-pipeline).
    Incomplete,
    /// Another worker won the race for this URL.
    Skipped,
    Failed { phase: String, error: BrowserError },
}

struct WorkerReport {
    url: String,
    status: WorkerStatus,
    duration_ms: u64,
}

#[derive(Clone)]
struct WorkerEnv {
    config: Arc<ScoutConfig>,
    queue: Arc<Mutex<QueueManager>>,
    session: Arc<SessionManager>,
    artifacts: Arc<ArtifactStore>,
    seen_layouts: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

/// Drives the crawl: dispatches workers against the queue, reacts to
/// rate-limit signals and persists a checkpoint after every processed job.
pub struct Runner {
    config: Arc<ScoutConfig>,
    queue: Arc<Mutex<QueueManager>>,
    session: Arc<SessionManager>,
    artifacts: Arc<ArtifactStore>,
    telemetry: Arc<CrawlTelemetry>,
    governor: Arc<Mutex<RateGovernor>>,
    stop: Arc<AtomicBool>,
    checkpoint_path: PathBuf,
}

impl Runner {
    pub fn new(config: Arc<ScoutConfig>, credentials: Option<Credentials>) -> RunnerResult<Self> {
        config.validate()?;
        let queue = QueueManager::new(&config.crawl)?;
        let checkpoint_path = config
            .resolve_path(&config.artifacts.checkpoint_dir)
            .join(format!("{}.json", queue.domain()));
        let artifacts = Arc::new(ArtifactStore::open(&config)?);
        let telemetry = Arc::new(CrawlTelemetry::open(&config)?);
        let session = Arc::new(SessionManager::new(Arc::clone(&config), credentials));
        let governor = Arc::new(Mutex::new(RateGovernor::new(
            config.rate_limit.clone(),
            config.crawl.concurrency,
        )));
        Ok(Self {
            config,
            queue: Arc::new(Mutex::new(queue)),
            session,
            artifacts,
            telemetry,
            governor,
            stop: Arc::new(AtomicBool::new(false)),
            checkpoint_path,
        })
    }

    /// Handle for wiring an interrupt signal; flipping it flushes the
    /// checkpoint and lets in-flight jobs be abandoned.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn run(&self, factory: Arc<dyn PageFactory>) -> RunnerResult<CrawlSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, url = %self.config.crawl.start_url, "crawl starting");

        self.prepare_queue().await?;

        // Auth is fatal when it fails: no jobs are dispatched at all.
        let auth_page = factory.new_page().await?;
        if let Err(err) = self.session.ensure_session(auth_page.as_ref()).await {
            let _ = auth_page.close().await;
            error!(error = %err, "authentication failed, aborting run");
            return Err(err.into());
        }
        // In single-concurrency mode the authenticated page is reused for
        // every job; otherwise each worker gets a fresh one.
        let shared_page = if self.config.crawl.concurrency == 1 {
            Some(auth_page)
        } else {
            let _ = auth_page.close().await;
            None
        };

        let env = WorkerEnv {
            config: Arc::clone(&self.config),
            queue: Arc::clone(&self.queue),
            session: Arc::clone(&self.session),
            artifacts: Arc::clone(&self.artifacts),
            seen_layouts: Arc::new(Mutex::new(HashSet::new())),
            run_id: run_id.clone(),
        };

        let mut pages_visited = 0u64;
        let mut pages_failed = 0u64;
        let mut rate_limit_events = 0u64;
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!("stop requested, flushing and shutting down");
                break;
            }
            let visited = self.queue.lock().await.get_visited_count();
            if visited >= self.config.crawl.page_limit {
                info!(visited, "page limit reached");
                break;
            }
            if !self.governor.lock().await.ready() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

            let target = self.governor.lock().await.concurrency();
            while workers.len() < target {
                let job = self.queue.lock().await.next_job();
                let Some(job) = job else { break };
                tokio::time::sleep(self.dispatch_jitter().await).await;
                let env = env.clone();
                let factory = Arc::clone(&factory);
                let shared = shared_page.clone();
                workers.spawn(async move { Self::worker(env, factory, shared, job).await });
            }

            if workers.is_empty() {
                break; // queue drained and nothing in flight
            }
            if let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(report) => {
                        self.process_report(
                            report,
                            &mut pages_visited,
                            &mut pages_failed,
                            &mut rate_limit_events,
                        )
                        .await;
                    }
                    Err(err) => {
                        warn!(error = %err, "worker task panicked");
                        pages_failed += 1;
                    }
                }
                self.flush_checkpoint().await;
            }
        }

        // In-flight jobs are abandoned on stop, awaited to completion on a
        // normal drain.
        if self.stop.load(Ordering::SeqCst) {
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            if let Ok(report) = joined {
                self.process_report(
                    report,
                    &mut pages_visited,
                    &mut pages_failed,
                    &mut rate_limit_events,
                )
                .await;
            }
        }
        if let Some(page) = shared_page {
            let _ = page.close().await;
        }

        let queue_remaining = self.queue.lock().await.get_queue_length();
        if queue_remaining == 0 && !self.stop.load(Ordering::SeqCst) {
            let queue = self.queue.lock().await;
            if let Err(err) = queue.delete_checkpoint(&self.checkpoint_path) {
                warn!(error = %err, "checkpoint cleanup failed");
            }
        } else {
            self.flush_checkpoint().await;
        }

        let summary = CrawlSummary {
            run_id,
            pages_visited,
            pages_failed,
            rate_limit_events,
            queue_remaining,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            visited = summary.pages_visited,
            failed = summary.pages_failed,
            rate_limits = summary.rate_limit_events,
            remaining = summary.queue_remaining,
            "crawl finished"
        );
        Ok(summary)
    }

    async fn prepare_queue(&self) -> RunnerResult<()> {
        let mut queue = self.queue.lock().await;
        if self.config.crawl.resume && !self.config.crawl.force {
            let resumed = queue.load_from_checkpoint(&self.checkpoint_path)?;
            if resumed {
                // Pages whose last crawl failed, or completed looking like an
                // error page, are released for another pass.
                match self.telemetry.healthy_urls(self.config.scoring.error_ceiling) {
                    Ok(healthy) => {
                        queue.load_healthy_visited_urls(|url| healthy.contains(url));
                    }
                    Err(err) => {
                        warn!(error = %err, "health lookup failed, keeping visited set as-is")
                    }
                }
            }
        }
        if queue.get_queue_length() == 0 {
            queue.add_jobs(vec![ScrapeJob::seed(&self.config.crawl.start_url)]);
        }
        Ok(())
    }

    async fn flush_checkpoint(&self) {
        let queue = self.queue.lock().await;
        if let Err(err) = queue.save_checkpoint(&self.checkpoint_path) {
            // Checkpoint loss degrades resume, never the crawl itself.
            warn!(error = %err, "checkpoint save failed");
        }
    }

    async fn dispatch_jitter(&self) -> Duration {
        let range = if self.governor.lock().await.recently_limited() {
            self.config.crawl.backoff_jitter_ms
        } else {
            self.config.crawl.jitter_ms
        };
        let millis = rand::thread_rng().gen_range(range[0]..=range[1].max(range[0]));
        Duration::from_millis(millis)
    }

    async fn process_report(
        &self,
        report: WorkerReport,
        pages_visited: &mut u64,
        pages_failed: &mut u64,
        rate_limit_events: &mut u64,
    ) {
        match &report.status {
            WorkerStatus::Completed { score } => {
                *pages_visited += 1;
                self.governor.lock().await.on_success();
                record_or_warn(self.telemetry.record_page(
                    &report.url,
                    true,
                    report.duration_ms,
                    Some(*score),
                    None,
                ));
            }
            WorkerStatus::Incomplete | WorkerStatus::Skipped => {}
            WorkerStatus::Failed { phase, error } => {
                *pages_failed += 1;
                record_or_warn(self.telemetry.record_failure(&report.url, phase, error, 0));
                record_or_warn(self.telemetry.record_page(
                    &report.url,
                    false,
                    report.duration_ms,
                    None,
                    None,
                ));
                if error.is_rate_limit() {
                    *rate_limit_events += 1;
                    let mut governor = self.governor.lock().await;
                    let cooldown = governor.on_rate_limited();
                    let concurrency = governor.concurrency();
                    drop(governor);
                    warn!(
                        url = %report.url,
                        cooldown_seconds = cooldown.as_secs(),
                        concurrency,
                        "rate limited, backing off"
                    );
                    record_or_warn(
                        self.telemetry
                            .record_rate_limit(cooldown.as_secs(), concurrency),
                    );
                }
            }
        }
    }

    async fn worker(
        env: WorkerEnv,
        factory: Arc<dyn PageFactory>,
        shared_page: Option<Arc<dyn BrowserPage>>,
        job: ScrapeJob,
    ) -> WorkerReport {
        let started = Instant::now();
        let url = job.url.clone();

        // Race guard: another worker may have visited this URL between
        // enqueue and dispatch.
        {
            let mut queue = env.queue.lock().await;
            if queue.is_visited(&url) {
                return WorkerReport {
                    url,
                    status: WorkerStatus::Skipped,
                    duration_ms: 0,
                };
            }
            queue.mark_visited(&url);
        }

        // Lazy refresh before the page needs the token.
        if let Err(err) = env.session.current_access_token().await {
            warn!(error = %err, "token refresh failed before dispatch");
        }

        let fresh = shared_page.is_none();
        let page = match shared_page {
            Some(page) => page,
            None => match factory.new_page().await {
                Ok(page) => page,
                Err(err) => {
                    return WorkerReport {
                        url,
                        status: WorkerStatus::Failed {
                            phase: "setup".into(),
                            error: err,
                        },
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                }
            },
        };
        if fresh {
            if let Some(seed) = env.session.seed_script().await {
                if let Err(err) = page.install_on_new_document(&seed).await {
                    warn!(error = %err, "token seeding failed on fresh page");
                }
            }
        }

        let mut ctx = ExplorationContext::new(
            job,
            Arc::clone(&env.config),
            Arc::clone(&env.seen_layouts),
        );
        let pipeline = Pipeline::new(Arc::clone(&env.config));
        let report = pipeline.run(page.as_ref(), &mut ctx).await;

        let failed_phase = report
            .failure()
            .map(|(kind, _)| kind.name().to_string());
        let status = if let Some(phase) = failed_phase {
            let error = report
                .phases
                .into_iter()
                .find_map(|p| p.outcome.error)
                .unwrap_or_else(|| BrowserError::Unexpected("phase failed without error".into()));
            WorkerStatus::Failed { phase, error }
        } else if !report.completed() {
            debug!(url = %url, "visit ended early without artifact");
            WorkerStatus::Incomplete
        } else {
            match Self::persist_visit(&env, &mut ctx).await {
                Ok(score) => WorkerStatus::Completed { score },
                Err(err) => WorkerStatus::Failed {
                    phase: "persist".into(),
                    error: BrowserError::Unexpected(err.to_string()),
                },
            }
        };

        if fresh {
            let _ = page.close().await;
        }
        WorkerReport {
            url,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Scores the visit, writes the artifact and folds discovered links
    /// back into the queue. Sidebar links get elevated priority.
    async fn persist_visit(env: &WorkerEnv, ctx: &mut ExplorationContext) -> RunnerResult<f64> {
        let scorer = ScoringProcessor::new(env.config.scoring.clone());
        let analyzer = StabilityAnalyzer::new(env.config.scoring.clone());
        let score = scorer.score(
            &ctx.results.signals,
            ctx.results.screenshot_bytes.as_deref(),
        );
        let verdict = analyzer.analyze(&ctx.results.signals, ctx.chain.len());

        let screenshot_path = match &ctx.results.screenshot_bytes {
            Some(bytes) => match env.artifacts.save_screenshot(&ctx.job.url, bytes) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    warn!(error = %err, "screenshot save failed");
                    None
                }
            },
            None => None,
        };

        let artifact = PageArtifact {
            url: ctx.job.url.clone(),
            page_title: ctx.results.page_title.clone(),
            elements: ctx.results.elements.clone(),
            discovered_links: ctx.results.discovered_links.clone(),
            sidebar_links: ctx.results.sidebar_links.clone(),
            modal_discoveries: ctx.results.modal_discoveries.clone(),
            action_chain: ctx.chain.clone(),
            golden_path: verdict,
            score: score.clone(),
            screenshot_path,
            metadata: ArtifactMetadata {
                ui_hash: ctx.results.ui_hash.clone(),
                settled_url: ctx.results.settled_url.clone(),
                depth: ctx.job.depth,
                captured_at: chrono::Utc::now(),
                run_id: env.run_id.clone(),
                full_discovery: ctx.results.full_discovery,
                signals: ctx.results.signals.clone(),
            },
        };
        env.artifacts.save(&artifact)?;

        let child_depth = ctx.job.depth + 1;
        let mut jobs = Vec::new();
        for link in ctx
            .results
            .sidebar_links
            .iter()
            .chain(ctx.results.discovered_links.iter())
        {
            let priority = if link.source == LinkSource::Sidebar {
                JobPriority::High
            } else {
                JobPriority::Normal
            };
            jobs.push(ScrapeJob {
                url: link.url.clone(),
                depth: child_depth,
                source_url: Some(ctx.job.url.clone()),
                action_chain: ctx.chain.clone(),
                functional_path: link.label_path.clone(),
                priority,
            });
        }
        let added = env.queue.lock().await.add_jobs(jobs);
        debug!(url = %ctx.job.url, added, "folded discovered links into queue");
        Ok(score.total)
    }
}
