use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::context::ExplorationContext;
use super::discovery;
use super::extraction::{self, MUTATION_COUNTER_SCRIPT, ROUTE_OBSERVER_SCRIPT};
use crate::browser::{BrowserError, BrowserPage};
use crate::command::ActionRecord;
use crate::config::{RevisitPolicy, ScoutConfig};
use crate::scoring::PageSignals;

/// Checks a thin page body for upstream throttling text. Scoped to short
/// bodies so an article about rate limits does not trip it.
const RATE_LIMIT_PROBE: &str = r#"
(() => {
    const text = (document.body && document.body.innerText) || '';
    return text.length < 2000 && /too many requests|rate limit(ed)?|error 429/i.test(text);
})()
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Navigation,
    Stabilization,
    Capture,
    Discovery,
    Extraction,
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Navigation => "navigation",
            PhaseKind::Stabilization => "stabilization",
            PhaseKind::Capture => "capture",
            PhaseKind::Discovery => "discovery",
            PhaseKind::Extraction => "extraction",
        }
    }
}

/// What one phase decided. `success: false` abandons the visit as failed;
/// `continue_flag: false` ends it early without treating it as an error.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub success: bool,
    pub continue_flag: bool,
    pub error: Option<BrowserError>,
}

impl PhaseOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            continue_flag: true,
            error: None,
        }
    }

    pub fn stop() -> Self {
        Self {
            success: true,
            continue_flag: false,
            error: None,
        }
    }

    pub fn fail(error: BrowserError) -> Self {
        Self {
            success: false,
            continue_flag: false,
            error: Some(error),
        }
    }
}

#[derive(Debug)]
pub struct PhaseResult {
    pub kind: PhaseKind,
    pub outcome: PhaseOutcome,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub phases: Vec<PhaseResult>,
}

impl PipelineReport {
    /// True when no phase failed. An early `continue_flag` stop still
    /// counts as success.
    pub fn succeeded(&self) -> bool {
        self.phases.iter().all(|phase| phase.outcome.success)
    }

    /// True only when every phase ran to completion.
    pub fn completed(&self) -> bool {
        self.succeeded()
            && self
                .phases
                .last()
                .map(|phase| phase.kind == PhaseKind::Extraction && phase.outcome.continue_flag)
                .unwrap_or(false)
    }

    pub fn failure(&self) -> Option<(&PhaseKind, &BrowserError)> {
        self.phases
            .iter()
            .find(|phase| !phase.outcome.success)
            .and_then(|phase| phase.outcome.error.as_ref().map(|err| (&phase.kind, err)))
    }

    pub fn rate_limited(&self) -> bool {
        self.phases
            .iter()
            .any(|phase| matches!(&phase.outcome.error, Some(err) if err.is_rate_limit()))
    }
}

/// Runs the fixed phase sequence for one job. Later phases never run after
/// a failure or an early stop.
pub struct Pipeline {
    config: Arc<ScoutConfig>,
}

impl Pipeline {
    pub fn new(config: Arc<ScoutConfig>) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        page: &dyn BrowserPage,
        ctx: &mut ExplorationContext,
    ) -> PipelineReport {
        let mut report = PipelineReport::default();
        let phases = [
            PhaseKind::Navigation,
            PhaseKind::Stabilization,
            PhaseKind::Capture,
            PhaseKind::Discovery,
            PhaseKind::Extraction,
        ];
        for kind in phases {
            let outcome = match kind {
                PhaseKind::Navigation => self.navigation(page, ctx).await,
                PhaseKind::Stabilization => self.stabilization(page, ctx).await,
                PhaseKind::Capture => self.capture(page, ctx).await,
                PhaseKind::Discovery => self.discovery(page, ctx).await,
                PhaseKind::Extraction => self.extraction(page, ctx).await,
            };
            debug!(
                phase = kind.name(),
                success = outcome.success,
                continue_flag = outcome.continue_flag,
                url = %ctx.job.url,
                "phase finished"
            );
            let halt = !outcome.success || !outcome.continue_flag;
            report.phases.push(PhaseResult { kind, outcome });
            if halt {
                break;
            }
        }
        report
    }

    async fn navigation(
        &self,
        page: &dyn BrowserPage,
        ctx: &mut ExplorationContext,
    ) -> PhaseOutcome {
        // The route observer must be in place before the document loads or
        // early pushState calls are lost.
        if let Err(err) = page.install_on_new_document(ROUTE_OBSERVER_SCRIPT).await {
            warn!(error = %err, "route observer install failed");
        }
        ctx.chain.push(ActionRecord::navigation(&ctx.job.url));

        if let Err(err) = page.goto(&ctx.job.url).await {
            return PhaseOutcome::fail(err);
        }
        let settled = match page.current_url().await {
            Ok(url) => url,
            Err(err) => return PhaseOutcome::fail(err),
        };
        ctx.results.settled_url = settled.clone();

        if self.is_auth_redirect(&settled) {
            info!(url = %ctx.job.url, settled = %settled, "redirected to login, ending visit");
            return PhaseOutcome::stop();
        }
        match page.evaluate(RATE_LIMIT_PROBE).await {
            Ok(value) if value.as_bool() == Some(true) => {
                return PhaseOutcome::fail(BrowserError::RateLimited(format!(
                    "throttling page served for {settled}"
                )));
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "rate-limit probe failed"),
        }
        PhaseOutcome::ok()
    }

    fn is_auth_redirect(&self, settled: &str) -> bool {
        if let Some(login_url) = &self.config.auth.login_url {
            if settled.starts_with(login_url.trim_end_matches('/')) {
                return true;
            }
        }
        let lower = settled.to_lowercase();
        lower.contains("/login") || lower.contains("/signin") || lower.contains("/sign-in")
    }

    /// Minimum rendered content is a hard requirement; landmark, spinner
    /// and mutation-quiet checks are advisory and only cost their timeout.
    async fn stabilization(
        &self,
        page: &dyn BrowserPage,
        ctx: &mut ExplorationContext,
    ) -> PhaseOutcome {
        let cfg = &self.config.stabilization;
        let poll = Duration::from_millis(cfg.poll_interval_ms);

        let content_script = format!(
            "((document.body && document.body.innerText) || '').length >= {}",
            cfg.min_content_chars
        );
        match page
            .wait_for_function(
                &content_script,
                Duration::from_millis(cfg.content_timeout_ms),
                poll,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return PhaseOutcome::fail(BrowserError::Timeout(format!(
                    "page never reached {} chars of content",
                    cfg.min_content_chars
                )));
            }
            Err(err) => return PhaseOutcome::fail(err),
        }

        match page
            .wait_for_selector(
                &cfg.landmark_selector,
                Duration::from_millis(cfg.landmark_timeout_ms),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(url = %ctx.job.url, "no navigation landmark appeared"),
            Err(err) => warn!(error = %err, "landmark wait failed"),
        }

        if !cfg.loading_selectors.is_empty() {
            let joined = cfg.loading_selectors.join(", ");
            let spinner_script = format!(
                "(() => {{\n\
                     const els = document.querySelectorAll({selector});\n\
                     return Array.from(els).every((el) => {{\n\
                         const style = window.getComputedStyle(el);\n\
                         return style.display === 'none' || style.visibility === 'hidden';\n\
                     }});\n\
                 }})()",
                selector = serde_json::to_string(&joined).unwrap_or_else(|_| "\"\"".into()),
            );
            match page
                .wait_for_function(
                    &spinner_script,
                    Duration::from_millis(cfg.loading_timeout_ms),
                    poll,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(url = %ctx.job.url, "loading indicator still visible"),
                Err(err) => warn!(error = %err, "spinner wait failed"),
            }
        }

        if let Err(err) = self.wait_for_mutation_quiet(page, ctx).await {
            warn!(error = %err, "mutation quiet wait failed");
        }
        PhaseOutcome::ok()
    }

    async fn wait_for_mutation_quiet(
        &self,
        page: &dyn BrowserPage,
        ctx: &ExplorationContext,
    ) -> crate::browser::BrowserResult<()> {
        let cfg = &self.config.stabilization;
        page.evaluate(MUTATION_COUNTER_SCRIPT).await?;
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(cfg.max_quiet_wait_ms);
        let mut last_count = -1.0f64;
        while tokio::time::Instant::now() < deadline {
            let raw = page.evaluate("window.__scoutMutations || 0").await?;
            let count = raw.as_f64().unwrap_or(0.0);
            if (count - last_count).abs() < f64::EPSILON && last_count >= 0.0 {
                return Ok(());
            }
            last_count = count;
            tokio::time::sleep(Duration::from_millis(cfg.quiet_window_ms)).await;
        }
        debug!(url = %ctx.job.url, "dom never went quiet within bound");
        Ok(())
    }

    /// A failed screenshot degrades the artifact, not the visit.
    async fn capture(&self, page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> PhaseOutcome {
        match page.screenshot().await {
            Ok(bytes) => ctx.results.screenshot_bytes = Some(bytes),
            Err(err) => warn!(url = %ctx.job.url, error = %err, "screenshot failed"),
        }
        PhaseOutcome::ok()
    }

    /// Gates deep exploration on the run-scoped layout set: the first visit
    /// to a layout gets the full pass, later visits a light harvest. Under
    /// `layout-changed` the layout is judged per URL, so a page keeps
    /// earning full passes until its own layout stops changing; `always`
    /// forces a full pass regardless.
    async fn discovery(
        &self,
        page: &dyn BrowserPage,
        ctx: &mut ExplorationContext,
    ) -> PhaseOutcome {
        let first_layout = match ctx.ui_hasher.capture(page).await {
            Ok(hash) => {
                ctx.results.ui_hash = Some(hash.clone());
                let key = match self.config.crawl.revisit {
                    RevisitPolicy::LayoutChanged => format!("{}|{hash}", ctx.job.url),
                    _ => hash,
                };
                ctx.seen_layouts.lock().await.insert(key)
            }
            Err(err) => {
                warn!(error = %err, "ui hash capture failed, assuming new layout");
                true
            }
        };
        let full = first_layout || self.config.crawl.revisit == RevisitPolicy::Always;
        ctx.results.full_discovery = full;

        let outcome = if full {
            discovery::run_full(page, ctx).await
        } else {
            debug!(url = %ctx.job.url, "layout already explored, light discovery");
            discovery::run_light(page, ctx).await
        };
        match outcome {
            Ok(()) => PhaseOutcome::ok(),
            Err(err) => PhaseOutcome::fail(err),
        }
    }

    async fn extraction(
        &self,
        page: &dyn BrowserPage,
        ctx: &mut ExplorationContext,
    ) -> PhaseOutcome {
        let inventory = match extraction::extract_inventory(page).await {
            Ok(inventory) => inventory,
            Err(err) => return PhaseOutcome::fail(err),
        };
        let interactive = inventory.elements.len();
        ctx.results.signals = PageSignals {
            url: ctx.results.settled_url.clone(),
            title: inventory.title.clone(),
            last_action_label: ctx
                .job
                .action_chain
                .last()
                .map(|record| record.label.clone()),
            total_elements: inventory.total_elements,
            interactive_elements: interactive,
            text_length: inventory.text_length,
            broken_images: inventory.broken_images,
            loading_indicator_visible: inventory.loading_visible,
            error_ui_visible: inventory.error_visible,
        };
        ctx.results.page_title = inventory.title;
        ctx.results.elements = inventory.elements;
        PhaseOutcome::ok()
    }
}
