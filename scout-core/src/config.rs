use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Top-level configuration for a crawl run, loaded from `scout.toml`.
///
/// Every section carries a `Default` so a minimal config file only needs
/// `[crawl] start_url = "..."`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoutConfig {
    pub crawl: CrawlSection,
    #[serde(default)]
    pub chromium: ChromiumSection,
    #[serde(default)]
    pub stabilization: StabilizationSection,
    #[serde(default)]
    pub command: CommandSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub scoring: ScoringSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
}

impl ScoutConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.artifacts.base_dir).join(path)
        }
    }

    /// Minimal config for the given start URL, everything else defaulted.
    pub fn for_url(start_url: impl Into<String>) -> Self {
        Self {
            crawl: CrawlSection {
                start_url: start_url.into(),
                ..CrawlSection::default()
            },
            chromium: ChromiumSection::default(),
            stabilization: StabilizationSection::default(),
            command: CommandSection::default(),
            discovery: DiscoverySection::default(),
            scoring: ScoringSection::default(),
            auth: AuthSection::default(),
            rate_limit: RateLimitSection::default(),
            artifacts: ArtifactsSection::default(),
            observability: ObservabilitySection::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.crawl.start_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "crawl.start_url".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.crawl.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "crawl.concurrency".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.scoring.visual_weight + self.scoring.stability_weight + self.scoring.functional_weight
            <= 0.0
        {
            return Err(ConfigError::Invalid {
                field: "scoring".into(),
                reason: "sub-score weights must sum to a positive value".into(),
            });
        }
        Ok(())
    }
}

/// Queue ordering policy. `PriorityQueue` sorts by priority then depth,
/// `ScopedFifo` preserves insertion order within the crawl scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    PriorityQueue,
    ScopedFifo,
}

/// Whether a URL-visited page may re-run full discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisitPolicy {
    Never,
    LayoutChanged,
    Always,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlSection {
    pub start_url: String,
    /// Discovered URLs must extend this path to stay in scope. Derived from
    /// the start URL when absent.
    pub base_path: Option<String>,
    pub max_depth: u32,
    pub page_limit: usize,
    pub concurrency: usize,
    pub force: bool,
    pub resume: bool,
    pub queue_policy: QueuePolicy,
    pub revisit: RevisitPolicy,
    /// Base dispatch jitter range in milliseconds.
    pub jitter_ms: [u64; 2],
    /// Jitter range applied while recovering from a rate-limit event.
    pub backoff_jitter_ms: [u64; 2],
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            base_path: None,
            max_depth: 3,
            page_limit: 100,
            concurrency: 2,
            force: false,
            resume: false,
            queue_policy: QueuePolicy::PriorityQueue,
            revisit: RevisitPolicy::Never,
            jitter_ms: [200, 900],
            backoff_jitter_ms: [1_500, 4_000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub viewport: [u32; 2],
    pub nav_timeout_seconds: u64,
    pub user_agent: Option<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: true,
            disable_gpu: true,
            viewport: [1440, 900],
            nav_timeout_seconds: 30,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StabilizationSection {
    /// Minimum rendered text length before the page counts as "has content".
    pub min_content_chars: usize,
    pub content_timeout_ms: u64,
    pub landmark_selector: String,
    pub landmark_timeout_ms: u64,
    pub loading_selectors: Vec<String>,
    pub loading_timeout_ms: u64,
    /// Quiet window with no DOM mutations before the page counts as settled.
    pub quiet_window_ms: u64,
    pub max_quiet_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for StabilizationSection {
    fn default() -> Self {
        Self {
            min_content_chars: 200,
            content_timeout_ms: 10_000,
            landmark_selector: "nav, [role='navigation'], aside, [data-testid='sidebar']".into(),
            landmark_timeout_ms: 4_000,
            loading_selectors: vec![
                ".spinner".into(),
                "[aria-busy='true']".into(),
                "[class*='loading']".into(),
                "[data-loading='true']".into(),
            ],
            loading_timeout_ms: 8_000,
            quiet_window_ms: 500,
            max_quiet_wait_ms: 5_000,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub sidebar_selector: String,
    pub menu_button_selectors: Vec<String>,
    pub tab_selectors: Vec<String>,
    pub row_selectors: Vec<String>,
    /// Dropdowns treated as data filters during control probing.
    pub dropdown_selectors: Vec<String>,
    /// Checkboxes, radios and switches probed (and restored) during discovery.
    pub toggle_selectors: Vec<String>,
    pub action_button_selectors: Vec<String>,
    pub pagination_selectors: Vec<String>,
    pub view_all_labels: Vec<String>,
    pub modal_selector: String,
    pub modal_close_selectors: Vec<String>,
    pub max_menu_expansions: usize,
    pub max_tabs: usize,
    pub max_rows_probed: usize,
    pub max_controls_probed: usize,
    pub max_scroll_steps: usize,
    pub max_pagination_steps: usize,
    pub settle_delay_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            sidebar_selector: "nav a, aside a, [role='navigation'] a".into(),
            menu_button_selectors: vec![
                "[aria-haspopup='true']".into(),
                "[aria-expanded='false']".into(),
                "button[class*='menu']".into(),
            ],
            tab_selectors: vec!["[role='tab']".into(), ".tab:not(.active)".into()],
            row_selectors: vec!["table tbody tr".into(), "[role='row']".into()],
            dropdown_selectors: vec!["select".into()],
            toggle_selectors: vec![
                "input[type='checkbox']".into(),
                "input[type='radio']".into(),
                "[role='switch']".into(),
            ],
            action_button_selectors: vec![
                "button[class*='action']".into(),
                "[data-testid*='action']".into(),
            ],
            pagination_selectors: vec![
                "[aria-label='Next page']".into(),
                ".pagination .next:not(.disabled)".into(),
            ],
            view_all_labels: vec!["view all".into(), "see all".into(), "show all".into()],
            modal_selector: "[role='dialog'], .modal.show, .drawer.open".into(),
            modal_close_selectors: vec![
                "[aria-label='Close']".into(),
                "[role='dialog'] button.close".into(),
            ],
            max_menu_expansions: 12,
            max_tabs: 8,
            max_rows_probed: 3,
            max_controls_probed: 6,
            max_scroll_steps: 5,
            max_pagination_steps: 3,
            settle_delay_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringSection {
    pub visual_weight: f64,
    pub stability_weight: f64,
    pub functional_weight: f64,
    /// Total score ceiling when an explicit error UI is visible.
    pub error_ceiling: f64,
    pub min_elements: usize,
    pub min_text_chars: usize,
    /// Fraction of near-uniform pixels above which a screenshot counts blank.
    pub blank_pixel_ratio: f64,
    pub stable_confidence_floor: f64,
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            visual_weight: 0.3,
            stability_weight: 0.4,
            functional_weight: 0.3,
            error_ceiling: 20.0,
            min_elements: 5,
            min_text_chars: 80,
            blank_pixel_ratio: 0.98,
            stable_confidence_floor: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub login_url: Option<String>,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Present once a session is live; used to verify an existing session.
    pub landmark_selector: String,
    pub access_token_key: String,
    pub refresh_token_key: String,
    pub expires_at_key: String,
    pub session_cookie: Option<String>,
    pub refresh_endpoint: Option<String>,
    pub token_poll_interval_ms: u64,
    pub token_poll_attempts: usize,
    pub lock_path: String,
    /// Tokens are refreshed this many seconds before their recorded expiry.
    pub refresh_slack_seconds: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            login_url: None,
            username_selector: "input[name='username'], input[type='email']".into(),
            password_selector: "input[type='password']".into(),
            submit_selector: "button[type='submit']".into(),
            landmark_selector: "[data-testid='dashboard'], nav".into(),
            access_token_key: "access_token".into(),
            refresh_token_key: "refresh_token".into(),
            expires_at_key: "expires_at".into(),
            session_cookie: None,
            refresh_endpoint: None,
            token_poll_interval_ms: 500,
            token_poll_attempts: 20,
            lock_path: "scout-session.lock".into(),
            refresh_slack_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub cooldown_seconds: u64,
    /// Escalated cooldown after `deep_sleep_threshold` rapid consecutive hits.
    pub deep_sleep_seconds: u64,
    pub deep_sleep_threshold: u32,
    /// Hits closer together than this count as "rapid".
    pub rapid_window_seconds: u64,
    /// Successes required before one concurrency slot is restored.
    pub restore_success_streak: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            cooldown_seconds: 60,
            deep_sleep_seconds: 600,
            deep_sleep_threshold: 3,
            rapid_window_seconds: 120,
            restore_success_streak: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub base_dir: String,
    pub output_dir: String,
    pub screenshots_dir: String,
    pub checkpoint_dir: String,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            output_dir: "artifacts/pages".into(),
            screenshots_dir: "artifacts/screenshots".into(),
            checkpoint_dir: "artifacts/checkpoints".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub metrics_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            failure_log: "artifacts/failures.log".into(),
            metrics_db: "artifacts/metrics.sqlite".into(),
        }
    }
}

pub fn load_scout_config<P: AsRef<Path>>(path: P) -> Result<ScoutConfig> {
    let config: ScoutConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: ScoutConfig = toml::from_str(
            r#"
            [crawl]
            start_url = "https://app.example.com/app"
            max_depth = 4
            "#,
        )
        .expect("config should parse");
        assert_eq!(config.crawl.start_url, "https://app.example.com/app");
        assert_eq!(config.crawl.max_depth, 4);
        assert_eq!(config.crawl.concurrency, 2);
        assert_eq!(config.command.max_retries, 3);
        assert_eq!(config.command.retry_delay_ms, 500);
        assert_eq!(config.crawl.queue_policy, QueuePolicy::PriorityQueue);
        assert_eq!(config.crawl.revisit, RevisitPolicy::Never);
    }

    #[test]
    fn queue_policy_accepts_kebab_case() {
        let config: ScoutConfig = toml::from_str(
            r#"
            [crawl]
            start_url = "https://x.com"
            queue_policy = "scoped-fifo"
            revisit = "layout-changed"
            "#,
        )
        .unwrap();
        assert_eq!(config.crawl.queue_policy, QueuePolicy::ScopedFifo);
        assert_eq!(config.crawl.revisit, RevisitPolicy::LayoutChanged);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = ScoutConfig::for_url("https://x.com");
        config.crawl.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
