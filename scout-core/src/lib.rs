//! Core engine for authenticated single-page-app crawling: a priority
//! frontier with checkpoint/resume, a phase pipeline per page visit,
//! structural layout fingerprinting, page-quality scoring and a worker
//! pool governed by rate-limit backpressure.

pub mod artifact;
pub mod auth;
pub mod browser;
pub mod command;
pub mod config;
pub mod error;
pub mod explore;
pub mod fingerprint;
pub mod queue;
pub mod runner;
pub mod scoring;
pub mod stability;
pub mod telemetry;

pub use artifact::{ArtifactStore, PageArtifact};
pub use auth::{Credentials, SessionManager, SessionState, Tokens};
pub use browser::{BrowserElement, BrowserPage, CdpBrowser, PageFactory};
pub use command::{ActionChain, ActionRecord, Command, CommandExecutor};
pub use config::{load_scout_config, ScoutConfig};
pub use explore::{ExplorationContext, Pipeline};
pub use fingerprint::UiHasher;
pub use queue::{Checkpoint, JobPriority, QueueManager, ScrapeJob};
pub use runner::{CrawlSummary, RateGovernor, Runner};
pub use scoring::{PageScore, PageSignals, ScoringProcessor};
pub use stability::{GoldenPathVerdict, StabilityAnalyzer};
pub use telemetry::{CrawlTelemetry, TelemetrySummary};
