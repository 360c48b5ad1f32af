use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::command::{ActionChain, CommandExecutor};
use crate::config::ScoutConfig;
use crate::fingerprint::UiHasher;
use crate::queue::ScrapeJob;
use crate::scoring::PageSignals;

/// Where a discovered link came from. Sidebar links feed back into the
/// queue at elevated priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    Sidebar,
    Menu,
    Tab,
    Modal,
    Body,
    Pagination,
    RouteObserver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub url: String,
    pub label_path: Vec<String>,
    pub source: LinkSource,
}

/// A dialog or drawer surfaced without a URL change, keyed by content hash
/// so the same modal reached through different triggers is captured once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalDiscovery {
    pub content_hash: String,
    pub title: Option<String>,
    pub trigger_label: String,
    pub elements: Vec<PageElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageElement {
    pub kind: String,
    pub selector: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Per-visit discovery trackers. These were once process-wide in older
/// crawler designs; keeping them on the context means concurrent workers
/// cannot corrupt each other's state.
#[derive(Debug, Default)]
pub struct ExplorationState {
    pub expanded_buttons: HashSet<String>,
    pub visited_sidebar: HashSet<String>,
    pub modal_hashes: HashSet<String>,
}

/// Everything a page visit produced. Screenshot bytes stay transient; the
/// artifact store persists them separately.
#[derive(Debug, Default)]
pub struct ExplorationResults {
    pub page_title: Option<String>,
    pub settled_url: String,
    pub ui_hash: Option<String>,
    pub full_discovery: bool,
    pub elements: Vec<PageElement>,
    pub discovered_links: Vec<DiscoveredLink>,
    pub sidebar_links: Vec<DiscoveredLink>,
    pub modal_discoveries: Vec<ModalDiscovery>,
    pub screenshot_bytes: Option<Vec<u8>>,
    pub signals: PageSignals,
}

/// One instance per job, threaded through every pipeline phase.
pub struct ExplorationContext {
    pub job: ScrapeJob,
    pub config: Arc<ScoutConfig>,
    pub state: ExplorationState,
    pub results: ExplorationResults,
    pub chain: ActionChain,
    pub executor: CommandExecutor,
    pub ui_hasher: UiHasher,
    /// Run-scoped layout dedup shared across workers; gates light vs full
    /// discovery.
    pub seen_layouts: Arc<Mutex<HashSet<String>>>,
}

impl ExplorationContext {
    pub fn new(
        job: ScrapeJob,
        config: Arc<ScoutConfig>,
        seen_layouts: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        let chain = job.action_chain.clone();
        let executor = CommandExecutor::new(&config.command);
        Self {
            job,
            config,
            state: ExplorationState::default(),
            results: ExplorationResults::default(),
            chain,
            executor,
            ui_hasher: UiHasher::new(),
            seen_layouts,
        }
    }

    pub fn last_action_label(&self) -> Option<String> {
        self.chain.last().map(|record| record.label.clone())
    }

    pub fn push_link(&mut self, link: DiscoveredLink) {
        let exists = |links: &[DiscoveredLink]| links.iter().any(|known| known.url == link.url);
        if exists(&self.results.discovered_links) || exists(&self.results.sidebar_links) {
            return;
        }
        if link.source == LinkSource::Sidebar {
            self.results.sidebar_links.push(link);
        } else {
            self.results.discovered_links.push(link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoutConfig;

    fn context() -> ExplorationContext {
        let config = ScoutConfig::for_url("https://x.com/app");
        ExplorationContext::new(
            ScrapeJob::seed("https://x.com/app"),
            Arc::new(config),
            Arc::new(Mutex::new(HashSet::new())),
        )
    }

    fn link(url: &str, source: LinkSource) -> DiscoveredLink {
        DiscoveredLink {
            url: url.to_string(),
            label_path: vec!["Reports".to_string()],
            source,
        }
    }

    #[test]
    fn duplicate_links_are_kept_once_across_buckets() {
        let mut ctx = context();
        ctx.push_link(link("https://x.com/app/a", LinkSource::Sidebar));
        ctx.push_link(link("https://x.com/app/a", LinkSource::Body));
        assert_eq!(ctx.results.sidebar_links.len(), 1);
        assert!(ctx.results.discovered_links.is_empty());
    }

    #[test]
    fn sidebar_links_are_bucketed_separately() {
        let mut ctx = context();
        ctx.push_link(link("https://x.com/app/a", LinkSource::Sidebar));
        ctx.push_link(link("https://x.com/app/b", LinkSource::Tab));
        assert_eq!(ctx.results.sidebar_links.len(), 1);
        assert_eq!(ctx.results.discovered_links.len(), 1);
    }
}
