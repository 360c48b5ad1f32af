use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use tokio::runtime::Runtime;

use scout_core::auth::Credentials;
use scout_core::browser::{CdpBrowser, PageFactory};
use scout_core::config::ScoutConfig;
use scout_core::runner::{CrawlSummary, Runner};

use crate::Result;

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Start URL; overrides the configured one
    #[arg(long)]
    pub url: Option<String>,

    /// Maximum link depth from the seed
    #[arg(long)]
    pub depth: Option<u32>,

    /// Stop after this many visited pages
    #[arg(long)]
    pub limit: Option<usize>,

    /// Concurrent workers (each owns one browser tab)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Run the browser headless (true) or with a visible window (false)
    #[arg(long)]
    pub headless: Option<bool>,

    /// Ignore any existing checkpoint and start fresh
    #[arg(long)]
    pub force: bool,

    /// Resume from the last checkpoint if one exists
    #[arg(long)]
    pub resume: bool,
}

pub fn exec(mut config: ScoutConfig, args: &CrawlArgs) -> Result<CrawlReport> {
    if let Some(url) = &args.url {
        config.crawl.start_url = url.clone();
    }
    if let Some(depth) = args.depth {
        config.crawl.max_depth = depth;
    }
    if let Some(limit) = args.limit {
        config.crawl.page_limit = limit;
    }
    if let Some(concurrency) = args.concurrency {
        config.crawl.concurrency = concurrency;
    }
    if let Some(headless) = args.headless {
        config.chromium.headless = headless;
    }
    config.crawl.force |= args.force;
    config.crawl.resume |= args.resume;

    // Credentials stay out of config files and argv.
    let credentials = match (
        std::env::var("SCOUT_USERNAME").ok(),
        std::env::var("SCOUT_PASSWORD").ok(),
    ) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        _ => None,
    };

    let config = Arc::new(config);
    let runtime = Runtime::new()?;
    let summary = runtime.block_on(async {
        let browser = Arc::new(CdpBrowser::launch(config.chromium.clone()).await?);
        let runner = Runner::new(Arc::clone(&config), credentials)?;

        let stop = runner.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::SeqCst);
            }
        });

        let factory: Arc<dyn PageFactory> = Arc::clone(&browser) as Arc<dyn PageFactory>;
        let result = runner.run(factory).await;
        if let Ok(browser) = Arc::try_unwrap(browser) {
            let _ = browser.shutdown().await;
        }
        result.map_err(crate::AppError::from)
    })?;
    Ok(CrawlReport(summary))
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct CrawlReport(pub CrawlSummary);

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run:               {}", self.0.run_id)?;
        writeln!(f, "pages visited:     {}", self.0.pages_visited)?;
        writeln!(f, "pages failed:      {}", self.0.pages_failed)?;
        writeln!(f, "rate-limit events: {}", self.0.rate_limit_events)?;
        writeln!(f, "queue remaining:   {}", self.0.queue_remaining)?;
        write!(f, "duration:          {}ms", self.0.duration_ms)
    }
}
