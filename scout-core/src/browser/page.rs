use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::BrowserResult;

/// Axis-aligned element bounds in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementBounds {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One located element on a live page.
///
/// The crawl engine never talks to a concrete driver directly; anything
/// implementing this capability set is substitutable (the production
/// implementation wraps chromiumoxide, tests use scripted fakes).
#[async_trait]
pub trait BrowserElement: Send + Sync {
    /// Native click with scroll-into-view semantics.
    async fn click(&self) -> BrowserResult<()>;
    /// Coordinate click at the element's bounding-box center.
    async fn click_at_center(&self) -> BrowserResult<()>;
    /// Clear-and-set value fill.
    async fn fill(&self, value: &str) -> BrowserResult<()>;
    /// Character-by-character keyboard typing.
    async fn type_text(&self, text: &str) -> BrowserResult<()>;
    /// Select a `<select>` option by its value attribute.
    async fn select_value(&self, value: &str) -> BrowserResult<()>;
    async fn focus(&self) -> BrowserResult<()>;
    async fn press_key(&self, key: &str) -> BrowserResult<()>;
    async fn is_checked(&self) -> BrowserResult<bool>;
    async fn attribute(&self, name: &str) -> BrowserResult<Option<String>>;
    async fn inner_text(&self) -> BrowserResult<Option<String>>;
    async fn bounding_box(&self) -> BrowserResult<Option<ElementBounds>>;
}

/// One browser tab owned by a single worker for the duration of a job.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    /// Settled URL after redirects and SPA rewrites.
    async fn current_url(&self) -> BrowserResult<String>;
    async fn evaluate(&self, script: &str) -> BrowserResult<Value>;
    /// Script installed before every document load on this page.
    async fn install_on_new_document(&self, script: &str) -> BrowserResult<()>;
    async fn find_element(&self, selector: &str) -> BrowserResult<Option<Box<dyn BrowserElement>>>;
    async fn find_elements(&self, selector: &str) -> BrowserResult<Vec<Box<dyn BrowserElement>>>;
    /// Polls for the selector; `Ok(false)` on timeout, never blocks forever.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> BrowserResult<bool>;
    /// Polls the script until it evaluates truthy; `Ok(false)` on timeout.
    async fn wait_for_function(
        &self,
        script: &str,
        timeout: Duration,
        poll: Duration,
    ) -> BrowserResult<bool>;
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;
    async fn cookie_value(&self, name: &str) -> BrowserResult<Option<String>>;
    async fn close(&self) -> BrowserResult<()>;
}

/// Hands out fresh page handles to workers.
#[async_trait]
pub trait PageFactory: Send + Sync {
    async fn new_page(&self) -> BrowserResult<Arc<dyn BrowserPage>>;
}
