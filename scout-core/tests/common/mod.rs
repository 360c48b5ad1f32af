use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use scout_core::browser::{BrowserElement, BrowserPage, BrowserResult};

/// Scripted page: serves a fixed inventory and link set, enough to drive
/// the whole pipeline without a browser.
pub struct FakePage {
    pub current_url: Mutex<String>,
    pub title: String,
    pub links: Vec<Value>,
    pub skeleton: Vec<Value>,
    pub error_visible: bool,
    pub tabs: Vec<Arc<FakeTab>>,
}

impl FakePage {
    pub fn new(title: &str) -> Self {
        Self {
            current_url: Mutex::new(String::new()),
            title: title.to_string(),
            links: Vec::new(),
            skeleton: vec![
                json!({"tag": "nav", "role": "navigation", "input_type": "", "classes": []}),
                json!({"tag": "main", "role": "", "input_type": "", "classes": ["content"]}),
            ],
            error_visible: false,
            tabs: Vec::new(),
        }
    }

    pub fn with_links(mut self, links: Vec<Value>) -> Self {
        self.links = links;
        self
    }

    pub fn with_tabs(mut self, labels: &[&str]) -> Self {
        self.tabs = labels
            .iter()
            .map(|label| {
                Arc::new(FakeTab {
                    label: label.to_string(),
                    clicks: AtomicUsize::new(0),
                })
            })
            .collect();
        self
    }
}

/// A clickable tab element; clicks are counted so tests can assert the
/// discovery sweep actually drove it.
pub struct FakeTab {
    pub label: String,
    pub clicks: AtomicUsize,
}

struct FakeTabHandle(Arc<FakeTab>);

#[async_trait]
impl BrowserElement for FakeTabHandle {
    async fn click(&self) -> BrowserResult<()> {
        self.0.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn click_at_center(&self) -> BrowserResult<()> {
        Ok(())
    }

    async fn fill(&self, _value: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn type_text(&self, _text: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn select_value(&self, _value: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn focus(&self) -> BrowserResult<()> {
        Ok(())
    }

    async fn press_key(&self, _key: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn is_checked(&self) -> BrowserResult<bool> {
        Ok(false)
    }

    async fn attribute(&self, name: &str) -> BrowserResult<Option<String>> {
        if name == "aria-label" {
            Ok(Some(self.0.label.clone()))
        } else {
            Ok(None)
        }
    }

    async fn inner_text(&self) -> BrowserResult<Option<String>> {
        Ok(None)
    }

    async fn bounding_box(&self) -> BrowserResult<Option<scout_core::browser::ElementBounds>> {
        Ok(None)
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        *self.current_url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.current_url.lock().unwrap().clone())
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        if script.contains("too many requests") {
            return Ok(Value::Bool(false));
        }
        if script.contains("MutationObserver") {
            return Ok(Value::Bool(true));
        }
        if script.contains("__scoutMutations") {
            return Ok(json!(0));
        }
        if script.contains("__scoutRoutes") {
            return Ok(json!([]));
        }
        if script.contains("createTreeWalker") {
            return Ok(Value::Array(self.skeleton.clone()));
        }
        if script.contains("in_nav") {
            return Ok(Value::Array(self.links.clone()));
        }
        if script.contains("total_elements") {
            return Ok(json!({
                "title": self.title,
                "total_elements": 64,
                "text_length": 2200,
                "broken_images": 0,
                "loading_visible": false,
                "error_visible": self.error_visible,
                "elements": [
                    {"kind": "button", "selector": "#refresh", "label": "Refresh",
                     "href": null, "input_type": null, "disabled": false}
                ],
            }));
        }
        if script.contains("scrollBy") {
            return Ok(json!(0));
        }
        if script.contains("role=\"heading\"") {
            return Ok(Value::Null);
        }
        Ok(Value::Null)
    }

    async fn install_on_new_document(&self, _script: &str) -> BrowserResult<()> {
        Ok(())
    }

    async fn find_element(
        &self,
        _selector: &str,
    ) -> BrowserResult<Option<Box<dyn BrowserElement>>> {
        Ok(None)
    }

    async fn find_elements(&self, selector: &str) -> BrowserResult<Vec<Box<dyn BrowserElement>>> {
        if selector == "[role='tab']" {
            return Ok(self
                .tabs
                .iter()
                .map(|tab| Box::new(FakeTabHandle(Arc::clone(tab))) as Box<dyn BrowserElement>)
                .collect());
        }
        Ok(Vec::new())
    }

    async fn wait_for_selector(&self, _selector: &str, _timeout: Duration) -> BrowserResult<bool> {
        Ok(true)
    }

    async fn wait_for_function(
        &self,
        _script: &str,
        _timeout: Duration,
        _poll: Duration,
    ) -> BrowserResult<bool> {
        Ok(true)
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn cookie_value(&self, _name: &str) -> BrowserResult<Option<String>> {
        Ok(None)
    }

    async fn close(&self) -> BrowserResult<()> {
        Ok(())
    }
}
