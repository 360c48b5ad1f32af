use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};
use super::page::{BrowserElement, BrowserPage, ElementBounds, PageFactory};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Chromium-backed implementation of the page capability, adapted to run
/// one tab per crawl worker.
#[derive(Debug)]
pub struct CdpBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: ChromiumSection,
}

impl CdpBrowser {
    pub async fn launch(config: ChromiumSection) -> BrowserResult<Self> {
        let chromium_config = build_chromium_config(&config)?;
        info!(
            headless = config.headless,
            width = config.viewport[0],
            height = config.viewport[1],
            "Launching Chromium instance"
        );
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task: Some(handler_task),
            config,
        })
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }

    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        if let Some(user_agent) = &self.config.user_agent {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(user_agent.clone())
                .build()
                .map_err(BrowserError::Configuration)?;
            page.set_user_agent(params).await?;
        }
        Ok(())
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("CdpBrowser dropped without explicit shutdown");
            }
        }
    }
}

#[async_trait]
impl PageFactory for CdpBrowser {
    async fn new_page(&self) -> BrowserResult<Arc<dyn BrowserPage>> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;
        self.configure_page(&page).await?;
        Ok(Arc::new(CdpPage { page }))
    }
}

fn build_chromium_config(config: &ChromiumSection) -> BrowserResult<ChromiumConfig> {
    let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
        width: config.viewport[0],
        height: config.viewport[1],
        device_scale_factor: Some(1.0),
        emulating_mobile: false,
        is_landscape: config.viewport[0] >= config.viewport[1],
        has_touch: false,
    });

    if let Some(executable) = &config.executable_path {
        builder = builder.chrome_executable(executable);
    }
    if !config.headless {
        builder = builder.with_head();
    }
    if !config.sandbox {
        builder = builder.no_sandbox();
    }
    builder = builder.request_timeout(Duration::from_secs(config.nav_timeout_seconds));

    let mut args = vec![format!(
        "--window-size={},{}",
        config.viewport[0], config.viewport[1]
    )];
    if config.disable_gpu {
        args.push("--disable-gpu".into());
    }
    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }
    args.push("--disable-background-timer-throttling".into());
    args.push("--password-store=basic".into());
    builder = builder.args(args);

    builder.build().map_err(BrowserError::Configuration)
}

/// One chromium tab.
pub struct CdpPage {
    page: Page,
}

#[async_trait]
impl BrowserPage for CdpPage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| BrowserError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| BrowserError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let url = self.page.url().await?;
        url.ok_or_else(|| BrowserError::Unexpected("page reported no url".into()))
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        self.page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?
            .into_value()
            .map_err(|err| BrowserError::Script(err.to_string()))
    }

    async fn install_on_new_document(&self, script: &str) -> BrowserResult<()> {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(script)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.evaluate_on_new_document(params).await?;
        Ok(())
    }

    async fn find_element(&self, selector: &str) -> BrowserResult<Option<Box<dyn BrowserElement>>> {
        match self.page.find_element(selector).await {
            Ok(element) => Ok(Some(Box::new(CdpElement {
                element,
                page: self.page.clone(),
            }))),
            Err(_) => Ok(None),
        }
    }

    async fn find_elements(&self, selector: &str) -> BrowserResult<Vec<Box<dyn BrowserElement>>> {
        let elements = self.page.find_elements(selector).await.unwrap_or_default();
        Ok(elements
            .into_iter()
            .map(|element| {
                Box::new(CdpElement {
                    element,
                    page: self.page.clone(),
                }) as Box<dyn BrowserElement>
            })
            .collect())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> BrowserResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_function(
        &self,
        script: &str,
        timeout: Duration,
        poll: Duration,
    ) -> BrowserResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.evaluate(script).await {
                Ok(value) if is_truthy(&value) => return Ok(true),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "wait_for_function evaluation failed"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(poll).await;
        }
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().build();
        self.page
            .screenshot(params)
            .await
            .map_err(|err| BrowserError::Screenshot(err.to_string()))
    }

    async fn cookie_value(&self, name: &str) -> BrowserResult<Option<String>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .find(|cookie| cookie.name == name)
            .map(|cookie| cookie.value))
    }

    async fn close(&self) -> BrowserResult<()> {
        if let Err(err) = self.page.clone().close().await {
            debug!(error = %err, "page close reported error");
        }
        Ok(())
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

struct CdpElement {
    element: Element,
    page: Page,
}

impl CdpElement {
    async fn call_bool_fn(&self, function: &str) -> BrowserResult<bool> {
        let result = self
            .element
            .call_js_fn(function, false)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        Ok(result
            .result
            .value
            .as_ref()
            .map(is_truthy)
            .unwrap_or(false))
    }

    async fn call_void_fn(&self, function: &str) -> BrowserResult<()> {
        self.element
            .call_js_fn(function, false)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BrowserElement for CdpElement {
    async fn click(&self) -> BrowserResult<()> {
        self.element
            .click()
            .await
            .map_err(|err| BrowserError::Action(format!("click failed: {err}")))?;
        Ok(())
    }

    async fn click_at_center(&self) -> BrowserResult<()> {
        let bounds = self
            .bounding_box()
            .await?
            .ok_or_else(|| BrowserError::Action("element has no bounding box".into()))?;
        let (x, y) = bounds.center();
        self.page
            .click(Point::new(x, y))
            .await
            .map_err(|err| BrowserError::Action(format!("coordinate click failed: {err}")))?;
        Ok(())
    }

    async fn fill(&self, value: &str) -> BrowserResult<()> {
        self.focus().await?;
        self.call_void_fn("function() { this.value = ''; }").await?;
        self.element
            .type_str(value)
            .await
            .map_err(|err| BrowserError::Action(format!("fill failed: {err}")))?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> BrowserResult<()> {
        self.focus().await?;
        self.element
            .type_str(text)
            .await
            .map_err(|err| BrowserError::Action(format!("typing failed: {err}")))?;
        Ok(())
    }

    async fn select_value(&self, value: &str) -> BrowserResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        let function = format!(
            "function() {{\n\
                 this.value = {encoded};\n\
                 this.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
                 this.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
                 return this.value === {encoded};\n\
             }}"
        );
        if self.call_bool_fn(&function).await? {
            Ok(())
        } else {
            Err(BrowserError::Action(format!(
                "select option {value:?} not applied"
            )))
        }
    }

    async fn focus(&self) -> BrowserResult<()> {
        self.element
            .focus()
            .await
            .map_err(|err| BrowserError::Action(format!("focus failed: {err}")))?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> BrowserResult<()> {
        self.element
            .press_key(key)
            .await
            .map_err(|err| BrowserError::Action(format!("key press {key:?} failed: {err}")))?;
        Ok(())
    }

    async fn is_checked(&self) -> BrowserResult<bool> {
        self.call_bool_fn("function() { return this.checked === true; }")
            .await
    }

    async fn attribute(&self, name: &str) -> BrowserResult<Option<String>> {
        self.element
            .attribute(name)
            .await
            .map_err(|err| BrowserError::Action(format!("attribute read failed: {err}")))
    }

    async fn inner_text(&self) -> BrowserResult<Option<String>> {
        self.element
            .inner_text()
            .await
            .map_err(|err| BrowserError::Action(format!("inner_text read failed: {err}")))
    }

    async fn bounding_box(&self) -> BrowserResult<Option<ElementBounds>> {
        match self.element.bounding_box().await {
            Ok(bounds) => Ok(Some(ElementBounds {
                x: bounds.x,
                y: bounds.y,
                width: bounds.width,
                height: bounds.height,
            })),
            Err(_) => Ok(None),
        }
    }
}
