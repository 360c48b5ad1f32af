use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::browser::{BrowserElement, BrowserError, BrowserPage, BrowserResult};
use crate::config::CommandSection;

const MASKED_VALUE: &str = "***";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Fill,
    Select,
    Check,
    Uncheck,
    Navigate,
}

/// Append-only log entry describing one action taken to reach a page.
/// Propagated to child jobs so downstream consumers can reconstruct the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub selector: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub url: String,
}

impl ActionRecord {
    pub fn navigation(url: &str) -> Self {
        Self {
            kind: ActionKind::Navigate,
            selector: String::new(),
            label: url.to_string(),
            value: None,
            timestamp: Utc::now(),
            url: url.to_string(),
        }
    }
}

pub type ActionChain = Vec<ActionRecord>;

/// How a `<select>` option is addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectTarget {
    Value(String),
    Label(String),
    Index(i64),
}

/// One UI action as a value object. Execution and fallback chains live in
/// `CommandExecutor`; the command itself only carries intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Click {
        selector: String,
        label: String,
    },
    Fill {
        selector: String,
        label: String,
        value: String,
        sensitive: bool,
    },
    Select {
        selector: String,
        label: String,
        target: SelectTarget,
    },
    SetChecked {
        selector: String,
        label: String,
        checked: bool,
    },
}

impl Command {
    pub fn kind(&self) -> ActionKind {
        match self {
            Command::Click { .. } => ActionKind::Click,
            Command::Fill { .. } => ActionKind::Fill,
            Command::Select { .. } => ActionKind::Select,
            Command::SetChecked { checked: true, .. } => ActionKind::Check,
            Command::SetChecked { checked: false, .. } => ActionKind::Uncheck,
        }
    }

    pub fn selector(&self) -> &str {
        match self {
            Command::Click { selector, .. }
            | Command::Fill { selector, .. }
            | Command::Select { selector, .. }
            | Command::SetChecked { selector, .. } => selector,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Command::Click { label, .. }
            | Command::Fill { label, .. }
            | Command::Select { label, .. }
            | Command::SetChecked { label, .. } => label,
        }
    }

    /// Whether executing this command should be followed by a state check.
    fn wants_validation(&self) -> bool {
        !matches!(self, Command::Click { .. })
    }

    fn is_sensitive(&self) -> bool {
        match self {
            Command::Fill {
                sensitive,
                selector,
                label,
                ..
            } => {
                *sensitive
                    || looks_sensitive(selector)
                    || looks_sensitive(label)
            }
            _ => false,
        }
    }

    pub fn to_record(&self, url: &str) -> ActionRecord {
        let value = match self {
            Command::Fill { value, .. } => {
                if self.is_sensitive() {
                    Some(MASKED_VALUE.to_string())
                } else {
                    Some(value.clone())
                }
            }
            Command::Select { target, .. } => Some(match target {
                SelectTarget::Value(value) => value.clone(),
                SelectTarget::Label(label) => label.clone(),
                SelectTarget::Index(index) => index.to_string(),
            }),
            Command::SetChecked { checked, .. } => Some(checked.to_string()),
            Command::Click { .. } => None,
        };
        ActionRecord {
            kind: self.kind(),
            selector: self.selector().to_string(),
            label: self.label().to_string(),
            value,
            timestamp: Utc::now(),
            url: url.to_string(),
        }
    }
}

fn looks_sensitive(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("password") || lower.contains("secret") || lower.contains("token")
}

/// Executes commands with bounded retry and post-action validation.
///
/// A validation failure counts the same as an execution failure and triggers
/// a retry; after retries are exhausted the last error propagates and the
/// caller decides whether the visit continues.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    max_retries: usize,
    retry_delay: Duration,
}

impl CommandExecutor {
    pub fn new(config: &CommandSection) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Runs `command` against `page`, appending its record to `chain` before
    /// anything is attempted so the chain reflects attempted actions even
    /// when every attempt fails. The element is re-located on every attempt.
    pub async fn execute(
        &self,
        page: &dyn BrowserPage,
        command: &Command,
        chain: &mut ActionChain,
        url: &str,
    ) -> BrowserResult<()> {
        chain.push(command.to_record(url));

        let mut last_error: Option<BrowserError> = None;
        for attempt in 1..=self.max_retries + 1 {
            let attempted = match require_element(page, command.selector()).await {
                Ok(element) => self.execute_once(page, element.as_ref(), command).await,
                Err(err) => Err(err),
            };
            match self.check_attempt(page, command, attempt, attempted).await? {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
            if attempt <= self.max_retries {
                sleep(self.retry_delay).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| BrowserError::Action("command failed without error".into())))
    }

    /// Like [`execute`](Self::execute), but runs against an element the
    /// caller already holds. Discovery probes iterate `find_elements`
    /// results, where re-locating by selector would always hit the first
    /// match.
    pub async fn execute_on(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        command: &Command,
        chain: &mut ActionChain,
        url: &str,
    ) -> BrowserResult<()> {
        chain.push(command.to_record(url));

        let mut last_error: Option<BrowserError> = None;
        for attempt in 1..=self.max_retries + 1 {
            let attempted = self.execute_once(page, element, command).await;
            match self.check_attempt(page, command, attempt, attempted).await? {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
            if attempt <= self.max_retries {
                sleep(self.retry_delay).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| BrowserError::Action("command failed without error".into())))
    }

    /// Folds one attempt's outcome with post-action validation. The outer
    /// `Result` carries validation probe errors, the inner one the attempt
    /// verdict.
    async fn check_attempt(
        &self,
        page: &dyn BrowserPage,
        command: &Command,
        attempt: usize,
        attempted: BrowserResult<()>,
    ) -> BrowserResult<Result<(), BrowserError>> {
        match attempted {
            Ok(()) => {
                if !command.wants_validation() || self.validate(page, command).await? {
                    return Ok(Ok(()));
                }
                warn!(
                    label = command.label(),
                    attempt, "command validation failed"
                );
                Ok(Err(BrowserError::Action(format!(
                    "validation failed for {:?} on {}",
                    command.kind(),
                    command.selector()
                ))))
            }
            Err(err) => {
                warn!(
                    label = command.label(),
                    attempt,
                    error = %err,
                    "command attempt failed"
                );
                Ok(Err(err))
            }
        }
    }

    async fn execute_once(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        command: &Command,
    ) -> BrowserResult<()> {
        match command {
            Command::Click { selector, .. } => self.click(page, element, selector).await,
            Command::Fill {
                selector, value, ..
            } => self.fill(page, element, selector, value).await,
            Command::Select {
                selector, target, ..
            } => self.select(page, element, selector, target).await,
            Command::SetChecked {
                selector, checked, ..
            } => self.set_checked(page, element, selector, *checked).await,
        }
    }

    /// Native click, then coordinate click, then a raw DOM event.
    async fn click(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        selector: &str,
    ) -> BrowserResult<()> {
        match element.click().await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(selector, error = %err, "native click failed, trying coordinates"),
        }
        match element.click_at_center().await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(selector, error = %err, "coordinate click failed, trying DOM event"),
        }
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); if (!el) return false; el.click(); return true; }})()",
            sel = js_string(selector)
        );
        if is_truthy(&page.evaluate(&script).await?) {
            Ok(())
        } else {
            Err(BrowserError::Action(format!(
                "all click strategies failed for {selector}"
            )))
        }
    }

    /// Value fill, then keyboard typing, then a raw value assignment.
    async fn fill(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        selector: &str,
        value: &str,
    ) -> BrowserResult<()> {
        match element.fill(value).await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(selector, error = %err, "fill failed, trying keyboard typing"),
        }
        match element.type_text(value).await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(selector, error = %err, "typing failed, trying raw value set"),
        }
        let script = format!(
            "(() => {{\n\
                 const el = document.querySelector({sel});\n\
                 if (!el) return false;\n\
                 el.value = {val};\n\
                 el.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
                 el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
                 return true;\n\
             }})()",
            sel = js_string(selector),
            val = js_string(value)
        );
        if is_truthy(&page.evaluate(&script).await?) {
            Ok(())
        } else {
            Err(BrowserError::Action(format!(
                "all fill strategies failed for {selector}"
            )))
        }
    }

    /// Select by value/label/index, falling back to keyboard navigation.
    /// The keyboard fallback presses "next option" exactly `index + 1` times
    /// for a non-negative index and once otherwise.
    async fn select(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        selector: &str,
        target: &SelectTarget,
    ) -> BrowserResult<()> {
        let resolved = match target {
            SelectTarget::Value(value) => Some(value.clone()),
            SelectTarget::Label(label) => {
                self.resolve_option_value(page, selector, &format!("o.label === {}", js_string(label)))
                    .await?
            }
            SelectTarget::Index(index) if *index >= 0 => {
                self.resolve_option_value(page, selector, &format!("i === {index}"))
                    .await?
            }
            SelectTarget::Index(_) => None,
        };
        if let Some(value) = resolved {
            match element.select_value(&value).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(selector, error = %err, "select by value failed, trying keyboard")
                }
            }
        }

        element.focus().await?;
        let presses = match target {
            SelectTarget::Index(index) if *index >= 0 => (*index as usize) + 1,
            _ => 1,
        };
        for _ in 0..presses {
            element.press_key("ArrowDown").await?;
        }
        element.press_key("Enter").await?;
        Ok(())
    }

    async fn resolve_option_value(
        &self,
        page: &dyn BrowserPage,
        selector: &str,
        predicate: &str,
    ) -> BrowserResult<Option<String>> {
        let script = format!(
            "(() => {{\n\
                 const el = document.querySelector({sel});\n\
                 if (!el || !el.options) return null;\n\
                 const match = Array.from(el.options).find((o, i) => {predicate});\n\
                 return match ? match.value : null;\n\
             }})()",
            sel = js_string(selector),
        );
        match page.evaluate(&script).await? {
            serde_json::Value::String(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Reads current state first so a retried toggle never double-fires.
    async fn set_checked(
        &self,
        page: &dyn BrowserPage,
        element: &dyn BrowserElement,
        selector: &str,
        desired: bool,
    ) -> BrowserResult<()> {
        if element.is_checked().await? == desired {
            return Ok(());
        }
        match element.click().await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(selector, error = %err, "toggle click failed, trying raw set"),
        }
        let script = format!(
            "(() => {{\n\
                 const el = document.querySelector({sel});\n\
                 if (!el) return false;\n\
                 el.checked = {desired};\n\
                 el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
                 return true;\n\
             }})()",
            sel = js_string(selector),
        );
        if is_truthy(&page.evaluate(&script).await?) {
            Ok(())
        } else {
            Err(BrowserError::Action(format!(
                "all toggle strategies failed for {selector}"
            )))
        }
    }

    async fn validate(&self, page: &dyn BrowserPage, command: &Command) -> BrowserResult<bool> {
        match command {
            Command::Click { .. } => Ok(true),
            Command::Fill {
                selector,
                value,
                sensitive,
                ..
            } => {
                // Sensitive fields are not read back.
                if *sensitive || self.read_value(page, selector).await?.as_deref() == Some(value) {
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Command::Select {
                selector, target, ..
            } => match target {
                SelectTarget::Value(value) => {
                    Ok(self.read_value(page, selector).await?.as_deref() == Some(value))
                }
                // Label and index targets were already resolved best-effort.
                _ => Ok(true),
            },
            Command::SetChecked {
                selector, checked, ..
            } => match page.find_element(selector).await? {
                Some(element) => Ok(element.is_checked().await? == *checked),
                None => Ok(false),
            },
        }
    }

    async fn read_value(
        &self,
        page: &dyn BrowserPage,
        selector: &str,
    ) -> BrowserResult<Option<String>> {
        let script = format!(
            "(() => {{ const el = document.querySelector({sel}); return el ? el.value : null; }})()",
            sel = js_string(selector)
        );
        match page.evaluate(&script).await? {
            serde_json::Value::String(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }
}

async fn require_element(
    page: &dyn BrowserPage,
    selector: &str,
) -> BrowserResult<Box<dyn BrowserElement>> {
    page.find_element(selector)
        .await?
        .ok_or_else(|| BrowserError::ElementNotFound(selector.to_string()))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(flag) => *flag,
        serde_json::Value::Null => false,
        _ => true,
    }
}
