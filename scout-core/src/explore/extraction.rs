use serde::Deserialize;
use tracing::debug;

use super::context::PageElement;
use crate::browser::{BrowserPage, BrowserResult};

/// Installed before any document loads so SPA route changes that never touch
/// the address bar are still observed. Drained after discovery.
pub(crate) const ROUTE_OBSERVER_SCRIPT: &str = r#"
(() => {
    if (window.__scoutRoutes) return;
    window.__scoutRoutes = [];
    const push = (url) => {
        if (url) window.__scoutRoutes.push(new URL(url, location.href).href);
    };
    const origPush = history.pushState.bind(history);
    history.pushState = function (state, title, url) {
        push(url);
        return origPush(state, title, url);
    };
    const origReplace = history.replaceState.bind(history);
    history.replaceState = function (state, title, url) {
        push(url);
        return origReplace(state, title, url);
    };
    window.addEventListener('popstate', () => push(location.href));
})();
"#;

/// Counts DOM mutations into `window.__scoutMutations`; the stabilization
/// phase polls the counter until it goes quiet.
pub(crate) const MUTATION_COUNTER_SCRIPT: &str = r#"
(() => {
    if (window.__scoutMutations !== undefined) return true;
    window.__scoutMutations = 0;
    const observer = new MutationObserver((records) => {
        window.__scoutMutations += records.length;
    });
    observer.observe(document.body, { childList: true, subtree: true, attributes: true });
    return true;
})();
"#;

/// Full-page inventory: interactive elements with best-effort stable
/// selectors, plus the aggregate signals scoring needs.
const EXTRACT_SCRIPT: &str = r#"
(() => {
    const selectorFor = (el) => {
        if (el.id) return '#' + CSS.escape(el.id);
        const testId = el.getAttribute('data-testid');
        if (testId) return `[data-testid="${testId}"]`;
        const parts = [];
        let node = el;
        while (node && node !== document.body && parts.length < 4) {
            let part = node.tagName.toLowerCase();
            const parent = node.parentElement;
            if (parent) {
                const siblings = Array.from(parent.children).filter(
                    (child) => child.tagName === node.tagName
                );
                if (siblings.length > 1) {
                    part += `:nth-of-type(${siblings.indexOf(node) + 1})`;
                }
            }
            parts.unshift(part);
            node = parent;
        }
        return parts.join(' > ');
    };
    const visible = (el) => {
        const style = window.getComputedStyle(el);
        return style.display !== 'none' && style.visibility !== 'hidden';
    };
    const labelFor = (el) =>
        (el.getAttribute('aria-label') || el.innerText || el.value || '')
            .trim()
            .slice(0, 120);

    const elements = [];
    const interactive = document.querySelectorAll(
        'a[href], button, input, select, textarea, [role="button"], [role="tab"], [role="menuitem"]'
    );
    for (const el of interactive) {
        if (!visible(el)) continue;
        elements.push({
            kind: el.tagName.toLowerCase(),
            selector: selectorFor(el),
            label: labelFor(el),
            href: el.getAttribute('href') || null,
            input_type: el.getAttribute('type') || null,
            disabled: el.disabled === true || el.getAttribute('aria-disabled') === 'true',
        });
    }

    let brokenImages = 0;
    for (const img of document.images) {
        if (img.complete && img.naturalWidth === 0) brokenImages += 1;
    }
    const loadingVisible = Array.from(
        document.querySelectorAll('.spinner, [aria-busy="true"], [class*="loading"]')
    ).some(visible);
    const errorVisible = Array.from(
        document.querySelectorAll('[role="alert"], [role="alertdialog"], .toast-error, .error-banner')
    ).some(visible);

    return {
        title: document.title || null,
        total_elements: document.body.getElementsByTagName('*').length,
        text_length: (document.body.innerText || '').length,
        broken_images: brokenImages,
        loading_visible: loadingVisible,
        error_visible: errorVisible,
        elements,
    };
})()
"#;

/// Anchors in document order; `in_nav` marks links inside a nav/aside
/// landmark so the caller can bucket them as sidebar links.
const LINKS_SCRIPT: &str = r#"
(() => {
    const links = [];
    for (const anchor of document.querySelectorAll('a[href]')) {
        const style = window.getComputedStyle(anchor);
        if (style.display === 'none' || style.visibility === 'hidden') continue;
        const href = anchor.getAttribute('href');
        if (!href || href.startsWith('javascript:') || href.startsWith('mailto:')) continue;
        links.push({
            href: new URL(href, location.href).href,
            label: (anchor.getAttribute('aria-label') || anchor.innerText || '').trim().slice(0, 120),
            in_nav: anchor.closest('nav, aside, [role="navigation"]') !== null,
        });
    }
    return links;
})()
"#;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageInventory {
    pub title: Option<String>,
    #[serde(default)]
    pub total_elements: usize,
    #[serde(default)]
    pub text_length: usize,
    #[serde(default)]
    pub broken_images: usize,
    #[serde(default)]
    pub loading_visible: bool,
    #[serde(default)]
    pub error_visible: bool,
    #[serde(default)]
    pub elements: Vec<PageElement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLink {
    pub href: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub in_nav: bool,
}

pub async fn extract_inventory(page: &dyn BrowserPage) -> BrowserResult<PageInventory> {
    let raw = page.evaluate(EXTRACT_SCRIPT).await?;
    let inventory: PageInventory = serde_json::from_value(raw).unwrap_or_default();
    debug!(
        elements = inventory.elements.len(),
        text_length = inventory.text_length,
        "extracted page inventory"
    );
    Ok(inventory)
}

pub async fn collect_links(page: &dyn BrowserPage) -> BrowserResult<Vec<RawLink>> {
    let raw = page.evaluate(LINKS_SCRIPT).await?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}

/// Returns and clears the URLs captured by the route observer.
pub async fn drain_routes(page: &dyn BrowserPage) -> BrowserResult<Vec<String>> {
    let raw = page
        .evaluate("(() => (window.__scoutRoutes || []).splice(0))()")
        .await?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}
