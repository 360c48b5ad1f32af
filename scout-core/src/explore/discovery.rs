use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::context::{DiscoveredLink, ExplorationContext, LinkSource, ModalDiscovery, PageElement};
use super::extraction::{collect_links, drain_routes};
use crate::browser::{BrowserElement, BrowserPage, BrowserResult};
use crate::command::{Command, SelectTarget};
use crate::config::DiscoverySection;
use crate::fingerprint::content_hash;

/// Inventory of the topmost visible dialog, if any. The dialog selector is
/// spliced in from `[discovery] modal_selector`.
const MODAL_SCRIPT: &str = r#"
(() => {
    const modal = Array.from(
        document.querySelectorAll(__MODAL_SELECTOR__)
    ).find((el) => {
        const style = window.getComputedStyle(el);
        return style.display !== 'none' && style.visibility !== 'hidden';
    });
    if (!modal) return null;
    const heading = modal.querySelector('h1, h2, h3, [role="heading"]');
    const elements = [];
    for (const el of modal.querySelectorAll('a[href], button, input, select, textarea')) {
        elements.push({
            kind: el.tagName.toLowerCase(),
            selector: el.id ? '#' + CSS.escape(el.id) : el.tagName.toLowerCase(),
            label: (el.getAttribute('aria-label') || el.innerText || '').trim().slice(0, 120),
            href: el.getAttribute('href') || null,
            input_type: el.getAttribute('type') || null,
            disabled: el.disabled === true,
        });
    }
    return {
        title: heading ? heading.innerText.trim().slice(0, 120) : null,
        text: modal.innerText || '',
        elements,
    };
})()
"#;

#[derive(Debug, Deserialize)]
struct ModalSnapshot {
    title: Option<String>,
    text: String,
    #[serde(default)]
    elements: Vec<PageElement>,
}

/// Light pass for layouts already explored this run: harvest what is
/// present without interacting.
pub(crate) async fn run_light(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    harvest_links(page, ctx, Vec::new()).await?;
    harvest_routes(page, ctx).await?;
    Ok(())
}

/// Full pass for a layout seen for the first time. Every step is
/// best-effort: a failing step is logged and the remaining steps still run,
/// so one brittle widget cannot sink the whole visit.
pub(crate) async fn run_full(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    macro_rules! step {
        ($name:literal, $call:expr) => {
            if let Err(err) = $call.await {
                warn!(step = $name, error = %err, "discovery step failed, continuing");
            }
        };
    }
    step!("sidebar", traverse_sidebar(page, ctx));
    step!("menus", expand_menus(page, ctx));
    step!("tabs", switch_tabs(page, ctx));
    step!("controls", probe_controls(page, ctx));
    step!("view-all", follow_view_all(page, ctx));
    step!("rows", click_rows(page, ctx));
    step!("actions", discover_action_buttons(page, ctx));
    step!("scroll", auto_scroll(page, ctx));
    step!("pagination", paginate(page, ctx));
    harvest_links(page, ctx, Vec::new()).await?;
    harvest_routes(page, ctx).await?;
    Ok(())
}

async fn settle(ctx: &ExplorationContext) {
    sleep(Duration::from_millis(ctx.config.discovery.settle_delay_ms)).await;
}

fn discovery(ctx: &ExplorationContext) -> DiscoverySection {
    ctx.config.discovery.clone()
}

fn modal_probe_script(selector: &str) -> String {
    MODAL_SCRIPT.replace(
        "__MODAL_SELECTOR__",
        &serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into()),
    )
}

/// Runs one probe interaction through the retrying executor, so the action
/// lands in the chain before it is attempted and gets the same fallback
/// ladder as scripted commands.
async fn probe(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
    element: &dyn BrowserElement,
    command: Command,
) -> BrowserResult<()> {
    let executor = ctx.executor.clone();
    let url = ctx.results.settled_url.clone();
    executor
        .execute_on(page, element, &command, &mut ctx.chain, &url)
        .await
}

fn click_command(selector: &str, label: &str) -> Command {
    Command::Click {
        selector: selector.to_string(),
        label: label.to_string(),
    }
}

async fn element_label(element: &dyn BrowserElement) -> String {
    if let Ok(Some(label)) = element.attribute("aria-label").await {
        if !label.trim().is_empty() {
            return label.trim().to_string();
        }
    }
    match element.inner_text().await {
        Ok(Some(text)) => text.trim().chars().take(80).collect(),
        _ => String::new(),
    }
}

/// Folds the current page's anchors into the results.
async fn harvest_links(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
    label_path: Vec<String>,
) -> BrowserResult<()> {
    for link in collect_links(page).await? {
        let mut path = label_path.clone();
        if !link.label.is_empty() {
            path.push(link.label.clone());
        }
        let source = if link.in_nav {
            LinkSource::Sidebar
        } else {
            LinkSource::Body
        };
        ctx.push_link(DiscoveredLink {
            url: link.href,
            label_path: path,
            source,
        });
    }
    Ok(())
}

async fn harvest_routes(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    for url in drain_routes(page).await? {
        ctx.push_link(DiscoveredLink {
            url,
            label_path: Vec::new(),
            source: LinkSource::RouteObserver,
        });
    }
    Ok(())
}

/// Sidebar anchors are the app's own map of itself; they go straight into
/// the high-priority bucket without being clicked.
async fn traverse_sidebar(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    let selector = discovery(ctx).sidebar_selector;
    for element in page.find_elements(&selector).await? {
        let Some(href) = element.attribute("href").await? else {
            continue;
        };
        let label = element_label(element.as_ref()).await;
        if !ctx.state.visited_sidebar.insert(href.clone()) {
            continue;
        }
        ctx.push_link(DiscoveredLink {
            url: href,
            label_path: if label.is_empty() { Vec::new() } else { vec![label] },
            source: LinkSource::Sidebar,
        });
    }
    Ok(())
}

/// Expands collapsed menus and disclosure buttons, harvesting whatever they
/// reveal. Each trigger is expanded at most once per visit.
async fn expand_menus(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    let mut expansions = 0;
    for selector in &cfg.menu_button_selectors {
        if expansions >= cfg.max_menu_expansions {
            break;
        }
        let elements = page.find_elements(selector).await?;
        for (index, element) in elements.into_iter().enumerate() {
            if expansions >= cfg.max_menu_expansions {
                break;
            }
            let label = element_label(element.as_ref()).await;
            let key = format!("{selector}#{index}#{label}");
            if !ctx.state.expanded_buttons.insert(key) {
                continue;
            }
            let command = click_command(selector, &label);
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "menu trigger click failed");
                continue;
            }
            expansions += 1;
            settle(ctx).await;
            capture_modal(page, ctx, &label).await?;
            harvest_links(page, ctx, vec![label]).await?;
        }
    }
    Ok(())
}

async fn switch_tabs(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    let mut switched = 0;
    for selector in &cfg.tab_selectors {
        if switched >= cfg.max_tabs {
            break;
        }
        let elements = page.find_elements(selector).await?;
        for element in elements {
            if switched >= cfg.max_tabs {
                break;
            }
            let label = element_label(element.as_ref()).await;
            let command = click_command(selector, &label);
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "tab click failed");
                continue;
            }
            switched += 1;
            settle(ctx).await;
            harvest_links(page, ctx, vec![label]).await?;
            harvest_routes(page, ctx).await?;
        }
    }
    Ok(())
}

/// Dropdowns and toggles usually act as data filters; nudging each one
/// surfaces filtered views, routes and dialogs that plain anchors never
/// expose. Toggles are flipped back afterwards so later steps see the base
/// page state.
async fn probe_controls(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    let mut probed = 0;
    for selector in &cfg.dropdown_selectors {
        for element in page.find_elements(selector).await? {
            if probed >= cfg.max_controls_probed {
                return Ok(());
            }
            let label = element_label(element.as_ref()).await;
            // A probe only needs to land on an adjacent option; the negative
            // index takes the executor's single-step keyboard path.
            let command = Command::Select {
                selector: selector.to_string(),
                label: label.clone(),
                target: SelectTarget::Index(-1),
            };
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "dropdown probe failed");
                continue;
            }
            probed += 1;
            settle(ctx).await;
            harvest_routes(page, ctx).await?;
        }
    }
    for selector in &cfg.toggle_selectors {
        for element in page.find_elements(selector).await? {
            if probed >= cfg.max_controls_probed {
                return Ok(());
            }
            let label = element_label(element.as_ref()).await;
            let command = click_command(selector, &label);
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "toggle probe failed");
                continue;
            }
            probed += 1;
            settle(ctx).await;
            harvest_routes(page, ctx).await?;
            capture_modal(page, ctx, &label).await?;
            let _ = element.click().await;
        }
    }
    Ok(())
}

/// "View all" style buttons usually expose the densest link lists in the
/// app. Anchors with those labels are already harvested; buttons get
/// clicked so the route observer can catch where they lead.
async fn follow_view_all(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    let buttons = page.find_elements("button, [role='button']").await?;
    for element in buttons {
        let label = element_label(element.as_ref()).await.to_lowercase();
        if label.is_empty()
            || !cfg
                .view_all_labels
                .iter()
                .any(|wanted| label.contains(wanted.as_str()))
        {
            continue;
        }
        let command = click_command("button, [role='button']", &label);
        if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
            debug!(label = %label, error = %err, "view-all click failed");
            continue;
        }
        settle(ctx).await;
        harvest_routes(page, ctx).await?;
        capture_modal(page, ctx, &label).await?;
    }
    Ok(())
}

/// Probes the first rows of each table; detail views often open as modals
/// or SPA routes rather than plain anchors.
async fn click_rows(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    for selector in &cfg.row_selectors {
        let elements = page.find_elements(selector).await?;
        for element in elements.into_iter().take(cfg.max_rows_probed) {
            let label = element_label(element.as_ref()).await;
            let command = click_command(selector, &label);
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "row click failed");
                continue;
            }
            settle(ctx).await;
            harvest_routes(page, ctx).await?;
            capture_modal(page, ctx, &label).await?;
        }
    }
    Ok(())
}

async fn discover_action_buttons(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    for selector in &cfg.action_button_selectors {
        let elements = page.find_elements(selector).await?;
        for element in elements {
            let label = element_label(element.as_ref()).await;
            let command = click_command(selector, &label);
            if let Err(err) = probe(page, ctx, element.as_ref(), command).await {
                debug!(selector, error = %err, "action button click failed");
                continue;
            }
            settle(ctx).await;
            capture_modal(page, ctx, &label).await?;
            harvest_routes(page, ctx).await?;
        }
    }
    Ok(())
}

/// Scrolls the viewport in steps to trigger lazy-loaded content, stopping
/// early once the scroll position stops advancing.
async fn auto_scroll(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    let mut last_y = -1.0f64;
    for _ in 0..cfg.max_scroll_steps {
        let raw = page
            .evaluate("(() => { window.scrollBy(0, window.innerHeight); return window.scrollY; })()")
            .await?;
        let y = raw.as_f64().unwrap_or(0.0);
        if (y - last_y).abs() < 1.0 {
            break;
        }
        last_y = y;
        settle(ctx).await;
        harvest_links(page, ctx, Vec::new()).await?;
    }
    page.evaluate("window.scrollTo(0, 0)").await?;
    Ok(())
}

async fn paginate(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    for _ in 0..cfg.max_pagination_steps {
        let mut advanced = false;
        for selector in &cfg.pagination_selectors {
            if let Some(element) = page.find_element(selector).await? {
                let label = element_label(element.as_ref()).await;
                let command = click_command(selector, &label);
                if probe(page, ctx, element.as_ref(), command).await.is_ok() {
                    advanced = true;
                    break;
                }
            }
        }
        if !advanced {
            break;
        }
        settle(ctx).await;
        harvest_links(page, ctx, vec!["pagination".to_string()]).await?;
    }
    // Re-tag pagination-era links is not worth the bookkeeping; they carry
    // their label path instead.
    Ok(())
}

/// Captures a dialog surfaced by the last action, keyed by content hash so
/// the same modal reached via different triggers is stored once, then
/// closes it so the next step starts from the base page.
async fn capture_modal(
    page: &dyn BrowserPage,
    ctx: &mut ExplorationContext,
    trigger_label: &str,
) -> BrowserResult<()> {
    let raw = page
        .evaluate(&modal_probe_script(&ctx.config.discovery.modal_selector))
        .await?;
    let snapshot: Option<ModalSnapshot> = serde_json::from_value(raw).unwrap_or(None);
    let Some(snapshot) = snapshot else {
        return Ok(());
    };
    let hash = content_hash(&snapshot.text);
    if ctx.state.modal_hashes.insert(hash.clone()) {
        debug!(trigger = trigger_label, hash = %hash, "captured modal");
        for element in &snapshot.elements {
            if let Some(href) = &element.href {
                ctx.push_link(DiscoveredLink {
                    url: href.clone(),
                    label_path: vec![trigger_label.to_string(), element.label.clone()],
                    source: LinkSource::Modal,
                });
            }
        }
        ctx.results.modal_discoveries.push(ModalDiscovery {
            content_hash: hash,
            title: snapshot.title,
            trigger_label: trigger_label.to_string(),
            elements: snapshot.elements,
        });
    }
    close_modal(page, ctx).await
}

async fn close_modal(page: &dyn BrowserPage, ctx: &mut ExplorationContext) -> BrowserResult<()> {
    let cfg = discovery(ctx);
    for selector in &cfg.modal_close_selectors {
        if let Some(element) = page.find_element(selector).await? {
            if element.click().await.is_ok() {
                settle(ctx).await;
                return Ok(());
            }
        }
    }
    // Escape as last resort; harmless when nothing is open.
    page.evaluate(
        "document.dispatchEvent(new KeyboardEvent('keydown', { key: 'Escape', bubbles: true }))",
    )
    .await?;
    settle(ctx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modal_script_embeds_configured_selector() {
        let script = modal_probe_script("[data-testid='drawer']");
        assert!(script.contains(r#""[data-testid='drawer']""#));
        assert!(!script.contains("__MODAL_SELECTOR__"));
    }
}
