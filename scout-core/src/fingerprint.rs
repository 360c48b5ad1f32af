use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::browser::{BrowserPage, BrowserResult};

/// Collects the structural skeleton of the rendered DOM: visible elements in
/// document order with tag, role, input type and class list. Text content and
/// attribute values are deliberately excluded so two renders of the same
/// layout over different data hash identically.
const SKELETON_SCRIPT: &str = r#"
(() => {
    const skeleton = [];
    const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_ELEMENT);
    let node = walker.currentNode;
    while (node) {
        if (node.nodeType === Node.ELEMENT_NODE) {
            const style = window.getComputedStyle(node);
            if (style.display !== 'none' && style.visibility !== 'hidden') {
                skeleton.push({
                    tag: node.tagName.toLowerCase(),
                    role: node.getAttribute('role') || '',
                    input_type: node.getAttribute('type') || '',
                    classes: Array.from(node.classList),
                });
            }
        }
        node = walker.nextNode();
    }
    return skeleton;
})()
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct SkeletonNode {
    pub tag: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub classes: Vec<String>,
}

/// Produces stable layout fingerprints for the discovery gate and revisit
/// policy. Hashes are sha256 over a canonical encoding of the skeleton.
#[derive(Debug)]
pub struct UiHasher {
    volatile_class: Regex,
}

impl Default for UiHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl UiHasher {
    pub fn new() -> Self {
        // CSS-in-JS and framework-generated class names carry per-build or
        // per-render suffixes that would break hash stability.
        let volatile_class = Regex::new(
            r"(?x)
            ^(css|sc|jsx|ng|svelte|emotion)[-_] |
            [-_][0-9a-f]{4,}$ |
            [-_]\d+$",
        )
        .expect("volatile class pattern is valid");
        Self { volatile_class }
    }

    /// Captures the live page's skeleton and returns its hash.
    pub async fn capture(&self, page: &dyn BrowserPage) -> BrowserResult<String> {
        let raw = page.evaluate(SKELETON_SCRIPT).await?;
        let nodes: Vec<SkeletonNode> = serde_json::from_value(raw).unwrap_or_default();
        debug!(nodes = nodes.len(), "captured ui skeleton");
        Ok(self.hash_skeleton(&nodes))
    }

    pub fn hash_skeleton(&self, nodes: &[SkeletonNode]) -> String {
        let mut canonical = String::new();
        for node in nodes {
            let mut classes: Vec<&String> = node
                .classes
                .iter()
                .filter(|class| !self.volatile_class.is_match(class))
                .collect();
            classes.sort();
            canonical.push_str(&node.tag);
            canonical.push('|');
            canonical.push_str(&node.role);
            canonical.push('|');
            canonical.push_str(&node.input_type);
            canonical.push('|');
            for (index, class) in classes.iter().enumerate() {
                if index > 0 {
                    canonical.push(',');
                }
                canonical.push_str(class);
            }
            canonical.push('\n');
        }
        hex_digest(canonical.as_bytes())
    }
}

/// Hash of free-form text, used to deduplicate modal content across triggers.
pub fn content_hash(text: &str) -> String {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    hex_digest(normalized.to_lowercase().as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: &str, classes: &[&str]) -> SkeletonNode {
        SkeletonNode {
            tag: tag.to_string(),
            role: String::new(),
            input_type: String::new(),
            classes: classes.iter().map(|class| class.to_string()).collect(),
        }
    }

    #[test]
    fn same_layout_different_class_order_hashes_identically() {
        let hasher = UiHasher::new();
        let first = hasher.hash_skeleton(&[node("div", &["card", "active"])]);
        let second = hasher.hash_skeleton(&[node("div", &["active", "card"])]);
        assert_eq!(first, second);
    }

    #[test]
    fn structural_change_changes_hash() {
        let hasher = UiHasher::new();
        let table = hasher.hash_skeleton(&[node("table", &[]), node("tr", &[])]);
        let list = hasher.hash_skeleton(&[node("ul", &[]), node("li", &[])]);
        assert_ne!(table, list);
    }

    #[test]
    fn volatile_classes_are_ignored() {
        let hasher = UiHasher::new();
        let first = hasher.hash_skeleton(&[node("div", &["panel", "css-1x9ab2"])]);
        let second = hasher.hash_skeleton(&[node("div", &["panel", "css-88zzf1"])]);
        assert_eq!(first, second);
    }

    #[test]
    fn element_order_matters() {
        let hasher = UiHasher::new();
        let first = hasher.hash_skeleton(&[node("nav", &[]), node("main", &[])]);
        let second = hasher.hash_skeleton(&[node("main", &[]), node("nav", &[])]);
        assert_ne!(first, second);
    }

    #[test]
    fn content_hash_normalizes_whitespace() {
        assert_eq!(
            content_hash("Confirm   delete\n item"),
            content_hash("confirm delete item")
        );
    }
}
