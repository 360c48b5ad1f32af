use image::GenericImageView;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::ScoringSection;

/// Metadata extracted from a visited page, sufficient for offline scoring
/// when no screenshot or live handle is available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSignals {
    pub url: String,
    pub title: Option<String>,
    pub last_action_label: Option<String>,
    pub total_elements: usize,
    pub interactive_elements: usize,
    pub text_length: usize,
    pub broken_images: usize,
    pub loading_indicator_visible: bool,
    pub error_ui_visible: bool,
}

/// 0-100 quality score with its weighted sub-scores and the reasons that
/// pulled them down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageScore {
    pub total: f64,
    pub visual: f64,
    pub stability: f64,
    pub functional: f64,
    pub capped: bool,
    pub reasons: Vec<String>,
}

/// Weighs visual, stability and functional signals into one page score.
/// Screenshot analysis is optional; without pixels the visual sub-score
/// falls back to a neutral value so batch re-scoring of stored artifacts
/// stays meaningful.
#[derive(Debug, Clone)]
pub struct ScoringProcessor {
    config: ScoringSection,
}

impl ScoringProcessor {
    pub fn new(config: ScoringSection) -> Self {
        Self { config }
    }

    pub fn score(&self, signals: &PageSignals, screenshot: Option<&[u8]>) -> PageScore {
        let mut reasons = Vec::new();

        let visual = self.visual_score(screenshot, &mut reasons);
        let stability = self.stability_score(signals, &mut reasons);
        let functional = self.functional_score(signals, &mut reasons);

        let weighted = visual * self.config.visual_weight
            + stability * self.config.stability_weight
            + functional * self.config.functional_weight;
        let mut total = weighted.clamp(0.0, 100.0);
        let mut capped = false;

        // An error toast or alert dominates every other signal.
        if signals.error_ui_visible {
            reasons.push("error-ui-visible".to_string());
            if total > self.config.error_ceiling {
                total = self.config.error_ceiling;
                capped = true;
            }
        }

        debug!(
            url = %signals.url,
            total,
            visual,
            stability,
            functional,
            "scored page"
        );
        PageScore {
            total,
            visual,
            stability,
            functional,
            capped,
            reasons,
        }
    }

    fn visual_score(&self, screenshot: Option<&[u8]>, reasons: &mut Vec<String>) -> f64 {
        let Some(bytes) = screenshot else {
            // Metadata-only mode: neutral, never punishing.
            return 70.0;
        };
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(err) => {
                debug!(error = %err, "screenshot decode failed, scoring visually neutral");
                reasons.push("screenshot-unreadable".to_string());
                return 50.0;
            }
        };

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            reasons.push("empty-screenshot".to_string());
            return 0.0;
        }

        // Sample a grid rather than every pixel; blank detection does not
        // need full resolution.
        let luma = image.to_luma8();
        let step_x = (width / 64).max(1);
        let step_y = (height / 64).max(1);
        let mut sampled = 0u64;
        let mut background = 0u64;
        let mut y = 0;
        while y < height {
            let mut x = 0;
            while x < width {
                let pixel = luma.get_pixel(x, y)[0];
                if pixel > 245 || pixel < 10 {
                    background += 1;
                }
                sampled += 1;
                x += step_x;
            }
            y += step_y;
        }
        let blank_ratio = background as f64 / sampled.max(1) as f64;
        if blank_ratio >= self.config.blank_pixel_ratio {
            reasons.push("blank-page".to_string());
            10.0
        } else if blank_ratio >= 0.90 {
            reasons.push("mostly-blank".to_string());
            55.0
        } else {
            100.0
        }
    }

    fn stability_score(&self, signals: &PageSignals, reasons: &mut Vec<String>) -> f64 {
        let mut score: f64 = 100.0;

        if signals.total_elements < self.config.min_elements {
            reasons.push("low-element-count".to_string());
            // A near-empty inventory can never reach the ceiling.
            score = score.min(60.0);
            score -= 20.0;
        }
        if signals.loading_indicator_visible {
            reasons.push("loading-indicator-visible".to_string());
            score -= 30.0;
        }
        if signals.broken_images > 0 {
            reasons.push(format!("broken-images:{}", signals.broken_images));
            score -= (signals.broken_images as f64 * 5.0).min(25.0);
        }
        if signals.total_elements > 0 {
            let interactive_ratio =
                signals.interactive_elements as f64 / signals.total_elements as f64;
            if interactive_ratio < 0.05 {
                reasons.push("low-interactive-ratio".to_string());
                score -= 15.0;
            }
        }
        if signals.text_length < self.config.min_text_chars {
            reasons.push("low-text-density".to_string());
            score -= 15.0;
        }

        score.clamp(0.0, 100.0)
    }

    /// Does the page's title or the last action taken correlate with the URL
    /// path? A mismatch suggests the navigation landed somewhere unexpected.
    fn functional_score(&self, signals: &PageSignals, reasons: &mut Vec<String>) -> f64 {
        let tokens = path_tokens(&signals.url);
        if tokens.is_empty() {
            return 80.0;
        }
        let mut haystack = String::new();
        if let Some(title) = &signals.title {
            haystack.push_str(&title.to_lowercase());
            haystack.push(' ');
        }
        if let Some(label) = &signals.last_action_label {
            haystack.push_str(&label.to_lowercase());
        }
        if haystack.trim().is_empty() {
            reasons.push("no-title-or-action".to_string());
            return 40.0;
        }
        let matched = tokens
            .iter()
            .filter(|token| haystack.contains(token.as_str()))
            .count();
        if matched > 0 {
            100.0
        } else {
            reasons.push("title-url-mismatch".to_string());
            50.0
        }
    }
}

fn path_tokens(url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(url) else {
        return Vec::new();
    };
    parsed
        .path_segments()
        .into_iter()
        .flatten()
        .flat_map(|segment| {
            segment
                .split(['-', '_'])
                .map(|part| part.to_lowercase())
                .collect::<Vec<_>>()
        })
        .filter(|token| token.len() > 2 && !token.chars().all(|ch| ch.is_ascii_digit()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_signals() -> PageSignals {
        PageSignals {
            url: "https://x.com/app/reports".to_string(),
            title: Some("Reports".to_string()),
            last_action_label: None,
            total_elements: 120,
            interactive_elements: 30,
            text_length: 2400,
            broken_images: 0,
            loading_indicator_visible: false,
            error_ui_visible: false,
        }
    }

    fn processor() -> ScoringProcessor {
        ScoringProcessor::new(ScoringSection::default())
    }

    #[test]
    fn healthy_page_scores_high_without_screenshot() {
        let score = processor().score(&healthy_signals(), None);
        assert!(score.total > 75.0, "got {}", score.total);
        assert!(!score.capped);
    }

    #[test]
    fn error_ui_caps_total_regardless_of_subscores() {
        let mut signals = healthy_signals();
        signals.error_ui_visible = true;
        let score = processor().score(&signals, None);
        assert!(score.total <= 20.0, "got {}", score.total);
        assert!(score.capped);
        assert!(score.reasons.iter().any(|r| r == "error-ui-visible"));
    }

    #[test]
    fn sparse_page_reports_low_element_count() {
        let mut signals = healthy_signals();
        signals.total_elements = 3;
        signals.interactive_elements = 1;
        let score = processor().score(&signals, None);
        assert!(score.reasons.iter().any(|r| r == "low-element-count"));
        assert!(score.stability < 100.0);
        assert!(score.stability <= 60.0);
    }

    #[test]
    fn loading_indicator_lowers_stability() {
        let mut signals = healthy_signals();
        signals.loading_indicator_visible = true;
        let with = processor().score(&signals, None);
        let without = processor().score(&healthy_signals(), None);
        assert!(with.stability < without.stability);
    }

    #[test]
    fn title_mismatch_lowers_functional_score() {
        let mut signals = healthy_signals();
        signals.title = Some("Completely Unrelated".to_string());
        let score = processor().score(&signals, None);
        assert!(score.functional < 100.0);
        assert!(score.reasons.iter().any(|r| r == "title-url-mismatch"));
    }

    #[test]
    fn action_label_counts_toward_functional_match() {
        let mut signals = healthy_signals();
        signals.title = None;
        signals.last_action_label = Some("Open reports".to_string());
        let score = processor().score(&signals, None);
        assert!((score.functional - 100.0).abs() < f64::EPSILON);
    }
}
