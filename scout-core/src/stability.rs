use serde::{Deserialize, Serialize};

use crate::config::ScoringSection;
use crate::scoring::PageSignals;

/// Verdict on whether a page state is reliable enough to promote to a
/// regression baseline. Confidence starts at 1.0 and each deduction names
/// its reason so the artifact explains itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenPathVerdict {
    pub is_stable: bool,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StabilityAnalyzer {
    config: ScoringSection,
}

impl StabilityAnalyzer {
    pub fn new(config: ScoringSection) -> Self {
        Self { config }
    }

    pub fn analyze(&self, signals: &PageSignals, action_count: usize) -> GoldenPathVerdict {
        let mut confidence: f64 = 1.0;
        let mut reasons = Vec::new();

        if signals.error_ui_visible {
            confidence -= 0.6;
            reasons.push("error-ui-visible".to_string());
        }
        if signals.loading_indicator_visible {
            confidence -= 0.3;
            reasons.push("loading-indicator-visible".to_string());
        }
        if signals.total_elements < self.config.min_elements {
            confidence -= 0.25;
            reasons.push("low-element-count".to_string());
        }
        if signals.broken_images > 0 {
            confidence -= 0.1;
            reasons.push("broken-images".to_string());
        }
        if signals.text_length < self.config.min_text_chars {
            confidence -= 0.15;
            reasons.push("low-text-density".to_string());
        }
        // Long action chains accumulate flakiness; each hop is a chance for
        // the replay to diverge.
        if action_count > 5 {
            confidence -= 0.05 * (action_count - 5) as f64;
            reasons.push("long-action-chain".to_string());
        }

        let confidence = confidence.clamp(0.0, 1.0);
        GoldenPathVerdict {
            is_stable: confidence >= self.config.stable_confidence_floor,
            confidence,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> StabilityAnalyzer {
        StabilityAnalyzer::new(ScoringSection::default())
    }

    fn settled_signals() -> PageSignals {
        PageSignals {
            url: "https://x.com/app/settings".to_string(),
            title: Some("Settings".to_string()),
            last_action_label: None,
            total_elements: 80,
            interactive_elements: 25,
            text_length: 1800,
            broken_images: 0,
            loading_indicator_visible: false,
            error_ui_visible: false,
        }
    }

    #[test]
    fn settled_page_is_stable_with_full_confidence() {
        let verdict = analyzer().analyze(&settled_signals(), 1);
        assert!(verdict.is_stable);
        assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn error_ui_makes_page_unstable() {
        let mut signals = settled_signals();
        signals.error_ui_visible = true;
        let verdict = analyzer().analyze(&signals, 1);
        assert!(!verdict.is_stable);
        assert!(verdict.reasons.iter().any(|r| r == "error-ui-visible"));
    }

    #[test]
    fn deductions_accumulate() {
        let mut signals = settled_signals();
        signals.loading_indicator_visible = true;
        signals.total_elements = 2;
        let verdict = analyzer().analyze(&signals, 1);
        assert!(!verdict.is_stable);
        assert!(verdict.confidence < 0.5);
        assert_eq!(verdict.reasons.len(), 2); // spinner, element count
    }

    #[test]
    fn long_chains_erode_confidence() {
        let short = analyzer().analyze(&settled_signals(), 2);
        let long = analyzer().analyze(&settled_signals(), 10);
        assert!(long.confidence < short.confidence);
    }
}
