//! Config validation
//!
//! Runs synchronously at create/update time, before anything is persisted.
//! All problems found are reported together in one `Validation` error.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    ConfigPayload, DerivedMetricRules, DriftSettings, FeedbackSettings, KeywordRules, Mode,
    ModelConfig, ProviderKind, SamplingConfig, Scope, Thresholds, TOPIC_PREFIX,
};

fn in_unit(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

pub fn validate_scope(scope: Scope, scope_id: Option<&str>) -> EngineResult<()> {
    match (scope.requires_scope_id(), scope_id) {
        (false, Some(id)) => Err(EngineError::Validation(format!(
            "global configs take no scope_id (got '{}')",
            id
        ))),
        (true, None) => Err(EngineError::Validation(format!("{} configs need a scope_id", scope))),
        (true, Some(id)) if id.trim().is_empty() => {
            Err(EngineError::Validation(format!("{} scope_id is empty", scope)))
        }
        _ => Ok(()),
    }
}

pub fn validate_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name is empty".to_string()));
    }
    Ok(())
}

/// Validate the fields a payload sets itself
pub fn validate_payload(payload: &ConfigPayload) -> EngineResult<()> {
    let mut problems = Vec::new();

    if let Some(t) = &payload.thresholds {
        check_thresholds(t, &mut problems);
    }
    if let Some(model) = &payload.model {
        check_model(model, &mut problems);
    }
    if let Some(mapping) = &payload.label_mapping {
        let mut seen = HashSet::new();
        for key in mapping.keys() {
            if key.trim().is_empty() {
                problems.push("label_mapping has an empty provider label".to_string());
            } else if !seen.insert(key.trim().to_lowercase()) {
                problems.push(format!("label_mapping maps '{}' more than once", key));
            }
        }
    }
    if let Some(rules) = &payload.derived_metrics {
        check_derived(rules, &mut problems);
    }
    if let Some(sampling) = &payload.sampling {
        check_sampling(sampling, &mut problems);
    }
    if let Some(feedback) = &payload.feedback {
        check_feedback(feedback, &mut problems);
    }
    if let Some(drift) = &payload.drift_detection {
        check_drift(drift, &mut problems);
    }
    if let Some(keywords) = &payload.keywords {
        check_keywords(keywords, &mut problems);
    }
    if let Some(parent) = &payload.parent_config_id {
        if parent.trim().is_empty() {
            problems.push("parent_config_id is empty".to_string());
        }
    }

    finish(problems)
}

/// Cross-field checks on the payload as it will resolve (after parent overlay)
pub fn validate_effective(payload: &ConfigPayload) -> EngineResult<()> {
    let mut problems = Vec::new();

    if let Some(feedback) = &payload.feedback {
        if feedback.auto_retrain && payload.mode() != Mode::Ml {
            problems.push("feedback.auto_retrain is only available in ml mode".to_string());
        }
    }
    if payload.mode == Some(Mode::Ml) {
        match &payload.model {
            None => problems.push("ml mode needs a model".to_string()),
            Some(m) if m.provider == ProviderKind::Keyword => {
                problems.push("ml mode cannot use the keyword provider".to_string())
            }
            _ => {}
        }
    }

    finish(problems)
}

fn finish(problems: Vec<String>) -> EngineResult<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(problems.join("; ")))
    }
}

fn check_thresholds(t: &Thresholds, problems: &mut Vec<String>) {
    for (name, v) in [("negative", t.negative), ("neutral", t.neutral), ("positive", t.positive)] {
        if !in_unit(v) {
            problems.push(format!("thresholds.{} must be in [0,1], got {}", name, v));
        }
    }
    if !(t.negative <= t.neutral && t.neutral <= t.positive) {
        problems.push(format!(
            "thresholds must satisfy negative <= neutral <= positive, got {} / {} / {}",
            t.negative, t.neutral, t.positive
        ));
    }
    if let Some(min) = t.min_confidence {
        if !in_unit(min) {
            problems.push(format!("thresholds.min_confidence must be in [0,1], got {}", min));
        }
    }
}

fn check_model(model: &ModelConfig, problems: &mut Vec<String>) {
    if model.timeout_ms == 0 {
        problems.push("model.timeout_ms must be positive".to_string());
    }
    match model.provider {
        ProviderKind::Custom if model.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) => {
            problems.push("custom provider needs an endpoint".to_string())
        }
        ProviderKind::Aws if model.region.as_deref().map_or(true, |r| r.trim().is_empty()) => {
            problems.push("aws provider needs a region".to_string())
        }
        _ => {}
    }
}

fn check_derived(rules: &DerivedMetricRules, problems: &mut Vec<String>) {
    // Bad rule parameters surface as omissions at classification time
    if let Some(intent) = &rules.intent {
        for name in intent.intents.keys() {
            if name.trim().is_empty() {
                problems.push("derived_metrics.intent has an empty intent name".to_string());
            }
        }
    }
}

fn check_sampling(sampling: &SamplingConfig, problems: &mut Vec<String>) {
    if !in_unit(sampling.rate) {
        problems.push(format!("sampling.rate must be in [0,1], got {}", sampling.rate));
    }
}

fn check_feedback(feedback: &FeedbackSettings, problems: &mut Vec<String>) {
    if feedback.retrain_threshold == 0 {
        problems.push("feedback.retrain_threshold must be at least 1".to_string());
    }
}

fn check_drift(drift: &DriftSettings, problems: &mut Vec<String>) {
    if !(drift.threshold > 0.0 && drift.threshold.is_finite()) {
        problems.push(format!(
            "drift_detection.threshold must be positive, got {}",
            drift.threshold
        ));
    }
}

fn check_keywords(keywords: &KeywordRules, problems: &mut Vec<String>) {
    if !in_unit(keywords.default_confidence) {
        problems.push(format!(
            "keywords.default_confidence must be in [0,1], got {}",
            keywords.default_confidence
        ));
    }

    let lists = [("positive", &keywords.positive), ("negative", &keywords.negative)];
    for (name, list) in lists {
        let mut seen = HashSet::new();
        for word in list {
            let normalized = word.trim().to_lowercase();
            if normalized.is_empty() {
                problems.push(format!("keywords.{} has an empty keyword", name));
            } else if normalized != *word {
                problems.push(format!("keywords.{} entry '{}' must be trimmed lowercase", name, word));
            } else if !seen.insert(normalized) {
                problems.push(format!("keywords.{} repeats '{}'", name, word));
            }
        }
    }

    for word in &keywords.positive {
        if keywords.negative.contains(word) {
            problems.push(format!("keyword '{}' is both positive and negative", word));
        }
    }

    for (intent, phrases) in &keywords.intents {
        if intent.trim().is_empty() || intent.trim() == TOPIC_PREFIX {
            problems.push("keywords.intents has an empty name".to_string());
        }
        let mut seen = HashSet::new();
        for phrase in phrases {
            if !seen.insert(phrase.trim().to_lowercase()) {
                problems.push(format!("keywords.intents.{} repeats '{}'", intent, phrase));
            }
        }
    }
}

/// Normalize keyword lists the way the settings page stores them
pub fn normalize_keywords(keywords: &mut KeywordRules) {
    for list in [&mut keywords.positive, &mut keywords.negative] {
        for word in list.iter_mut() {
            *word = word.trim().to_lowercase();
        }
    }
    for phrases in keywords.intents.values_mut() {
        for phrase in phrases.iter_mut() {
            *phrase = phrase.trim().to_lowercase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedbackSettings, Mode};

    fn thresholds(n: f64, m: f64, p: f64) -> ConfigPayload {
        ConfigPayload {
            thresholds: Some(Thresholds {
                negative: n,
                neutral: m,
                positive: p,
                min_confidence: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(validate_payload(&thresholds(0.3, 0.3, 0.7)).is_ok());
        assert!(matches!(
            validate_payload(&thresholds(0.6, 0.5, 0.7)),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_payload(&thresholds(-0.1, 0.5, 0.7)).is_err());
        assert!(validate_payload(&thresholds(0.1, 0.5, 1.2)).is_err());
    }

    #[test]
    fn test_scope_consistency() {
        assert!(validate_scope(Scope::Global, None).is_ok());
        assert!(validate_scope(Scope::Global, Some("x")).is_err());
        assert!(validate_scope(Scope::Campaign, None).is_err());
        assert!(validate_scope(Scope::Campaign, Some(" ")).is_err());
        assert!(validate_scope(Scope::User, Some("u-1")).is_ok());
    }

    #[test]
    fn test_label_mapping_duplicates_case_insensitive() {
        let mut mapping = crate::types::LabelMapping::new();
        mapping.insert("LABEL_0".into(), crate::types::SentimentLabel::Negative);
        mapping.insert("label_0".into(), crate::types::SentimentLabel::Positive);
        let payload = ConfigPayload {
            label_mapping: Some(mapping),
            ..Default::default()
        };
        assert!(validate_payload(&payload).is_err());
    }

    #[test]
    fn test_custom_provider_needs_endpoint() {
        let payload = ConfigPayload {
            model: Some(ModelConfig {
                provider: ProviderKind::Custom,
                ..ModelConfig::keyword()
            }),
            ..Default::default()
        };
        let err = validate_payload(&payload).unwrap_err().to_string();
        assert!(err.contains("endpoint"));
    }

    #[test]
    fn test_auto_retrain_requires_ml() {
        let payload = ConfigPayload {
            mode: Some(Mode::Keyword),
            feedback: Some(FeedbackSettings {
                enabled: true,
                auto_retrain: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_payload(&payload).is_ok());
        assert!(validate_effective(&payload).is_err());
    }

    #[test]
    fn test_keywords_must_be_normalized_and_disjoint() {
        let mut rules = KeywordRules {
            positive: vec![" Great ".into(), "love".into()],
            negative: vec!["love".into()],
            ..Default::default()
        };
        let payload = ConfigPayload {
            keywords: Some(rules.clone()),
            ..Default::default()
        };
        let err = validate_payload(&payload).unwrap_err().to_string();
        assert!(err.contains("trimmed lowercase"));
        assert!(err.contains("both positive and negative"));

        normalize_keywords(&mut rules);
        assert_eq!(rules.positive[0], "great");
    }

    #[test]
    fn test_reports_all_problems() {
        let payload = ConfigPayload {
            sampling: Some(SamplingConfig {
                rate: 2.0,
                ..Default::default()
            }),
            drift_detection: Some(DriftSettings {
                enabled: true,
                threshold: 0.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = validate_payload(&payload).unwrap_err().to_string();
        assert!(err.contains("sampling.rate"));
        assert!(err.contains("drift_detection.threshold"));
    }
}
