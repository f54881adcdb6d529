//! Normalizer: raw provider output -> canonical `Prediction`
//!
//! Pure over its inputs. Provider invocation, persistence and sampling all
//! happen in the caller.

use chrono::Utc;

use crate::derived;
use crate::provider::RawClassification;
use crate::types::{
    ConfigPayload, DerivedMetrics, LabelMapping, PredictRequest, Prediction, ProviderKind,
    SentimentLabel, Thresholds,
};

/// Label decision for one raw classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucketed {
    pub label: SentimentLabel,
    pub low_confidence: bool,
}

/// Provider label after the config's mapping. Lookup is exact first, then
/// case-insensitive; unmapped labels pass through.
pub fn map_label(mapping: Option<&LabelMapping>, raw_label: &str) -> MappedLabel {
    let Some(mapping) = mapping else {
        return MappedLabel::Unmapped(raw_label.to_string());
    };
    if let Some(label) = mapping.get(raw_label) {
        return MappedLabel::Mapped(*label);
    }
    mapping
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(raw_label.trim()))
        .map(|(_, v)| MappedLabel::Mapped(*v))
        .unwrap_or_else(|| MappedLabel::Unmapped(raw_label.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedLabel {
    Mapped(SentimentLabel),
    Unmapped(String),
}

impl MappedLabel {
    pub fn as_str(&self) -> &str {
        match self {
            MappedLabel::Mapped(l) => l.as_str(),
            MappedLabel::Unmapped(s) => s,
        }
    }
}

/// Cut-point bucketing. `mixed` only comes from an explicit mapping.
pub fn bucket(thresholds: &Thresholds, mapped: &MappedLabel, raw_score: f64, raw_confidence: f64) -> Bucketed {
    if let Some(min) = thresholds.min_confidence {
        if raw_confidence < min {
            return Bucketed {
                label: SentimentLabel::Neutral,
                low_confidence: true,
            };
        }
    }

    let label = if *mapped == MappedLabel::Mapped(SentimentLabel::Mixed) {
        SentimentLabel::Mixed
    } else if raw_score < thresholds.negative {
        SentimentLabel::Negative
    } else if raw_score >= thresholds.positive {
        SentimentLabel::Positive
    } else {
        SentimentLabel::Neutral
    };

    Bucketed {
        label,
        low_confidence: false,
    }
}

/// Provider score in [0,1] -> canonical score in [-1,1]
pub fn canonical_score(raw_score: f64) -> f64 {
    (2.0 * raw_score - 1.0).clamp(-1.0, 1.0)
}

/// Which config version produced a prediction
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub config_id: &'a str,
    pub version: u32,
    pub provider: ProviderKind,
}

pub struct Normalizer;

impl Normalizer {
    /// Map, bucket and derive metrics for one raw classification
    pub fn classify(
        source: Source<'_>,
        payload: &ConfigPayload,
        request: &PredictRequest,
        raw: RawClassification,
        processing_time_ms: u64,
    ) -> Prediction {
        let mapped = map_label(payload.label_mapping.as_ref(), &raw.label);
        let decision = bucket(&payload.thresholds(), &mapped, raw.score, raw.confidence);

        let derived_metrics: DerivedMetrics = derived::compute(
            &request.text,
            decision.label,
            decision.low_confidence,
            &payload.derived_rules(),
            &payload.keywords(),
        );

        Prediction {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: source.config_id.to_string(),
            config_version_used: source.version,
            contact_id: request.contact_id.clone(),
            channel: request.channel,
            text: request.text.clone(),
            label: decision.label,
            score: canonical_score(raw.score),
            confidence: raw.confidence,
            raw_response: raw.raw,
            derived_metrics,
            model_provider: source.provider,
            processing_time_ms,
            sampled: false,
            created_at: Utc::now(),
        }
    }
}
