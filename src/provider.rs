//! Classification providers
//!
//! Each provider kind returns its native response shape as one variant of
//! `ProviderOutput`. The variant is converted into a `RawClassification`
//! (label, score in [0,1], confidence) right at the boundary, so nothing past
//! the normalizer depends on which provider answered.
//!
//! Only the keyword provider is built in. HTTP clients for the hosted
//! providers live outside this crate and plug in through `Provider`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::normalize::{map_label, MappedLabel};
use crate::types::{KeywordRules, LabelMapping, ModelConfig, ProviderKind, SentimentLabel};

/// Everything a provider sees for one call
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub text: &'a str,
    pub model: &'a ModelConfig,
    pub keywords: &'a KeywordRules,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn classify(&self, request: ProviderRequest<'_>) -> EngineResult<ProviderOutput>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// Native response shapes, one per provider kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderOutput {
    Openai {
        label: String,
        score: f64,
        confidence: f64,
    },
    /// Text-classification pipeline output: one score per model label
    Huggingface { scores: Vec<LabelScore> },
    /// Comprehend-style sentiment with per-class scores
    Aws {
        sentiment: String,
        positive: f64,
        negative: f64,
        neutral: f64,
        mixed: f64,
    },
    /// Natural Language API document sentiment: score in [-1,1], unbounded magnitude
    Gcp { score: f64, magnitude: f64 },
    Custom {
        label: String,
        score: f64,
        confidence: f64,
    },
    Keyword {
        positive_hits: u32,
        negative_hits: u32,
        default_confidence: f64,
    },
}

/// Provider-neutral classification handed to the normalizer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawClassification {
    pub label: String,
    /// 0 is fully negative, 1 fully positive
    pub score: f64,
    pub confidence: f64,
    pub raw: Value,
}

impl ProviderOutput {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderOutput::Openai { .. } => ProviderKind::Openai,
            ProviderOutput::Huggingface { .. } => ProviderKind::Huggingface,
            ProviderOutput::Aws { .. } => ProviderKind::Aws,
            ProviderOutput::Gcp { .. } => ProviderKind::Gcp,
            ProviderOutput::Custom { .. } => ProviderKind::Custom,
            ProviderOutput::Keyword { .. } => ProviderKind::Keyword,
        }
    }

    /// Convert to the provider-neutral shape. `mapping` resolves per-class
    /// labels for providers that score every class.
    pub fn into_raw(self, mapping: Option<&LabelMapping>) -> EngineResult<RawClassification> {
        let raw = serde_json::to_value(&self)?;
        let (label, score, confidence) = match self {
            ProviderOutput::Openai {
                label,
                score,
                confidence,
            }
            | ProviderOutput::Custom {
                label,
                score,
                confidence,
            } => (label, score, confidence),

            ProviderOutput::Huggingface { scores } => {
                let top = scores
                    .iter()
                    .max_by(|a, b| a.score.total_cmp(&b.score))
                    .ok_or_else(|| EngineError::provider("huggingface", "empty score list"))?;
                // No resolvable label means no positivity signal
                (top.label.clone(), weighted_score(&scores, mapping).unwrap_or(0.5), top.score)
            }

            ProviderOutput::Aws {
                sentiment,
                positive,
                negative,
                neutral,
                mixed,
            } => {
                let confidence = positive.max(negative).max(neutral).max(mixed);
                let score = positive + 0.5 * (neutral + mixed);
                (sentiment.to_lowercase(), score, confidence)
            }

            ProviderOutput::Gcp { score, magnitude } => {
                let label = if score.abs() < 0.25 && magnitude >= 2.0 {
                    SentimentLabel::Mixed
                } else if score >= 0.25 {
                    SentimentLabel::Positive
                } else if score <= -0.25 {
                    SentimentLabel::Negative
                } else {
                    SentimentLabel::Neutral
                };
                let confidence = (0.5 + score.abs() / 2.0).min(1.0);
                (label.as_str().to_string(), (score + 1.0) / 2.0, confidence)
            }

            ProviderOutput::Keyword {
                positive_hits,
                negative_hits,
                default_confidence,
            } => {
                let hits = positive_hits + negative_hits;
                if hits == 0 {
                    (SentimentLabel::Neutral.as_str().to_string(), 0.5, default_confidence)
                } else {
                    let diff = positive_hits as f64 - negative_hits as f64;
                    let score = 0.5 + 0.5 * diff / hits as f64;
                    let confidence = (0.5 + 0.1 * hits as f64).min(1.0);
                    let label = match positive_hits.cmp(&negative_hits) {
                        std::cmp::Ordering::Greater => SentimentLabel::Positive,
                        std::cmp::Ordering::Less => SentimentLabel::Negative,
                        std::cmp::Ordering::Equal => SentimentLabel::Neutral,
                    };
                    (label.as_str().to_string(), score, confidence)
                }
            }
        };

        if !score.is_finite() || !confidence.is_finite() {
            return Err(EngineError::provider(
                raw.get("provider").and_then(Value::as_str).unwrap_or("unknown"),
                "non-finite score or confidence",
            ));
        }

        Ok(RawClassification {
            label,
            score: score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            raw,
        })
    }
}

/// Expected positivity over the labels that resolve to a sentiment, either
/// through the mapping or by name. Unresolved labels are left out.
fn weighted_score(scores: &[LabelScore], mapping: Option<&LabelMapping>) -> Option<f64> {
    let mut total = 0.0;
    let mut weighted = 0.0;
    for s in scores {
        let resolved = match map_label(mapping, &s.label) {
            MappedLabel::Mapped(label) => Some(label),
            MappedLabel::Unmapped(raw) => SentimentLabel::parse(&raw),
        };
        let Some(label) = resolved else {
            continue;
        };
        let value = match label {
            SentimentLabel::Positive => 1.0,
            SentimentLabel::Negative => 0.0,
            SentimentLabel::Neutral | SentimentLabel::Mixed => 0.5,
        };
        total += s.score;
        weighted += s.score * value;
    }
    (total > 0.0).then(|| weighted / total)
}

// ============================================================================
// TEXT HELPERS
// ============================================================================

/// Lowercase word tokens; apostrophes stay inside words
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Occurrences of a keyword or phrase. Single words match whole tokens only.
pub(crate) fn phrase_hits(tokens: &[String], lowered_text: &str, phrase: &str) -> u32 {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() {
        return 0;
    }
    if phrase.contains(char::is_whitespace) {
        lowered_text.matches(phrase.as_str()).count() as u32
    } else {
        tokens.iter().filter(|t| **t == phrase).count() as u32
    }
}

// ============================================================================
// BUILT-IN PROVIDERS
// ============================================================================

/// Lexicon scoring over `keywords.positive` / `keywords.negative`
pub struct KeywordProvider;

impl KeywordProvider {
    pub fn score(text: &str, keywords: &KeywordRules) -> ProviderOutput {
        let tokens = tokenize(text);
        let lowered = text.to_lowercase();
        let count = |list: &[String]| -> u32 {
            list.iter().map(|k| phrase_hits(&tokens, &lowered, k)).sum()
        };

        ProviderOutput::Keyword {
            positive_hits: count(&keywords.positive),
            negative_hits: count(&keywords.negative),
            default_confidence: keywords.default_confidence,
        }
    }
}

#[async_trait]
impl Provider for KeywordProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Keyword
    }

    async fn classify(&self, request: ProviderRequest<'_>) -> EngineResult<ProviderOutput> {
        Ok(Self::score(request.text, request.keywords))
    }
}

/// Provider implementations by kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Registry with the keyword provider installed
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(KeywordProvider));
        registry
    }

    /// Install a provider, replacing any previous one of the same kind
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> EngineResult<Arc<dyn Provider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::provider(kind.as_str(), "no provider registered"))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
