//! Core types for the sentiment configuration engine
//!
//! Configs are stored as immutable version snapshots. The policy payload keeps
//! every section optional so that a child config can leave a section unset and
//! inherit it from its `parent_config_id`; accessors fill in defaults only at
//! the point of use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ============================================================================
// SCOPES
// ============================================================================

/// Tenancy level a configuration applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Workspace,
    Company,
    Campaign,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Workspace => "workspace",
            Scope::Company => "company",
            Scope::Campaign => "campaign",
            Scope::User => "user",
        }
    }

    /// Global is the only scope without a scope id
    pub fn requires_scope_id(&self) -> bool {
        !matches!(self, Scope::Global)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(Scope::Global),
            "workspace" => Ok(Scope::Workspace),
            "company" => Ok(Scope::Company),
            "campaign" => Ok(Scope::Campaign),
            "user" => Ok(Scope::User),
            other => Err(EngineError::Validation(format!("unknown scope '{}'", other))),
        }
    }
}

/// The scope ids known to a caller for one request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeContext {
    pub workspace_id: Option<String>,
    pub company_id: Option<String>,
    pub campaign_id: Option<String>,
    pub user_id: Option<String>,
}

impl ScopeContext {
    /// Context containing a single level (plus the implicit global fallback)
    pub fn single(scope: Scope, scope_id: Option<&str>) -> Self {
        let id = scope_id.map(str::to_string);
        let mut ctx = Self::default();
        match scope {
            Scope::Global => {}
            Scope::Workspace => ctx.workspace_id = id,
            Scope::Company => ctx.company_id = id,
            Scope::Campaign => ctx.campaign_id = id,
            Scope::User => ctx.user_id = id,
        }
        ctx
    }

    /// Precedence chain, most specific first. Levels without an id are skipped.
    pub fn chain(&self) -> Vec<(Scope, Option<String>)> {
        let levels = [
            (Scope::User, &self.user_id),
            (Scope::Campaign, &self.campaign_id),
            (Scope::Company, &self.company_id),
            (Scope::Workspace, &self.workspace_id),
        ];

        let mut chain: Vec<(Scope, Option<String>)> = levels
            .into_iter()
            .filter_map(|(scope, id)| {
                id.as_ref()
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| (scope, Some(s.clone())))
            })
            .collect();
        chain.push((Scope::Global, None));
        chain
    }
}

// ============================================================================
// POLICY PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Keyword,
    Ml,
}

/// Provider kinds accepted at the classification boundary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Huggingface,
    Aws,
    Gcp,
    Custom,
    Keyword,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Huggingface => "huggingface",
            ProviderKind::Aws => "aws",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Custom => "custom",
            ProviderKind::Keyword => "keyword",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| EngineError::Validation(format!("unknown provider '{}'", s)))
    }
}

/// Model/provider settings. Credentials are references, never secrets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

impl ModelConfig {
    pub fn keyword() -> Self {
        Self {
            provider: ProviderKind::Keyword,
            model_id: None,
            endpoint: None,
            credentials_ref: None,
            region: None,
            timeout_ms: default_timeout_ms(),
            max_retries: 0,
        }
    }
}

/// Score cut-points, each in [0,1], ordered negative <= neutral <= positive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub negative: f64,
    pub neutral: f64,
    pub positive: f64,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            negative: 0.35,
            neutral: 0.50,
            positive: 0.65,
            min_confidence: None,
        }
    }
}

/// Provider label -> canonical label
pub type LabelMapping = BTreeMap<String, SentimentLabel>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrgencyRule {
    pub enabled: bool,
    #[serde(default = "default_urgency_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_urgency_weight")]
    pub weight_per_hit: f64,
}

fn default_urgency_keywords() -> Vec<String> {
    [
        "urgent", "asap", "immediately", "right now", "emergency", "critical",
        "cancel", "refund", "lawyer", "deadline", "today",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_urgency_weight() -> f64 {
    0.25
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToneRule {
    pub enabled: bool,
    /// Share of uppercase letters above which text reads as shouting
    #[serde(default = "default_caps_ratio")]
    pub caps_ratio_threshold: f64,
}

fn default_caps_ratio() -> f64 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectivityRule {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentRule {
    pub enabled: bool,
    /// Intent name -> trigger phrases. Falls back to `keywords.intents` when empty.
    #[serde(default)]
    pub intents: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmotionRule {
    pub enabled: bool,
    /// Emotion name -> lexicon. Empty means the built-in lexicon.
    #[serde(default)]
    pub lexicon: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicRule {
    pub enabled: bool,
}

/// Independently enabled secondary signals
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedMetricRules {
    #[serde(default)]
    pub urgency: Option<UrgencyRule>,
    #[serde(default)]
    pub tone: Option<ToneRule>,
    #[serde(default)]
    pub subjectivity: Option<SubjectivityRule>,
    #[serde(default)]
    pub intent: Option<IntentRule>,
    #[serde(default)]
    pub emotion: Option<EmotionRule>,
    #[serde(default)]
    pub topics: Option<TopicRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingStrategy {
    All,
    #[default]
    Random,
    ConfidenceBased,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    pub rate: f64,
    #[serde(default)]
    pub strategy: SamplingStrategy,
    #[serde(default)]
    pub store_low_confidence: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate: 0.0,
            strategy: SamplingStrategy::Random,
            store_low_confidence: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackSettings {
    pub enabled: bool,
    #[serde(default)]
    pub auto_retrain: bool,
    #[serde(default = "default_retrain_threshold")]
    pub retrain_threshold: u32,
    #[serde(default)]
    pub human_review: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_retrain_threshold() -> u32 {
    100
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_retrain: false,
            retrain_threshold: default_retrain_threshold(),
            human_review: false,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftSettings {
    pub enabled: bool,
    pub threshold: f64,
    #[serde(default)]
    pub rollback_on_drift: bool,
    #[serde(default)]
    pub alert_target: Option<String>,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.2,
            rollback_on_drift: false,
            alert_target: None,
        }
    }
}

/// Keyword-mode lexicon. Intent names prefixed `topic:` are topics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordRules {
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
    #[serde(default)]
    pub intents: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_keyword_confidence")]
    pub default_confidence: f64,
}

pub const TOPIC_PREFIX: &str = "topic:";

fn default_keyword_confidence() -> f64 {
    0.7
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self {
            positive: Vec::new(),
            negative: Vec::new(),
            intents: BTreeMap::new(),
            default_confidence: default_keyword_confidence(),
        }
    }
}

impl KeywordRules {
    pub fn topics(&self) -> impl Iterator<Item = (&str, &Vec<String>)> {
        self.intents
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(TOPIC_PREFIX).map(|t| (t, v)))
    }

    pub fn pure_intents(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.intents.iter().filter(|(k, _)| !k.starts_with(TOPIC_PREFIX))
    }
}

/// The versioned policy payload. Unset sections inherit from the parent config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<Thresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_mapping: Option<LabelMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_metrics: Option<DerivedMetricRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_detection: Option<DriftSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<KeywordRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_config_id: Option<String>,
}

impl ConfigPayload {
    /// One-level field override: set child fields win, unset fields come from the parent.
    /// Nested sections are taken whole, never merged.
    pub fn overlay(&self, parent: &ConfigPayload) -> ConfigPayload {
        ConfigPayload {
            mode: self.mode.or(parent.mode),
            model: self.model.clone().or_else(|| parent.model.clone()),
            thresholds: self.thresholds.or(parent.thresholds),
            label_mapping: self.label_mapping.clone().or_else(|| parent.label_mapping.clone()),
            derived_metrics: self
                .derived_metrics
                .clone()
                .or_else(|| parent.derived_metrics.clone()),
            sampling: self.sampling.clone().or_else(|| parent.sampling.clone()),
            feedback: self.feedback.clone().or_else(|| parent.feedback.clone()),
            drift_detection: self
                .drift_detection
                .clone()
                .or_else(|| parent.drift_detection.clone()),
            keywords: self.keywords.clone().or_else(|| parent.keywords.clone()),
            parent_config_id: self.parent_config_id.clone(),
        }
    }

    /// Names of the sections this payload sets explicitly
    pub fn set_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.mode.is_some() {
            fields.push("mode");
        }
        if self.model.is_some() {
            fields.push("model");
        }
        if self.thresholds.is_some() {
            fields.push("thresholds");
        }
        if self.label_mapping.is_some() {
            fields.push("label_mapping");
        }
        if self.derived_metrics.is_some() {
            fields.push("derived_metrics");
        }
        if self.sampling.is_some() {
            fields.push("sampling");
        }
        if self.feedback.is_some() {
            fields.push("feedback");
        }
        if self.drift_detection.is_some() {
            fields.push("drift_detection");
        }
        if self.keywords.is_some() {
            fields.push("keywords");
        }
        fields
    }

    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or_else(|| match &self.model {
            Some(m) if m.provider != ProviderKind::Keyword => Mode::Ml,
            _ => Mode::Keyword,
        })
    }

    /// Model used for classification; keyword mode always uses the keyword provider
    pub fn model(&self) -> ModelConfig {
        match (self.mode(), &self.model) {
            (Mode::Ml, Some(model)) => model.clone(),
            _ => ModelConfig::keyword(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds.unwrap_or_default()
    }

    pub fn sampling(&self) -> SamplingConfig {
        self.sampling.clone().unwrap_or_default()
    }

    pub fn feedback(&self) -> FeedbackSettings {
        self.feedback.clone().unwrap_or_default()
    }

    pub fn drift(&self) -> DriftSettings {
        self.drift_detection.clone().unwrap_or_default()
    }

    pub fn keywords(&self) -> KeywordRules {
        self.keywords.clone().unwrap_or_default()
    }

    pub fn derived_rules(&self) -> DerivedMetricRules {
        self.derived_metrics.clone().unwrap_or_default()
    }
}

/// Explicit set / unset / keep semantics for one field of an update.
///
/// Absent in JSON deserializes to `Keep`, `null` to `Unset`, a value to `Set`.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Unset,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T: Clone> Patch<T> {
    pub fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Keep => current,
            Patch::Set(v) => Some(v.clone()),
            Patch::Unset => None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(|v| match v {
            Some(v) => Patch::Set(v),
            None => Patch::Unset,
        })
    }
}

impl<T: Serialize> Serialize for Patch<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Patch::Set(v) => v.serialize(serializer),
            Patch::Keep | Patch::Unset => serializer.serialize_none(),
        }
    }
}

/// Input for creating a config (version 1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConfig {
    pub name: String,
    pub scope: Scope,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub payload: ConfigPayload,
}

/// Field-level update. Omitted fields carry forward from the previous version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub mode: Patch<Mode>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub model: Patch<ModelConfig>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub thresholds: Patch<Thresholds>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub label_mapping: Patch<LabelMapping>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub derived_metrics: Patch<DerivedMetricRules>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub sampling: Patch<SamplingConfig>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub feedback: Patch<FeedbackSettings>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub drift_detection: Patch<DriftSettings>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub keywords: Patch<KeywordRules>,
    #[serde(default, skip_serializing_if = "Patch::is_keep")]
    pub parent_config_id: Patch<String>,
    /// Optimistic check: fail with Conflict unless the latest version equals this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u32>,
}

impl ConfigUpdate {
    pub fn apply(&self, base: &ConfigPayload) -> ConfigPayload {
        ConfigPayload {
            mode: self.mode.apply(base.mode),
            model: self.model.apply(base.model.clone()),
            thresholds: self.thresholds.apply(base.thresholds),
            label_mapping: self.label_mapping.apply(base.label_mapping.clone()),
            derived_metrics: self.derived_metrics.apply(base.derived_metrics.clone()),
            sampling: self.sampling.apply(base.sampling.clone()),
            feedback: self.feedback.apply(base.feedback.clone()),
            drift_detection: self.drift_detection.apply(base.drift_detection.clone()),
            keywords: self.keywords.apply(base.keywords.clone()),
            parent_config_id: self.parent_config_id.apply(base.parent_config_id.clone()),
        }
    }
}

/// One immutable version of a configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub config_id: String,
    pub version: u32,
    pub name: String,
    pub scope: Scope,
    pub scope_id: Option<String>,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub payload: ConfigPayload,
    pub payload_hash: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Config {
    /// Eligible for resolution
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Filter for listing configs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFilter {
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

// ============================================================================
// AUDIT
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Enable,
    Disable,
    Rollback,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Enable => "enable",
            AuditAction::Disable => "disable",
            AuditAction::Rollback => "rollback",
        }
    }
}

impl FromStr for AuditAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| EngineError::Storage(format!("unknown audit action '{}'", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Append-only record of one mutating operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub config_id: String,
    pub user_id: String,
    pub action: AuditAction,
    pub previous_version: Option<u32>,
    pub new_version: u32,
    pub diff: Vec<FieldChange>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
    pub previous_hash: Option<String>,
    pub signature: String,
    pub agent_pubkey: String,
}

// ============================================================================
// PREDICTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl SentimentLabel {
    pub const ALL: [SentimentLabel; 4] = [
        SentimentLabel::Positive,
        SentimentLabel::Neutral,
        SentimentLabel::Negative,
        SentimentLabel::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Mixed => "mixed",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            SentimentLabel::Positive => 0,
            SentimentLabel::Neutral => 1,
            SentimentLabel::Negative => 2,
            SentimentLabel::Mixed => 3,
        }
    }

    /// Lenient parse of provider or user supplied labels
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "positive" | "pos" => Some(SentimentLabel::Positive),
            "neutral" | "neu" => Some(SentimentLabel::Neutral),
            "negative" | "neg" => Some(SentimentLabel::Negative),
            "mixed" => Some(SentimentLabel::Mixed),
            _ => None,
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EngineError::Validation(format!("unknown label '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
    Call,
    Ticket,
    #[default]
    Chat,
    Other,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Call => "call",
            Channel::Ticket => "ticket",
            Channel::Chat => "chat",
            Channel::Other => "other",
        }
    }
}

impl FromStr for Channel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| EngineError::Validation(format!("unknown channel '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Angry,
    Frustrated,
    Friendly,
    Formal,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OmittedMetric {
    pub metric: String,
    pub reason: String,
}

/// Secondary signals. A rule that failed is listed in `omitted`, never zeroed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedMetrics {
    pub low_confidence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<Tone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjectivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted: Vec<OmittedMetric>,
}

impl DerivedMetrics {
    pub fn is_omitted(&self, metric: &str) -> bool {
        self.omitted.iter().any(|o| o.metric == metric)
    }
}

/// Canonical output of one classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub config_id: String,
    pub config_version_used: u32,
    pub contact_id: Option<String>,
    pub channel: Channel,
    pub text: String,
    pub label: SentimentLabel,
    pub score: f64,
    pub confidence: f64,
    pub raw_response: serde_json::Value,
    pub derived_metrics: DerivedMetrics,
    pub model_provider: ProviderKind,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub sampled: bool,
    pub created_at: DateTime<Utc>,
}

/// A classification request from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub text: String,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub scope: ScopeContext,
}

// ============================================================================
// FEEDBACK
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Accepted => "accepted",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "accepted" => Ok(ReviewStatus::Accepted),
            "rejected" => Ok(ReviewStatus::Rejected),
            other => Err(EngineError::Validation(format!("unknown review status '{}'", other))),
        }
    }
}

/// A human correction bound to one prediction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub id: String,
    pub prediction_id: String,
    pub config_id: String,
    pub user_label: SentimentLabel,
    pub user_confidence: Option<f64>,
    pub user_id: String,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub included_in_training: bool,
    pub training_batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_chain_skips_unknown_levels() {
        let ctx = ScopeContext {
            workspace_id: Some("ws-1".into()),
            company_id: None,
            campaign_id: Some("camp-9".into()),
            user_id: Some("  ".into()),
        };

        let chain = ctx.chain();
        let scopes: Vec<Scope> = chain.iter().map(|(s, _)| *s).collect();
        assert_eq!(scopes, vec![Scope::Campaign, Scope::Workspace, Scope::Global]);
        assert_eq!(chain[0].1.as_deref(), Some("camp-9"));
        assert!(chain[2].1.is_none());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("Company".parse::<Scope>().unwrap(), Scope::Company);
        assert!(matches!("tenant".parse::<Scope>(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_overlay_is_one_level() {
        let parent = ConfigPayload {
            mode: Some(Mode::Ml),
            thresholds: Some(Thresholds {
                negative: 0.2,
                neutral: 0.4,
                positive: 0.8,
                min_confidence: Some(0.6),
            }),
            sampling: Some(SamplingConfig {
                rate: 0.5,
                strategy: SamplingStrategy::All,
                store_low_confidence: true,
            }),
            ..Default::default()
        };
        let child = ConfigPayload {
            thresholds: Some(Thresholds {
                negative: 0.3,
                neutral: 0.5,
                positive: 0.7,
                min_confidence: None,
            }),
            parent_config_id: Some("parent".into()),
            ..Default::default()
        };

        let merged = child.overlay(&parent);
        assert_eq!(merged.mode, Some(Mode::Ml));
        // Child section wins whole: min_confidence is not pulled from the parent
        assert_eq!(merged.thresholds.unwrap().min_confidence, None);
        assert_eq!(merged.sampling, parent.sampling);
        assert_eq!(merged.parent_config_id.as_deref(), Some("parent"));
    }

    #[test]
    fn test_patch_deserialize_semantics() {
        let update: ConfigUpdate = serde_json::from_str(
            r#"{"thresholds": null, "mode": "ml"}"#,
        )
        .unwrap();
        assert_eq!(update.thresholds, Patch::Unset);
        assert_eq!(update.mode, Patch::Set(Mode::Ml));
        assert!(update.sampling.is_keep());

        let base = ConfigPayload {
            thresholds: Some(Thresholds::default()),
            sampling: Some(SamplingConfig::default()),
            ..Default::default()
        };
        let next = update.apply(&base);
        assert!(next.thresholds.is_none());
        assert_eq!(next.mode, Some(Mode::Ml));
        assert_eq!(next.sampling, base.sampling);
    }

    #[test]
    fn test_keyword_topics_split() {
        let mut rules = KeywordRules::default();
        rules.intents.insert("billing".into(), vec!["invoice".into()]);
        rules.intents.insert("topic:shipping".into(), vec!["delivery".into()]);

        let topics: Vec<&str> = rules.topics().map(|(t, _)| t).collect();
        let intents: Vec<&String> = rules.pure_intents().map(|(k, _)| k).collect();
        assert_eq!(topics, vec!["shipping"]);
        assert_eq!(intents, vec!["billing"]);
    }

    #[test]
    fn test_mode_defaults_from_model() {
        let payload = ConfigPayload {
            model: Some(ModelConfig {
                provider: ProviderKind::Openai,
                model_id: Some("gpt-4o-mini".into()),
                ..ModelConfig::keyword()
            }),
            ..Default::default()
        };
        assert_eq!(payload.mode(), Mode::Ml);
        assert_eq!(payload.model().provider, ProviderKind::Openai);

        let keyword_only = ConfigPayload {
            mode: Some(Mode::Keyword),
            ..payload
        };
        assert_eq!(keyword_only.model().provider, ProviderKind::Keyword);
    }
}
